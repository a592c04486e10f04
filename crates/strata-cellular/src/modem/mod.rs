//! # Modem Driver seam
//!
//! The automaton never speaks AT commands itself. It drives a [`ModemDriver`]
//! implementation (one per modem family) through synchronous calls, and
//! receives asynchronous notifications (URCs, SIM hot-plug, PDN events) as
//! [`Event`](crate::event::Event)s posted by the driver into the sender it was
//! handed at subscription time.
//!
//! All calls go through a [`ModemSession`], which serializes access with a
//! mutex so the automaton and external callers (console, API) never
//! interleave commands on the same modem link.

pub mod sim;

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::config::{OperatorSelection, SimSlotType};
use crate::error::ModemError;
use crate::event::EventSender;

// ─── Driver data types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// SIM access only, radio stays off the network.
    SimOnly,
    Full,
}

/// Per-domain registration state as reported by the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationState {
    NotRegistered,
    RegisteredHome,
    Searching,
    Denied,
    #[default]
    Unknown,
    RegisteredRoaming,
}

impl RegistrationState {
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            RegistrationState::RegisteredHome | RegistrationState::RegisteredRoaming
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTechnology {
    Gsm,
    Umts,
    Lte,
    LteCatM1,
    NbIot,
}

/// Registration across the three domains (circuit-switched, legacy packet,
/// EPS packet).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrationReport {
    pub cs: RegistrationState,
    pub ps: RegistrationState,
    pub eps: RegistrationState,
    pub access_technology: Option<AccessTechnology>,
}

impl RegistrationReport {
    /// Convenience constructor for a modem registered on EPS only.
    pub fn eps(state: RegistrationState) -> Self {
        Self {
            eps: state,
            access_technology: state.is_registered().then_some(AccessTechnology::Lte),
            ..Default::default()
        }
    }
}

/// Raw signal quality on the 0–31 / 99 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalQuality {
    pub rssi: u8,
    pub ber: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub revision: String,
    pub imei: String,
}

/// PDN context parameters pushed to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnContext {
    pub cid: u8,
    /// `None` lets the modem fall back to its own default APN.
    pub apn: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PdnEvent {
    Detached,
    Deactivated,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimEvent {
    Inserted,
    Removed,
    Refresh,
}

/// Timers granted by the network after PSM / eDRX negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiatedTimers {
    pub psm_active_time: Option<Duration>,
    pub psm_periodic_tau: Option<Duration>,
    pub edrx_cycle: Option<Duration>,
}

/// Low-power settings requested from the modem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PsmEdrxConfig {
    pub psm: bool,
    pub edrx: bool,
    pub requested_periodic_tau: Option<Duration>,
    pub requested_active_time: Option<Duration>,
    pub edrx_cycle: Option<Duration>,
}

/// Modem-side events the driver should report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModemEventMask(u16);

impl ModemEventMask {
    pub const BOOT: Self = Self(1 << 0);
    pub const POWER_DOWN: Self = Self(1 << 1);
    pub const FOTA_START: Self = Self(1 << 2);
    pub const FOTA_END: Self = Self(1 << 3);
    pub const LP_ENTER: Self = Self(1 << 4);
    pub const LP_LEAVE: Self = Self(1 << 5);
    pub const LP_WAKEUP_REQUEST: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl std::ops::BitOr for ModemEventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

// ─── Driver trait ───────────────────────────────────────────────────────────

/// Synchronous command surface of one modem family.
///
/// Calls block until the modem answers. Asynchronous notifications are posted
/// to the [`EventSender`] handed over by the `subscribe_*` / `register_*`
/// calls. Low-power and PPP operations default to `Unsupported`.
pub trait ModemDriver: Send {
    fn power_on(&mut self) -> Result<(), ModemError>;
    fn power_off(&mut self) -> Result<(), ModemError>;
    fn reset(&mut self) -> Result<(), ModemError>;
    fn init(&mut self, mode: InitMode) -> Result<(), ModemError>;
    fn select_sim(&mut self, slot: SimSlotType) -> Result<(), ModemError>;
    fn register(&mut self, operator: &OperatorSelection) -> Result<(), ModemError>;
    fn network_status(&mut self) -> Result<RegistrationReport, ModemError>;
    fn operator_name(&mut self) -> Result<String, ModemError>;
    fn device_identity(&mut self) -> Result<DeviceIdentity, ModemError>;
    fn iccid(&mut self) -> Result<String, ModemError>;
    fn imsi(&mut self) -> Result<String, ModemError>;
    fn signal_quality(&mut self) -> Result<SignalQuality, ModemError>;
    fn attach(&mut self) -> Result<(), ModemError>;
    fn detach(&mut self) -> Result<(), ModemError>;
    fn define_pdn(&mut self, pdn: &PdnContext) -> Result<(), ModemError>;
    fn set_default_pdn(&mut self, cid: u8) -> Result<(), ModemError>;
    fn register_pdn_events(&mut self, cid: u8, events: EventSender) -> Result<(), ModemError>;
    fn activate_pdn(&mut self, cid: u8) -> Result<IpAddr, ModemError>;
    fn deactivate_pdn(&mut self, cid: u8) -> Result<(), ModemError>;
    fn suspend_data(&mut self) -> Result<(), ModemError>;
    fn resume_data(&mut self) -> Result<(), ModemError>;
    /// Raw command passthrough. The response is returned verbatim.
    fn raw_command(&mut self, command: &str) -> Result<String, ModemError>;
    fn subscribe_modem_events(
        &mut self,
        mask: ModemEventMask,
        events: EventSender,
    ) -> Result<(), ModemError>;
    fn subscribe_sim_events(&mut self, events: EventSender) -> Result<(), ModemError>;

    /// Starts PPP on `cid`; completion arrives as `PppOpened` / `PppClosed`.
    fn ppp_open(&mut self, _cid: u8) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn ppp_close(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_init(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_set_config(&mut self, _config: &PsmEdrxConfig) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_sleep_request(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_sleep_complete(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_sleep_cancel(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }

    fn lp_wakeup(&mut self) -> Result<(), ModemError> {
        Err(ModemError::Unsupported)
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Shared, serialized handle on the modem.
///
/// The lock is held for exactly one closure call; it is released on every
/// exit path including early returns and panics inside the driver.
#[derive(Clone)]
pub struct ModemSession {
    driver: Arc<Mutex<Box<dyn ModemDriver>>>,
}

impl ModemSession {
    pub fn new(driver: impl ModemDriver + 'static) -> Self {
        Self {
            driver: Arc::new(Mutex::new(Box::new(driver))),
        }
    }

    /// Runs `f` with exclusive access to the driver.
    pub fn call<R>(&self, f: impl FnOnce(&mut dyn ModemDriver) -> R) -> R {
        let mut guard = self.driver.lock().unwrap_or_else(|e| e.into_inner());
        f(guard.as_mut())
    }

    /// Raw command passthrough for console / API callers.
    pub fn raw_command(&self, command: &str) -> Result<String, ModemError> {
        self.call(|m| m.raw_command(command))
    }
}

impl std::fmt::Debug for ModemSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModemSession").finish_non_exhaustive()
    }
}
