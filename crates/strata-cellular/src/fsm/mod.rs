//! # Connectivity automaton
//!
//! Drives the modem from power-on to an active data path and keeps it there.
//! The [`Automaton`] owns the connectivity context, the NFMC state, the power
//! coordinator and the timers; it is the only thing that mutates them, and it
//! runs on a single worker thread fed by the event queue.
//!
//! Dispatch happens in three steps:
//!
//! 1. timer expiries are validated against their arm generation,
//! 2. global events that apply in (almost) any state are handled up front,
//! 3. everything else goes to the handler of the current state. Events a
//!    state does not recognize are ignored.
//!
//! State handlers live in `bringup` (power, SIM, terminal states), `network`
//! (signal and registration) and `data` (PDN, data path, low power, FOTA).

mod bringup;
mod data;
mod network;

use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CellularConfig, TargetState};
use crate::decision::{self, NfmcContext, SignalVerdict, SlotStatus};
use crate::distrib::{
    CellularInfo, DataServiceInfo, Distribution, ModemState, NfmcInfo, Record,
    RecordKey, ServiceState, SignalInfo, SimInfo,
};
use crate::event::{Event, EventQueue, EventSender, MessageClass};
use crate::modem::{
    AccessTechnology, DeviceIdentity, ModemEventMask, ModemSession, PdnContext, PdnEvent,
    RegistrationState, SignalQuality,
};
#[cfg(feature = "low-power")]
use crate::distrib::PowerStatusInfo;
#[cfg(feature = "low-power")]
use crate::power::{PowerContext, PowerCoordinator, WakeOrigin};
use crate::retry::{FailureCause, RetryDecision, RetryPolicy};
use crate::timer::{TimerBackend, TimerKind, Timers};

/// Modem notifications the automaton subscribes to at power-on.
const MODEM_EVENTS: ModemEventMask = ModemEventMask::BOOT
    .union(ModemEventMask::POWER_DOWN)
    .union(ModemEventMask::FOTA_START)
    .union(ModemEventMask::FOTA_END)
    .union(ModemEventMask::LP_ENTER)
    .union(ModemEventMask::LP_LEAVE)
    .union(ModemEventMask::LP_WAKEUP_REQUEST);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectivityState {
    #[default]
    Boot,
    ModemInit,
    ModemReady,
    WaitSignalQuality,
    WaitNetworkStatus,
    NetworkStatusOk,
    ModemRegistered,
    PdnActivating,
    DataReady,
    /// Modem firmware update in progress.
    Reprogramming,
    /// Retry budget exhausted or configuration invalid. Left only on an
    /// explicit reboot request (or power-off).
    Fail,
    SimOnly,
    Reset,
    Reboot,
    Off,
    PowerOnOnly,
    /// Data path handed to the power coordinator.
    PowerDataIdle,
    ApnConfig,
    PppConfigOnGoing,
    PppCloseOnGoing,
    /// SIM wants a PIN or PUK. Retrying would burn attempts, so the
    /// automaton halts here until the modem is powered off.
    Lockout,
}

impl ConnectivityState {
    /// States attached to the packet domain.
    fn is_attached(self) -> bool {
        matches!(
            self,
            ConnectivityState::ModemRegistered
                | ConnectivityState::PdnActivating
                | ConnectivityState::DataReady
                | ConnectivityState::PowerDataIdle
                | ConnectivityState::PppConfigOnGoing
                | ConnectivityState::PppCloseOnGoing
        )
    }

    /// States where an APN change has to be applied right away.
    fn applies_apn_change(self) -> bool {
        matches!(
            self,
            ConnectivityState::WaitSignalQuality
                | ConnectivityState::WaitNetworkStatus
                | ConnectivityState::NetworkStatusOk
                | ConnectivityState::ModemRegistered
                | ConnectivityState::PdnActivating
                | ConnectivityState::DataReady
                | ConnectivityState::PowerDataIdle
                | ConnectivityState::PppConfigOnGoing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartCause {
    FotaComplete,
    FotaTimeout,
}

/// Why the automaton stopped processing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The modem firmware changed: the host should restart the manager.
    Restart(RestartCause),
    Shutdown,
}

/// Everything the automaton knows about the link.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectivityContext {
    pub state: ConnectivityState,
    pub target: TargetState,
    pub fail_cause: Option<FailureCause>,
    /// Set when the automaton stopped on an invalid configuration.
    pub config_error: Option<String>,
    pub retry: RetryPolicy,
    pub modem_powered: bool,
    pub sim_slot_index: usize,
    pub sim_slots: Vec<SlotStatus>,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    pub identity: Option<DeviceIdentity>,
    pub operator: Option<String>,
    pub signal: Option<SignalQuality>,
    pub cs: RegistrationState,
    pub ps: RegistrationState,
    pub eps: RegistrationState,
    pub access_technology: Option<AccessTechnology>,
    pub address: Option<IpAddr>,
    pub last_pdn_event: Option<PdnEvent>,
    pub pdn_tempo_index: usize,
    pub register_tempo_index: usize,
}

impl ConnectivityContext {
    fn new(config: &CellularConfig, target: TargetState, sim_slot_index: usize) -> Self {
        let slot_count = config.sim_slots.len();
        Self {
            state: ConnectivityState::Boot,
            target,
            fail_cause: None,
            config_error: None,
            retry: RetryPolicy::new(config.retry),
            modem_powered: false,
            sim_slot_index: if sim_slot_index < slot_count {
                sim_slot_index
            } else {
                0
            },
            sim_slots: vec![SlotStatus::Unknown; slot_count],
            imsi: None,
            iccid: None,
            identity: None,
            operator: None,
            signal: None,
            cs: RegistrationState::Unknown,
            ps: RegistrationState::Unknown,
            eps: RegistrationState::Unknown,
            access_technology: None,
            address: None,
            last_pdn_event: None,
            pdn_tempo_index: 0,
            register_tempo_index: 0,
        }
    }
}

// ─── Automaton ──────────────────────────────────────────────────────────────

pub struct Automaton {
    ctx: ConnectivityContext,
    nfmc: NfmcContext,
    #[cfg(feature = "low-power")]
    power: PowerCoordinator,
    config: Arc<CellularConfig>,
    modem: ModemSession,
    board: Arc<dyn Distribution>,
    timers: Timers,
    queue: EventQueue,
    events: EventSender,
    /// Resolved PDN parameters for the active slot.
    pdn: Option<PdnContext>,
    /// State interrupted by an APN change.
    apn_resume: Option<ConnectivityState>,
    exit: Option<ExitReason>,
}

impl Automaton {
    pub fn new(
        modem: ModemSession,
        board: Arc<dyn Distribution>,
        timers: Box<dyn TimerBackend>,
        queue: EventQueue,
    ) -> Self {
        let config = board.cellular_config();
        let target = board.target_state();
        // The active slot survives restarts through the published SIM record.
        let slot_index = match board.read(RecordKey::Sim) {
            Some(Record::Sim(info)) => info.active_slot,
            _ => 0,
        };
        let events = queue.sender();
        Self {
            ctx: ConnectivityContext::new(&config, target, slot_index),
            nfmc: NfmcContext::default(),
            #[cfg(feature = "low-power")]
            power: PowerCoordinator::new(),
            config,
            modem,
            board,
            timers: Timers::new(timers),
            queue,
            events,
            pdn: None,
            apn_resume: None,
            exit: None,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn state(&self) -> ConnectivityState {
        self.ctx.state
    }

    pub fn context(&self) -> &ConnectivityContext {
        &self.ctx
    }

    pub fn nfmc(&self) -> &NfmcContext {
        &self.nfmc
    }

    #[cfg(feature = "low-power")]
    pub fn power_context(&self) -> PowerContext {
        self.power.context()
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit
    }

    /// Queues the boot event.
    pub fn start(&mut self) {
        self.post(Event::Boot);
    }

    /// Host-initiated stop: powers the modem down and stops dispatching.
    pub fn shutdown(&mut self) {
        if self.exit.is_some() {
            return;
        }
        info!(state = ?self.ctx.state, "shutting down");
        self.publish_cellular(ServiceState::ShuttingDown);
        self.power_down();
        self.exit = Some(ExitReason::Shutdown);
    }

    /// Dispatches queued events until the queue is empty or the automaton
    /// exits. Returns the number of events processed.
    pub fn run_pending(&mut self) -> usize {
        let mut processed = 0;
        while self.exit.is_none() {
            let Some(event) = self.queue.try_next() else {
                break;
            };
            self.dispatch(event);
            processed += 1;
        }
        processed
    }

    pub fn dispatch(&mut self, event: Event) {
        if self.exit.is_some() {
            trace!(?event, "automaton stopped, dropping event");
            return;
        }

        let event = match event {
            Event::Timer(fired) => match self.timers.accept(fired) {
                Some(event) => event,
                None => return,
            },
            other => other,
        };

        match event.class() {
            MessageClass::Notification => self.refresh_config(),
            MessageClass::Command => info!(?event, state = ?self.ctx.state, "command"),
            MessageClass::Service => trace!(?event, state = ?self.ctx.state, "event"),
        }

        let Some(event) = self.pre_dispatch(event) else {
            return;
        };

        use ConnectivityState as S;
        let state = self.ctx.state;
        let handled = match state {
            S::Boot => self.on_boot(&event),
            S::ModemInit => self.on_modem_init(&event),
            S::ModemReady => self.on_modem_ready(&event),
            S::WaitSignalQuality => self.on_wait_signal(&event),
            S::WaitNetworkStatus => self.on_wait_network(&event),
            S::NetworkStatusOk => self.on_network_ok(&event),
            S::ModemRegistered => self.on_registered(&event),
            S::PdnActivating => self.on_pdn_activating(&event),
            S::DataReady => self.on_data_ready(&event),
            S::Reprogramming => self.on_reprogramming(&event),
            S::Fail => self.on_fail(&event),
            S::SimOnly | S::PowerOnOnly => self.on_parked(&event),
            S::Reset | S::Reboot => self.on_restart(&event),
            S::Off => self.on_off(&event),
            S::PowerDataIdle => self.on_power_idle(&event),
            S::ApnConfig => self.on_apn_config(&event),
            S::PppConfigOnGoing => self.on_ppp_opening(&event),
            S::PppCloseOnGoing => self.on_ppp_closing(&event),
            S::Lockout => self.on_lockout(&event),
        };
        if !handled {
            debug!(?state, ?event, "event ignored");
        }
    }

    /// Events whose effect does not depend on (most of) the current state.
    /// Returns the event to hand to the state handler, if any.
    fn pre_dispatch(&mut self, event: Event) -> Option<Event> {
        use ConnectivityState as S;
        let state = self.ctx.state;
        match event {
            Event::ApnConfig => {
                if !self.ctx.modem_powered || !state.applies_apn_change() {
                    debug!(?state, "APN change will apply at next init");
                    return None;
                }
                self.apn_resume = Some(state);
                self.set_state(S::ApnConfig);
                Some(Event::ApnConfig)
            }
            Event::ModemInit
                if !matches!(
                    state,
                    S::Boot
                        | S::ModemInit
                        | S::Off
                        | S::Fail
                        | S::Lockout
                        | S::Reprogramming
                        | S::Reset
                        | S::Reboot
                ) =>
            {
                info!(?state, "modem re-initialization requested");
                self.data_down();
                self.set_state(S::ModemInit);
                Some(Event::ModemInit)
            }
            Event::SimReset(sim) => {
                if !self.ctx.modem_powered
                    || matches!(
                        state,
                        S::Off | S::Fail | S::Lockout | S::Reprogramming | S::Reset | S::Reboot
                    )
                {
                    debug!(?sim, ?state, "SIM event ignored");
                    return None;
                }
                info!(?sim, "SIM changed, resetting modem");
                self.nfmc.invalidate();
                self.data_down();
                self.set_state(S::Reset);
                Some(Event::SimReset(sim))
            }
            #[cfg(feature = "low-power")]
            Event::PowerStatusCallback(timers) => {
                debug!(?timers, "network granted power timers");
                self.publish(Record::PowerStatus(PowerStatusInfo {
                    state: ServiceState::On,
                    timers,
                }));
                None
            }
            #[cfg(feature = "low-power")]
            Event::LpInactivity => {
                if state == S::DataReady {
                    self.request_idle();
                }
                None
            }
            #[cfg(feature = "low-power")]
            Event::PowerConfigChanged => {
                self.apply_power_config();
                None
            }
            other => Some(other),
        }
    }

    /// Handling shared by every state with a running modem.
    fn on_common(&mut self, event: &Event) -> bool {
        match event {
            Event::TargetStateCmd => {
                self.apply_target();
                true
            }
            Event::FotaStart => {
                self.enter_fota();
                true
            }
            Event::ModemReset | Event::ModemReboot | Event::ModemPowerDown => {
                warn!(?event, state = ?self.ctx.state, "modem restarted unexpectedly");
                if *event == Event::ModemPowerDown {
                    self.ctx.modem_powered = false;
                }
                self.fail(FailureCause::Reset);
                true
            }
            Event::RebootModem => {
                info!("modem reboot requested");
                self.set_state(ConnectivityState::Reboot);
                self.on_restart(event)
            }
            _ => false,
        }
    }

    // ─── Shared transitions ─────────────────────────────────────────────

    /// Changes state, stopping the timers owned by the state being left.
    fn set_state(&mut self, next: ConnectivityState) {
        use ConnectivityState as S;
        let prev = self.ctx.state;
        if prev == next {
            return;
        }
        match prev {
            S::ModemInit => self.timers.stop(TimerKind::RegisterBackoff),
            S::WaitNetworkStatus => self.timers.stop(TimerKind::Registration),
            S::PdnActivating => self.timers.stop(TimerKind::PdnRetry),
            S::Reprogramming => self.timers.stop(TimerKind::Fota),
            S::PppCloseOnGoing => self.timers.stop(TimerKind::PppClose),
            #[cfg(feature = "low-power")]
            S::DataReady => self.timers.stop(TimerKind::LpInactivity),
            #[cfg(feature = "low-power")]
            S::PowerDataIdle => {
                // Leaving for anything but DataReady: bring the modem back first.
                self.power
                    .wakeup(WakeOrigin::Host, &self.modem, &mut self.timers);
            }
            _ => {}
        }
        info!(from = ?prev, to = ?next, "state transition");
        self.ctx.state = next;
    }

    /// Counts a failure and either reboots the modem or gives up.
    fn fail(&mut self, cause: FailureCause) {
        self.ctx.fail_cause = Some(cause);
        let decision = self.ctx.retry.record(cause);
        warn!(
            %cause,
            count = self.ctx.retry.count(cause),
            global = self.ctx.retry.global(),
            ?decision,
            "connectivity failure"
        );
        self.data_down();
        self.publish_cellular(ServiceState::Unavailable);
        match decision {
            RetryDecision::Reboot => {
                self.set_state(ConnectivityState::Reboot);
                self.post(Event::RebootModem);
            }
            RetryDecision::Fail => self.enter_fail(),
        }
    }

    fn enter_fail(&mut self) {
        error!(
            cause = ?self.ctx.fail_cause,
            config_error = ?self.ctx.config_error,
            "connectivity failed, waiting for a reboot request"
        );
        self.timers.stop(TimerKind::Polling);
        self.set_state(ConnectivityState::Fail);
        self.publish_cellular(ServiceState::Fail);
    }

    fn ensure_polling(&mut self) {
        if !self.timers.is_armed(TimerKind::Polling) {
            self.timers
                .start(TimerKind::Polling, self.config.polling_period);
        }
    }

    fn post(&self, event: Event) {
        self.events.post(event);
    }

    fn refresh_config(&mut self) {
        self.config = self.board.cellular_config();
        self.ctx.target = self.board.target_state();
        self.ctx.retry.set_limits(self.config.retry);
        let slot_count = self.config.sim_slots.len();
        if self.ctx.sim_slots.len() != slot_count {
            self.ctx.sim_slots.resize(slot_count, SlotStatus::Unknown);
            if self.ctx.sim_slot_index >= slot_count {
                self.ctx.sim_slot_index = 0;
            }
        }
    }

    /// Marks the data path down, publishing once.
    fn data_down(&mut self) {
        if self.ctx.address.take().is_some() {
            info!("data path down");
            self.publish_data(ServiceState::Unavailable);
        }
    }

    fn power_off_modem(&mut self) {
        if let Err(e) = self.modem.call(|m| m.power_off()) {
            warn!(error = %e, "modem power-off failed");
        }
        self.ctx.modem_powered = false;
        self.ctx.imsi = None;
        #[cfg(feature = "low-power")]
        self.power.disable(&mut self.timers);
    }

    // ─── Publishing ─────────────────────────────────────────────────────

    fn publish(&self, record: Record) {
        self.board.publish(record);
    }

    fn modem_state(&self) -> ModemState {
        use ConnectivityState as S;
        match self.ctx.state {
            S::Reprogramming => ModemState::Reprogramming,
            S::Fail => ModemState::Failed,
            S::Lockout => ModemState::Locked,
            S::DataReady | S::PowerDataIdle => ModemState::DataReady,
            S::NetworkStatusOk | S::ModemRegistered | S::PdnActivating | S::PppConfigOnGoing => {
                ModemState::Registered
            }
            _ if !self.ctx.modem_powered => ModemState::Off,
            _ if self.ctx.imsi.is_some() => ModemState::SimReady,
            _ => ModemState::PoweredOn,
        }
    }

    fn publish_cellular(&self, state: ServiceState) {
        self.publish(Record::Cellular(CellularInfo {
            state,
            modem_state: self.modem_state(),
            identity: self.ctx.identity.clone(),
            operator: self.ctx.operator.clone(),
            address: self.ctx.address,
        }));
    }

    fn publish_sim(&self, state: ServiceState) {
        self.publish(Record::Sim(SimInfo {
            state,
            imsi: self.ctx.imsi.clone(),
            iccid: self.ctx.iccid.clone(),
            active_slot: self.ctx.sim_slot_index,
            slots: self.ctx.sim_slots.clone(),
        }));
    }

    fn publish_signal(&self) {
        let Some(quality) = self.ctx.signal else {
            return;
        };
        let state = match decision::evaluate_signal(quality) {
            SignalVerdict::Usable => ServiceState::On,
            _ => ServiceState::Unavailable,
        };
        self.publish(Record::Signal(SignalInfo {
            state,
            rssi: quality.rssi,
            dbm: decision::rssi_to_dbm(quality.rssi),
            ber: quality.ber,
            access_technology: self.ctx.access_technology,
        }));
    }

    /// Data service and network interface records move together.
    fn publish_data(&self, state: ServiceState) {
        let info = DataServiceInfo {
            state,
            address: self.ctx.address,
        };
        self.publish(Record::DataService(info.clone()));
        self.publish(Record::NetworkInterface(info));
    }

    fn publish_nfmc(&self) {
        self.publish(Record::Nfmc(NfmcInfo {
            state: ServiceState::On,
            active: self.nfmc.active,
            tempos_ms: self
                .nfmc
                .tempos
                .iter()
                .map(|t| t.as_millis() as u64)
                .collect(),
        }));
    }
}
