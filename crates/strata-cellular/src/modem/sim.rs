//! In-process modem used by the daemon's `--simulate` mode and by tests.
//!
//! Behaviour is scripted: individual calls can be made to fail once, N times
//! or always; SIM slots can be given an error; signal and registration
//! readings can be queued. Every call is recorded so tests can assert on
//! ordering ("no PDN activation after power-off").

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::trace;

use super::{
    DeviceIdentity, InitMode, ModemDriver, ModemEventMask, PdnContext, PdnEvent, PsmEdrxConfig,
    RegistrationReport, RegistrationState, SignalQuality, SimEvent,
};
use crate::config::{OperatorSelection, SimSlotType};
use crate::error::ModemError;
use crate::event::{Event, EventSender};

/// Driver entry points, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModemCall {
    PowerOn,
    PowerOff,
    Reset,
    Init,
    SelectSim,
    Register,
    NetworkStatus,
    OperatorName,
    DeviceIdentity,
    Iccid,
    Imsi,
    SignalQuality,
    Attach,
    Detach,
    DefinePdn,
    SetDefaultPdn,
    RegisterPdnEvents,
    ActivatePdn,
    DeactivatePdn,
    SuspendData,
    ResumeData,
    RawCommand,
    SubscribeModemEvents,
    SubscribeSimEvents,
    PppOpen,
    PppClose,
    LpInit,
    LpSetConfig,
    LpSleepRequest,
    LpSleepComplete,
    LpSleepCancel,
    LpWakeup,
}

impl ModemCall {
    /// Calls a powered-off modem still answers.
    fn needs_power(self) -> bool {
        !matches!(
            self,
            ModemCall::PowerOn
                | ModemCall::PowerOff
                | ModemCall::Reset
                | ModemCall::SubscribeModemEvents
                | ModemCall::SubscribeSimEvents
                | ModemCall::RegisterPdnEvents
        )
    }
}

enum Scripted {
    Times(u32, ModemError),
    Always(ModemError),
}

struct Script {
    powered: bool,
    selected_slot: Option<SimSlotType>,
    failures: HashMap<ModemCall, Scripted>,
    sim_errors: HashMap<SimSlotType, ModemError>,
    identity: DeviceIdentity,
    imsi: String,
    iccid: String,
    operator: String,
    signal: SignalQuality,
    signal_queue: VecDeque<SignalQuality>,
    registration: RegistrationReport,
    registration_queue: VecDeque<RegistrationReport>,
    address: IpAddr,
    auto_sleep: bool,
    calls: Vec<ModemCall>,
    raw_commands: Vec<String>,
    modem_events: Option<(ModemEventMask, EventSender)>,
    sim_events: Option<EventSender>,
    pdn_events: Option<(u8, EventSender)>,
    defined_pdn: Option<PdnContext>,
    lp_config: Option<PsmEdrxConfig>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            powered: false,
            selected_slot: None,
            failures: HashMap::new(),
            sim_errors: HashMap::new(),
            identity: DeviceIdentity {
                manufacturer: "Strata".into(),
                model: "SIM-LTE1".into(),
                revision: "1.0.0".into(),
                imei: "359000000000001".into(),
            },
            imsi: "208011234567890".into(),
            iccid: "8933010000000000001".into(),
            operator: "Orange F".into(),
            signal: SignalQuality { rssi: 20, ber: 0 },
            signal_queue: VecDeque::new(),
            registration: RegistrationReport::eps(RegistrationState::RegisteredHome),
            registration_queue: VecDeque::new(),
            address: IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2)),
            auto_sleep: false,
            calls: Vec::new(),
            raw_commands: Vec::new(),
            modem_events: None,
            sim_events: None,
            pdn_events: None,
            defined_pdn: None,
            lp_config: None,
        }
    }
}

impl Script {
    /// Logs the call and applies any scripted failure.
    fn enter(&mut self, call: ModemCall) -> Result<(), ModemError> {
        trace!(?call, "simulated modem call");
        self.calls.push(call);

        let scripted = match self.failures.get_mut(&call) {
            Some(Scripted::Always(err)) => Some((err.clone(), false)),
            Some(Scripted::Times(n, err)) => {
                *n = n.saturating_sub(1);
                Some((err.clone(), *n == 0))
            }
            None => None,
        };
        if let Some((err, exhausted)) = scripted {
            if exhausted {
                self.failures.remove(&call);
            }
            return Err(err);
        }
        if call.needs_power() && !self.powered {
            return Err(ModemError::Timeout);
        }
        Ok(())
    }

    #[cfg(feature = "low-power")]
    fn complete_sleep(&self) {
        if self.auto_sleep {
            self.post_modem_event(ModemEventMask::LP_ENTER, Event::SleepComplete);
        }
    }

    #[cfg(not(feature = "low-power"))]
    fn complete_sleep(&self) {}

    fn post_modem_event(&self, bit: ModemEventMask, event: Event) {
        if let Some((mask, tx)) = &self.modem_events {
            if mask.contains(bit) {
                tx.post(event);
            }
        }
    }
}

/// Scriptable modem. Clones share the same script and call log.
#[derive(Clone, Default)]
pub struct SimulatedModem {
    inner: Arc<Mutex<Script>>,
}

impl SimulatedModem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Scripting ───────────────────────────────────────────────────

    /// The next `times` invocations of `call` fail with `error`.
    pub fn fail_next(&self, call: ModemCall, times: u32, error: ModemError) {
        if times > 0 {
            self.lock().failures.insert(call, Scripted::Times(times, error));
        }
    }

    pub fn fail_always(&self, call: ModemCall, error: ModemError) {
        self.lock().failures.insert(call, Scripted::Always(error));
    }

    pub fn clear_failure(&self, call: ModemCall) {
        self.lock().failures.remove(&call);
    }

    /// SIM initialization on `slot` fails with `error`.
    pub fn set_sim_error(&self, slot: SimSlotType, error: ModemError) {
        self.lock().sim_errors.insert(slot, error);
    }

    pub fn clear_sim_error(&self, slot: SimSlotType) {
        self.lock().sim_errors.remove(&slot);
    }

    pub fn set_imsi(&self, imsi: &str) {
        self.lock().imsi = imsi.to_string();
    }

    pub fn set_address(&self, address: IpAddr) {
        self.lock().address = address;
    }

    /// Reading returned once the queue is drained.
    pub fn set_signal(&self, rssi: u8) {
        self.lock().signal = SignalQuality { rssi, ber: 0 };
    }

    pub fn push_signal(&self, rssi: u8) {
        self.lock()
            .signal_queue
            .push_back(SignalQuality { rssi, ber: 0 });
    }

    pub fn set_registration(&self, report: RegistrationReport) {
        self.lock().registration = report;
    }

    pub fn push_registration(&self, report: RegistrationReport) {
        self.lock().registration_queue.push_back(report);
    }

    /// Sleep requests complete on their own, as a real modem would signal.
    pub fn set_auto_sleep(&self, enabled: bool) {
        self.lock().auto_sleep = enabled;
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn calls(&self) -> Vec<ModemCall> {
        self.lock().calls.clone()
    }

    pub fn count(&self, call: ModemCall) -> usize {
        self.lock().calls.iter().filter(|c| **c == call).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn raw_commands(&self) -> Vec<String> {
        self.lock().raw_commands.clone()
    }

    pub fn is_powered(&self) -> bool {
        self.lock().powered
    }

    pub fn selected_slot(&self) -> Option<SimSlotType> {
        self.lock().selected_slot
    }

    pub fn defined_pdn(&self) -> Option<PdnContext> {
        self.lock().defined_pdn.clone()
    }

    pub fn lp_config(&self) -> Option<PsmEdrxConfig> {
        self.lock().lp_config
    }

    // ── Unsolicited notifications ───────────────────────────────────

    /// Posts an arbitrary event through the modem-event subscription.
    /// Returns `false` if nobody subscribed or the queue dropped it.
    pub fn inject(&self, event: Event) -> bool {
        match &self.lock().modem_events {
            Some((_, tx)) => tx.post(event),
            None => false,
        }
    }

    pub fn inject_sim(&self, event: SimEvent) -> bool {
        match &self.lock().sim_events {
            Some(tx) => tx.post(Event::SimReset(event)),
            None => false,
        }
    }

    pub fn inject_pdn(&self, event: PdnEvent) -> bool {
        match &self.lock().pdn_events {
            Some((_, tx)) => tx.post(Event::NetworkCallback(event)),
            None => false,
        }
    }
}

impl ModemDriver for SimulatedModem {
    fn power_on(&mut self) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::PowerOn)?;
        s.powered = true;
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::PowerOff)?;
        s.powered = false;
        s.selected_slot = None;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::Reset)?;
        s.powered = true;
        s.post_modem_event(ModemEventMask::BOOT, Event::ModemReboot);
        Ok(())
    }

    fn init(&mut self, _mode: InitMode) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::Init)?;
        if let Some(err) = s.selected_slot.and_then(|slot| s.sim_errors.get(&slot)) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn select_sim(&mut self, slot: SimSlotType) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::SelectSim)?;
        s.selected_slot = Some(slot);
        Ok(())
    }

    fn register(&mut self, _operator: &OperatorSelection) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::Register)
    }

    fn network_status(&mut self) -> Result<RegistrationReport, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::NetworkStatus)?;
        Ok(s.registration_queue.pop_front().unwrap_or(s.registration))
    }

    fn operator_name(&mut self) -> Result<String, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::OperatorName)?;
        Ok(s.operator.clone())
    }

    fn device_identity(&mut self) -> Result<DeviceIdentity, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::DeviceIdentity)?;
        Ok(s.identity.clone())
    }

    fn iccid(&mut self) -> Result<String, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::Iccid)?;
        Ok(s.iccid.clone())
    }

    fn imsi(&mut self) -> Result<String, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::Imsi)?;
        Ok(s.imsi.clone())
    }

    fn signal_quality(&mut self) -> Result<SignalQuality, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::SignalQuality)?;
        Ok(s.signal_queue.pop_front().unwrap_or(s.signal))
    }

    fn attach(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::Attach)
    }

    fn detach(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::Detach)
    }

    fn define_pdn(&mut self, pdn: &PdnContext) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::DefinePdn)?;
        s.defined_pdn = Some(pdn.clone());
        Ok(())
    }

    fn set_default_pdn(&mut self, _cid: u8) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::SetDefaultPdn)
    }

    fn register_pdn_events(&mut self, cid: u8, events: EventSender) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::RegisterPdnEvents)?;
        s.pdn_events = Some((cid, events));
        Ok(())
    }

    fn activate_pdn(&mut self, _cid: u8) -> Result<IpAddr, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::ActivatePdn)?;
        Ok(s.address)
    }

    fn deactivate_pdn(&mut self, _cid: u8) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::DeactivatePdn)
    }

    fn suspend_data(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::SuspendData)
    }

    fn resume_data(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::ResumeData)
    }

    fn raw_command(&mut self, command: &str) -> Result<String, ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::RawCommand)?;
        s.raw_commands.push(command.to_string());
        Ok("OK".to_string())
    }

    fn subscribe_modem_events(
        &mut self,
        mask: ModemEventMask,
        events: EventSender,
    ) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::SubscribeModemEvents)?;
        s.modem_events = Some((mask, events));
        Ok(())
    }

    fn subscribe_sim_events(&mut self, events: EventSender) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::SubscribeSimEvents)?;
        s.sim_events = Some(events);
        Ok(())
    }

    fn ppp_open(&mut self, _cid: u8) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::PppOpen)?;
        if let Some((_, tx)) = &s.modem_events {
            tx.post(Event::PppOpened);
        }
        Ok(())
    }

    fn ppp_close(&mut self) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::PppClose)?;
        if let Some((_, tx)) = &s.modem_events {
            tx.post(Event::PppClosed);
        }
        Ok(())
    }

    fn lp_init(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::LpInit)
    }

    fn lp_set_config(&mut self, config: &PsmEdrxConfig) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::LpSetConfig)?;
        s.lp_config = Some(*config);
        Ok(())
    }

    fn lp_sleep_request(&mut self) -> Result<(), ModemError> {
        let mut s = self.lock();
        s.enter(ModemCall::LpSleepRequest)?;
        s.complete_sleep();
        Ok(())
    }

    fn lp_sleep_complete(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::LpSleepComplete)
    }

    fn lp_sleep_cancel(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::LpSleepCancel)
    }

    fn lp_wakeup(&mut self) -> Result<(), ModemError> {
        self.lock().enter(ModemCall::LpWakeup)
    }
}
