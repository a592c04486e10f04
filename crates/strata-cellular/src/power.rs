//! # Power coordinator
//!
//! Secondary state machine negotiating PSM / eDRX sleep with the modem while
//! the data path is up. It never changes the connectivity state itself:
//! every operation returns a [`PowerNotice`] that the connectivity automaton
//! applies to its own state. The automaton is the only caller.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PowerConfig, PowerMode};
use crate::error::ModemError;
use crate::modem::{ModemSession, PsmEdrxConfig};
use crate::timer::{TimerKind, Timers};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    /// Low-power support not initialized (modem off, or unsupported).
    #[default]
    Disabled,
    /// Awake, data plane live.
    Inactive,
    /// Sleep requested, waiting for the modem to confirm.
    Ongoing,
    /// Modem asleep.
    Active,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PowerContext {
    pub current: PowerState,
    pub target: PowerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeOrigin {
    Host,
    Modem,
}

/// What the connectivity automaton must do after a coordinator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerNotice {
    /// Sleep negotiation started: park in `PowerDataIdle`.
    IdleRequested,
    /// The modem confirmed it is asleep.
    Asleep,
    /// The data plane is live again: return to `DataReady`.
    DataResumed,
    /// Nothing to do in the current power state.
    Ignored,
}

impl PowerMode {
    /// Whether this mode ever asks the modem to sleep.
    pub fn wants_sleep(self) -> bool {
        self >= PowerMode::Balanced
    }

    /// PSM / eDRX settings requested for this mode.
    pub fn psm_edrx(self) -> PsmEdrxConfig {
        let secs = |s: u64| Some(Duration::from_secs(s));
        match self {
            PowerMode::RealTime | PowerMode::LowLatency => PsmEdrxConfig::default(),
            PowerMode::Balanced => PsmEdrxConfig {
                edrx: true,
                edrx_cycle: Some(Duration::from_millis(5_120)),
                ..Default::default()
            },
            PowerMode::Efficient => PsmEdrxConfig {
                edrx: true,
                edrx_cycle: Some(Duration::from_millis(20_480)),
                ..Default::default()
            },
            PowerMode::LowPower => PsmEdrxConfig {
                psm: true,
                edrx: true,
                requested_periodic_tau: secs(60 * 60),
                requested_active_time: secs(60),
                edrx_cycle: Some(Duration::from_millis(81_920)),
            },
            PowerMode::VeryLowPower => PsmEdrxConfig {
                psm: true,
                requested_periodic_tau: secs(4 * 60 * 60),
                requested_active_time: secs(10),
                ..Default::default()
            },
            PowerMode::UltraLowPower => PsmEdrxConfig {
                psm: true,
                requested_periodic_tau: secs(24 * 60 * 60),
                requested_active_time: secs(2),
                ..Default::default()
            },
        }
    }
}

pub struct PowerCoordinator {
    ctx: PowerContext,
    mode: PowerMode,
}

impl PowerCoordinator {
    pub fn new() -> Self {
        Self {
            ctx: PowerContext::default(),
            mode: PowerMode::RealTime,
        }
    }

    pub fn context(&self) -> PowerContext {
        self.ctx
    }

    pub fn state(&self) -> PowerState {
        self.ctx.current
    }

    /// Whether the data path may be handed to the coordinator at all.
    pub fn can_idle(&self) -> bool {
        self.ctx.current == PowerState::Inactive && self.mode.wants_sleep()
    }

    fn set(&mut self, current: PowerState) {
        if self.ctx.current != current {
            debug!(from = ?self.ctx.current, to = ?current, "power state");
        }
        self.ctx.current = current;
        self.ctx.target = current;
    }

    /// Initializes low-power support once the modem is up.
    ///
    /// `Unsupported` leaves the coordinator disabled and is not an error.
    pub fn enable(&mut self, modem: &ModemSession, config: &PowerConfig) -> Result<(), ModemError> {
        match modem.call(|m| m.lp_init()) {
            Ok(()) => {}
            Err(ModemError::Unsupported) => {
                debug!("modem has no low-power support");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.set(PowerState::Inactive);
        self.apply_config(modem, config)
    }

    /// The modem lost power: nothing can be asleep any more.
    pub fn disable(&mut self, timers: &mut Timers) {
        timers.stop(TimerKind::LpProtection);
        self.set(PowerState::Disabled);
    }

    /// Pushes a new power mode. Ignored while disabled; picked up by the
    /// next `enable`.
    pub fn set_power_config(
        &mut self,
        modem: &ModemSession,
        config: &PowerConfig,
    ) -> Result<(), ModemError> {
        if self.ctx.current == PowerState::Disabled {
            self.mode = config.mode;
            return Ok(());
        }
        self.apply_config(modem, config)
    }

    fn apply_config(&mut self, modem: &ModemSession, config: &PowerConfig) -> Result<(), ModemError> {
        self.mode = config.mode;
        let settings = config.mode.psm_edrx();
        info!(mode = ?config.mode, psm = settings.psm, edrx = settings.edrx, "applying power config");
        modem.call(|m| m.lp_set_config(&settings))
    }

    /// Starts idling the data link. The protection timer bounds how long the
    /// modem may take to confirm.
    pub fn request_idle(
        &mut self,
        modem: &ModemSession,
        timers: &mut Timers,
        timeout: Duration,
    ) -> PowerNotice {
        if !self.can_idle() {
            return PowerNotice::Ignored;
        }
        self.ctx.target = PowerState::Active;

        if let Err(e) = modem.call(|m| m.suspend_data()) {
            warn!(error = %e, "cannot suspend data plane, staying awake");
            self.set(PowerState::Inactive);
            return PowerNotice::DataResumed;
        }

        timers.start(TimerKind::LpProtection, timeout);
        if let Err(e) = modem.call(|m| m.lp_sleep_request()) {
            warn!(error = %e, "sleep request rejected");
            timers.stop(TimerKind::LpProtection);
            self.resume(modem);
            return PowerNotice::DataResumed;
        }

        self.ctx.current = PowerState::Ongoing;
        debug!("sleep requested");
        PowerNotice::IdleRequested
    }

    /// The modem confirmed the sleep request.
    pub fn complete(&mut self, modem: &ModemSession, timers: &mut Timers) -> PowerNotice {
        if self.ctx.current != PowerState::Ongoing {
            return PowerNotice::Ignored;
        }
        timers.stop(TimerKind::LpProtection);
        if let Err(e) = modem.call(|m| m.lp_sleep_complete()) {
            warn!(error = %e, "sleep completion failed, waking up");
            self.resume(modem);
            return PowerNotice::DataResumed;
        }
        self.set(PowerState::Active);
        info!("modem asleep");
        PowerNotice::Asleep
    }

    /// Sleep aborted by the modem, or the protection timer expired.
    pub fn cancel(&mut self, modem: &ModemSession, timers: &mut Timers) -> PowerNotice {
        match self.ctx.current {
            PowerState::Ongoing => {
                timers.stop(TimerKind::LpProtection);
                if let Err(e) = modem.call(|m| m.lp_sleep_cancel()) {
                    debug!(error = %e, "sleep cancel");
                }
                self.resume(modem);
                PowerNotice::DataResumed
            }
            PowerState::Active => self.wakeup(WakeOrigin::Modem, modem, timers),
            _ => PowerNotice::Ignored,
        }
    }

    pub fn wakeup(
        &mut self,
        origin: WakeOrigin,
        modem: &ModemSession,
        timers: &mut Timers,
    ) -> PowerNotice {
        if !matches!(self.ctx.current, PowerState::Ongoing | PowerState::Active) {
            return PowerNotice::Ignored;
        }
        timers.stop(TimerKind::LpProtection);
        if origin == WakeOrigin::Host {
            if let Err(e) = modem.call(|m| m.lp_wakeup()) {
                warn!(error = %e, "host wakeup failed");
            }
        }
        info!(?origin, "modem awake");
        self.resume(modem);
        PowerNotice::DataResumed
    }

    fn resume(&mut self, modem: &ModemSession) {
        if let Err(e) = modem.call(|m| m.resume_data()) {
            warn!(error = %e, "cannot resume data plane");
        }
        self.set(PowerState::Inactive);
    }
}

impl Default for PowerCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::sim::{ModemCall, SimulatedModem};
    use crate::modem::ModemDriver;
    use crate::timer::ManualTimers;

    fn setup(mode: PowerMode) -> (PowerCoordinator, SimulatedModem, ModemSession, Timers, ManualTimers) {
        let mut sim = SimulatedModem::new();
        sim.power_on().unwrap();
        let session = ModemSession::new(sim.clone());
        let manual = ManualTimers::new();
        let timers = Timers::new(Box::new(manual.clone()));
        let mut coordinator = PowerCoordinator::new();
        let config = PowerConfig {
            mode,
            ..Default::default()
        };
        coordinator.enable(&session, &config).unwrap();
        (coordinator, sim, session, timers, manual)
    }

    #[test]
    fn enable_pushes_mode() {
        let (coordinator, sim, ..) = setup(PowerMode::LowPower);
        assert_eq!(coordinator.state(), PowerState::Inactive);
        let lp = sim.lp_config().unwrap();
        assert!(lp.psm);
        assert_eq!(lp.requested_active_time, Some(Duration::from_secs(60)));
    }

    #[test]
    fn unsupported_modem_stays_disabled() {
        let mut sim = SimulatedModem::new();
        sim.power_on().unwrap();
        sim.fail_always(ModemCall::LpInit, ModemError::Unsupported);
        let session = ModemSession::new(sim);
        let mut coordinator = PowerCoordinator::new();
        coordinator.enable(&session, &PowerConfig::default()).unwrap();
        assert_eq!(coordinator.state(), PowerState::Disabled);
    }

    #[test]
    fn idle_then_complete_then_host_wakeup() {
        let (mut c, sim, session, mut timers, manual) = setup(PowerMode::LowPower);

        let notice = c.request_idle(&session, &mut timers, Duration::from_secs(30));
        assert_eq!(notice, PowerNotice::IdleRequested);
        assert_eq!(c.state(), PowerState::Ongoing);
        assert_eq!(c.context().target, PowerState::Active);
        assert!(manual.is_armed(TimerKind::LpProtection));
        assert_eq!(sim.count(ModemCall::SuspendData), 1);

        assert_eq!(c.complete(&session, &mut timers), PowerNotice::Asleep);
        assert_eq!(c.state(), PowerState::Active);
        assert!(!manual.is_armed(TimerKind::LpProtection));

        assert_eq!(
            c.wakeup(WakeOrigin::Host, &session, &mut timers),
            PowerNotice::DataResumed
        );
        assert_eq!(c.state(), PowerState::Inactive);
        assert_eq!(sim.count(ModemCall::LpWakeup), 1);
        assert_eq!(sim.count(ModemCall::ResumeData), 1);
    }

    #[test]
    fn protection_timeout_cancels() {
        let (mut c, sim, session, mut timers, _) = setup(PowerMode::Efficient);
        c.request_idle(&session, &mut timers, Duration::from_secs(5));
        assert_eq!(c.cancel(&session, &mut timers), PowerNotice::DataResumed);
        assert_eq!(c.state(), PowerState::Inactive);
        assert_eq!(sim.count(ModemCall::LpSleepCancel), 1);
        assert_eq!(sim.count(ModemCall::ResumeData), 1);
    }

    #[test]
    fn modem_wakeup_skips_host_wakeup_call() {
        let (mut c, sim, session, mut timers, _) = setup(PowerMode::LowPower);
        c.request_idle(&session, &mut timers, Duration::from_secs(5));
        c.complete(&session, &mut timers);
        assert_eq!(
            c.wakeup(WakeOrigin::Modem, &session, &mut timers),
            PowerNotice::DataResumed
        );
        assert_eq!(sim.count(ModemCall::LpWakeup), 0);
    }

    #[test]
    fn realtime_mode_never_idles() {
        let (mut c, sim, session, mut timers, _) = setup(PowerMode::RealTime);
        assert_eq!(
            c.request_idle(&session, &mut timers, Duration::from_secs(5)),
            PowerNotice::Ignored
        );
        assert_eq!(sim.count(ModemCall::SuspendData), 0);
    }

    #[test]
    fn failed_sleep_request_resumes_data() {
        let (mut c, sim, session, mut timers, manual) = setup(PowerMode::LowPower);
        sim.fail_next(ModemCall::LpSleepRequest, 1, ModemError::Rejected("busy".into()));
        assert_eq!(
            c.request_idle(&session, &mut timers, Duration::from_secs(5)),
            PowerNotice::DataResumed
        );
        assert_eq!(c.state(), PowerState::Inactive);
        assert!(!manual.is_armed(TimerKind::LpProtection));
        assert_eq!(sim.count(ModemCall::ResumeData), 1);
    }

    #[test]
    fn out_of_state_requests_are_ignored() {
        let (mut c, _, session, mut timers, _) = setup(PowerMode::LowPower);
        assert_eq!(c.complete(&session, &mut timers), PowerNotice::Ignored);
        assert_eq!(c.cancel(&session, &mut timers), PowerNotice::Ignored);
        assert_eq!(
            c.wakeup(WakeOrigin::Host, &session, &mut timers),
            PowerNotice::Ignored
        );
        c.disable(&mut timers);
        assert_eq!(c.state(), PowerState::Disabled);
        assert_eq!(
            c.request_idle(&session, &mut timers, Duration::from_secs(5)),
            PowerNotice::Ignored
        );
    }
}
