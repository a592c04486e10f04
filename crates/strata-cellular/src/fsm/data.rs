//! PDN activation, the data path, low-power idling, APN changes, PPP and
//! firmware updates.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{Automaton, ConnectivityState as S, ExitReason, RestartCause};
use crate::config::DataPlane;
use crate::decision::{self, NetworkStatus, SignalVerdict};
use crate::distrib::ServiceState;
use crate::event::Event;
use crate::modem::PdnEvent;
#[cfg(feature = "low-power")]
use crate::power::{PowerNotice, WakeOrigin};
use crate::retry::FailureCause;
use crate::timer::TimerKind;

impl Automaton {
    pub(super) fn on_pdn_activating(&mut self, event: &Event) -> bool {
        match event {
            Event::PdnStatusCheck | Event::PdnRetryTimer => {
                self.activate_pdn();
                true
            }
            Event::PdnActivated => {
                self.pdn_up();
                true
            }
            Event::NetworkCallback(pdn) => {
                self.ctx.last_pdn_event = Some(*pdn);
                if *pdn == PdnEvent::Detached {
                    warn!("detached while activating PDN");
                    self.registration_lost();
                }
                true
            }
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    fn pdn_cid(&self) -> u8 {
        self.pdn
            .as_ref()
            .map(|p| p.cid)
            .or_else(|| self.config.sim_slots.get(self.ctx.sim_slot_index).map(|s| s.cid))
            .unwrap_or(1)
    }

    fn activate_pdn(&mut self) {
        let cid = self.pdn_cid();
        if let Err(e) = self.modem.call(|m| m.set_default_pdn(cid)) {
            debug!(error = %e, cid, "default PDN not set");
        }
        let events = self.events.clone();
        if let Err(e) = self.modem.call(|m| m.register_pdn_events(cid, events)) {
            warn!(error = %e, cid, "PDN event registration failed");
        }

        match self.modem.call(|m| m.activate_pdn(cid)) {
            Ok(address) => {
                info!(%address, cid, "PDN active");
                self.ctx.address = Some(address);
                self.ctx.pdn_tempo_index = 0;
                self.nfmc.in_progress = false;
                self.post(Event::PdnActivated);
            }
            Err(e) => {
                let delay = self.pdn_retry_delay();
                warn!(error = %e, cid, ?delay, "PDN activation failed, retrying");
                self.timers.start(TimerKind::PdnRetry, delay);
            }
        }
    }

    fn pdn_retry_delay(&mut self) -> Duration {
        let index = self.ctx.pdn_tempo_index;
        match self.nfmc.tempo(index) {
            Some(tempo) => {
                self.ctx.pdn_tempo_index = self.nfmc.next_index(index);
                self.nfmc.in_progress = true;
                tempo
            }
            None => self.config.pdn_retry_delay,
        }
    }

    fn pdn_up(&mut self) {
        if self.config.data_plane == DataPlane::Ppp {
            let cid = self.pdn_cid();
            match self.modem.call(|m| m.ppp_open(cid)) {
                Ok(()) => self.set_state(S::PppConfigOnGoing),
                Err(e) => {
                    warn!(error = %e, "PPP open failed");
                    self.fail(FailureCause::Ppp);
                }
            }
            return;
        }
        self.enter_data_ready();
    }

    fn enter_data_ready(&mut self) {
        self.ctx.retry.reset();
        self.ctx.fail_cause = None;
        self.set_state(S::DataReady);
        info!(address = ?self.ctx.address, "data path ready");
        self.publish_data(ServiceState::On);
        self.publish_cellular(ServiceState::On);
        #[cfg(feature = "low-power")]
        self.arm_inactivity();
    }

    pub(super) fn on_data_ready(&mut self, event: &Event) -> bool {
        match event {
            Event::PollingTimer | Event::ModemUrc => {
                self.supervise();
                true
            }
            Event::NetworkCallback(pdn) => {
                self.pdn_event(*pdn);
                true
            }
            Event::DataFail => {
                warn!("data plane failure");
                self.reactivate_pdn();
                true
            }
            Event::PppClosed => {
                warn!("PPP link closed");
                self.fail(FailureCause::Ppp);
                true
            }
            #[cfg(feature = "low-power")]
            Event::SleepRequest => {
                self.request_idle();
                true
            }
            // Host traffic: push the inactivity deadline back.
            #[cfg(feature = "low-power")]
            Event::HostWakeup => {
                self.arm_inactivity();
                true
            }
            other => self.on_common(other),
        }
    }

    /// Periodic check that we are still registered with a usable signal.
    fn supervise(&mut self) {
        let Some(verdict) = self.read_signal() else {
            return;
        };
        let Some(status) = self.read_registration() else {
            return;
        };
        match status {
            NetworkStatus::Registered => {}
            // An unreadable status is not a loss: judge again next tick.
            NetworkStatus::Unknown => debug!("registration status unknown"),
            NetworkStatus::Error => {
                warn!("registration denied while data path up");
                self.fail(FailureCause::Network);
            }
            NetworkStatus::NotRegistered => {
                warn!(?status, ?verdict, "registration lost");
                self.data_down();
                self.publish_cellular(ServiceState::Run);
                if verdict == SignalVerdict::Usable {
                    self.wait_for_registration();
                } else {
                    self.set_state(S::WaitSignalQuality);
                }
            }
        }
    }

    fn pdn_event(&mut self, event: PdnEvent) {
        self.ctx.last_pdn_event = Some(event);
        match event {
            PdnEvent::Detached => {
                warn!("network detached");
                self.registration_lost();
            }
            PdnEvent::Deactivated => {
                warn!("PDN deactivated by network");
                self.reactivate_pdn();
            }
            PdnEvent::Other => debug!("PDN event"),
        }
    }

    fn registration_lost(&mut self) {
        self.data_down();
        self.publish_cellular(ServiceState::Run);
        self.set_state(S::WaitSignalQuality);
        self.post(Event::SignalCheck);
    }

    fn reactivate_pdn(&mut self) {
        self.data_down();
        self.publish_cellular(ServiceState::Run);
        self.set_state(S::PdnActivating);
        self.post(Event::PdnStatusCheck);
    }

    // ─── Low power ──────────────────────────────────────────────────────

    #[cfg(feature = "low-power")]
    pub(super) fn on_power_idle(&mut self, event: &Event) -> bool {
        let notice = match event {
            Event::SleepComplete => self.power.complete(&self.modem, &mut self.timers),
            Event::SleepTimeout | Event::SleepAbort => {
                self.power.cancel(&self.modem, &mut self.timers)
            }
            Event::HostWakeup => self
                .power
                .wakeup(WakeOrigin::Host, &self.modem, &mut self.timers),
            Event::ModemWakeup => self
                .power
                .wakeup(WakeOrigin::Modem, &self.modem, &mut self.timers),
            Event::PollingTimer => return true,
            // Link events need the modem awake: resume, then handle as usual.
            Event::NetworkCallback(_) | Event::DataFail | Event::ModemUrc | Event::PppClosed => {
                self.resume_data_ready();
                return self.on_data_ready(event);
            }
            other => return self.on_common(other),
        };
        match notice {
            PowerNotice::DataResumed => self.resume_data_ready(),
            PowerNotice::Asleep => debug!("data path idle, modem asleep"),
            PowerNotice::IdleRequested | PowerNotice::Ignored => {}
        }
        true
    }

    #[cfg(not(feature = "low-power"))]
    pub(super) fn on_power_idle(&mut self, event: &Event) -> bool {
        self.on_common(event)
    }

    /// Hands the data path to the power coordinator.
    #[cfg(feature = "low-power")]
    pub(super) fn request_idle(&mut self) {
        let timeout = self.config.power.sleep_timeout;
        match self.power.request_idle(&self.modem, &mut self.timers, timeout) {
            PowerNotice::IdleRequested => self.set_state(S::PowerDataIdle),
            _ => self.arm_inactivity(),
        }
    }

    /// Back to `DataReady` from idle. Counters and records are untouched:
    /// the data path never went down.
    #[cfg(feature = "low-power")]
    fn resume_data_ready(&mut self) {
        self.set_state(S::DataReady);
        self.arm_inactivity();
    }

    #[cfg(feature = "low-power")]
    fn arm_inactivity(&mut self) {
        if self.power.can_idle() {
            self.timers.start(
                TimerKind::LpInactivity,
                self.config.power.inactivity_timeout,
            );
        } else {
            self.timers.stop(TimerKind::LpInactivity);
        }
    }

    #[cfg(feature = "low-power")]
    pub(super) fn apply_power_config(&mut self) {
        let config = self.config.power;
        if let Err(e) = self.power.set_power_config(&self.modem, &config) {
            warn!(error = %e, "power config rejected by modem");
        }
        if self.ctx.state == S::DataReady {
            self.arm_inactivity();
        }
    }

    // ─── APN change ─────────────────────────────────────────────────────

    pub(super) fn on_apn_config(&mut self, event: &Event) -> bool {
        match event {
            Event::ApnConfig => {
                self.reconfigure_apn();
                true
            }
            other => self.on_common(other),
        }
    }

    /// Re-resolves the APN, redefines the PDN and resumes from activation
    /// (registered) or from signal acquisition (not yet registered).
    fn reconfigure_apn(&mut self) {
        let resume = self.apn_resume.take().unwrap_or(S::WaitSignalQuality);
        let config = Arc::clone(&self.config);
        let index = self.ctx.sim_slot_index;
        let Some(slot) = config.sim_slots.get(index) else {
            error!(index, "no SIM slot configured");
            self.fail(FailureCause::Sim);
            return;
        };
        let imsi = self.ctx.imsi.clone().unwrap_or_default();

        let pdn = match decision::resolve_apn(slot, &imsi) {
            Ok((pdn, source)) => {
                info!(apn = ?pdn.apn, ?source, "APN changed");
                pdn
            }
            Err(e) => {
                self.data_down();
                self.config_failure(e);
                return;
            }
        };

        if self.ctx.address.is_some() {
            let cid = self.pdn_cid();
            if let Err(e) = self.modem.call(|m| m.deactivate_pdn(cid)) {
                debug!(error = %e, cid, "PDN deactivation failed");
            }
            self.data_down();
            self.publish_cellular(ServiceState::Run);
        }

        if slot.send_apn {
            if let Err(e) = self.modem.call(|m| m.define_pdn(&pdn)) {
                warn!(error = %e, "PDN definition failed");
                self.fail(FailureCause::PdnDefine);
                return;
            }
        }
        self.pdn = Some(pdn);

        match resume {
            S::NetworkStatusOk => {
                self.set_state(S::NetworkStatusOk);
                self.post(Event::NetworkStatusOk);
            }
            S::ModemRegistered
            | S::PdnActivating
            | S::DataReady
            | S::PowerDataIdle
            | S::PppConfigOnGoing => {
                self.set_state(S::PdnActivating);
                self.post(Event::PdnStatusCheck);
            }
            _ => {
                self.set_state(S::WaitSignalQuality);
                self.post(Event::SignalCheck);
            }
        }
    }

    // ─── PPP ────────────────────────────────────────────────────────────

    pub(super) fn on_ppp_opening(&mut self, event: &Event) -> bool {
        match event {
            Event::PppOpened => {
                info!("PPP link up");
                self.enter_data_ready();
                true
            }
            Event::PppClosed => {
                warn!("PPP negotiation failed");
                self.fail(FailureCause::Ppp);
                true
            }
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    /// Waits for the PPP close to be confirmed. The modem goes off on
    /// confirmation, on timeout, or at the next polling tick.
    pub(super) fn on_ppp_closing(&mut self, event: &Event) -> bool {
        match event {
            Event::PppClosed => {
                info!("PPP link closed");
                self.power_down();
                true
            }
            Event::PppCloseTimeout | Event::PollingTimer => {
                warn!(?event, "PPP close not confirmed, powering off");
                self.power_down();
                true
            }
            other => self.on_common(other),
        }
    }

    // ─── Firmware update ────────────────────────────────────────────────

    pub(super) fn enter_fota(&mut self) {
        info!(timeout = ?self.config.fota_timeout, "modem firmware update started");
        self.data_down();
        self.timers.stop(TimerKind::Polling);
        self.set_state(S::Reprogramming);
        self.timers
            .start(TimerKind::Fota, self.config.fota_timeout);
        self.publish_cellular(ServiceState::Unavailable);
    }

    pub(super) fn on_reprogramming(&mut self, event: &Event) -> bool {
        match event {
            Event::FotaEnd => {
                info!("modem firmware update complete, restart required");
                self.exit = Some(ExitReason::Restart(RestartCause::FotaComplete));
                true
            }
            Event::FotaTimeout => {
                error!("modem firmware update timed out, restart required");
                self.exit = Some(ExitReason::Restart(RestartCause::FotaTimeout));
                true
            }
            _ => false,
        }
    }
}
