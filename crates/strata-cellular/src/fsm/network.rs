//! Signal quality, network registration and the registration backoff.

use tracing::{debug, info, warn};

use super::{Automaton, ConnectivityState as S};
use crate::decision::{self, NetworkStatus, SignalVerdict};
use crate::distrib::ServiceState;
use crate::event::Event;
use crate::retry::{FailureCause, RetryDecision};
use crate::timer::TimerKind;

impl Automaton {
    pub(super) fn on_wait_signal(&mut self, event: &Event) -> bool {
        match event {
            Event::SignalCheck | Event::PollingTimer | Event::ModemUrc => {
                self.check_signal();
                true
            }
            other => self.on_common(other),
        }
    }

    pub(super) fn on_wait_network(&mut self, event: &Event) -> bool {
        match event {
            Event::NetworkStatusCheck | Event::PollingTimer | Event::ModemUrc => {
                self.check_registration();
                true
            }
            Event::RegistrationTimeout => {
                self.registration_backoff();
                true
            }
            other => self.on_common(other),
        }
    }

    pub(super) fn on_network_ok(&mut self, event: &Event) -> bool {
        match event {
            Event::NetworkStatusOk => {
                self.attach();
                true
            }
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    pub(super) fn on_registered(&mut self, event: &Event) -> bool {
        match event {
            Event::ModemAttached => {
                self.set_state(S::PdnActivating);
                self.post(Event::PdnStatusCheck);
                true
            }
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    /// Reads and publishes the signal. `None` means the read failed and the
    /// failure has already been handled.
    pub(super) fn read_signal(&mut self) -> Option<SignalVerdict> {
        match self.modem.call(|m| m.signal_quality()) {
            Ok(quality) => {
                self.ctx.signal = Some(quality);
                self.publish_signal();
                Some(decision::evaluate_signal(quality))
            }
            Err(e) => {
                warn!(error = %e, "signal quality read failed");
                self.fail(FailureCause::SignalQuality);
                None
            }
        }
    }

    /// Reads and classifies the registration. `None` means the read failed
    /// and the failure has already been handled.
    pub(super) fn read_registration(&mut self) -> Option<NetworkStatus> {
        match self.modem.call(|m| m.network_status()) {
            Ok(report) => {
                self.ctx.cs = report.cs;
                self.ctx.ps = report.ps;
                self.ctx.eps = report.eps;
                if report.access_technology.is_some() {
                    self.ctx.access_technology = report.access_technology;
                }
                Some(decision::classify_registration(&report))
            }
            Err(e) => {
                warn!(error = %e, "registration status read failed");
                self.fail(FailureCause::Network);
                None
            }
        }
    }

    /// Starts waiting for registration: arms the attach timeout and checks
    /// right away.
    pub(super) fn wait_for_registration(&mut self) {
        self.set_state(S::WaitNetworkStatus);
        self.timers
            .start(TimerKind::Registration, self.config.attach_timeout);
        self.post(Event::NetworkStatusCheck);
    }

    fn check_signal(&mut self) {
        let Some(verdict) = self.read_signal() else {
            return;
        };
        if verdict == SignalVerdict::Usable {
            info!(
                rssi = self.ctx.signal.map(|q| q.rssi),
                "usable signal, waiting for registration"
            );
            self.wait_for_registration();
        } else {
            debug!(?verdict, "no usable signal yet");
        }
    }

    fn check_registration(&mut self) {
        let Some(status) = self.read_registration() else {
            return;
        };
        match status {
            NetworkStatus::Registered => {
                info!(ps = ?self.ctx.ps, eps = ?self.ctx.eps, "registered on network");
                self.set_state(S::NetworkStatusOk);
                self.post(Event::NetworkStatusOk);
            }
            NetworkStatus::NotRegistered => {
                if let Some(verdict) = self.read_signal() {
                    if verdict != SignalVerdict::Usable {
                        info!(?verdict, "signal lost while registering");
                        self.set_state(S::WaitSignalQuality);
                    }
                }
            }
            NetworkStatus::Unknown => debug!("registration state unknown"),
            NetworkStatus::Error => {
                warn!(ps = ?self.ctx.ps, eps = ?self.ctx.eps, "registration denied");
                self.fail(FailureCause::Network);
            }
        }
    }

    /// Attach timeout: power the modem down and try again later. With NFMC
    /// the delay walks the tempo table and is not counted; without it the
    /// attempt is counted against the register budget.
    fn registration_backoff(&mut self) {
        let delay = match self.nfmc.tempo(self.ctx.register_tempo_index) {
            Some(tempo) => {
                let index = self.ctx.register_tempo_index;
                self.ctx.register_tempo_index = self.nfmc.next_index(index);
                self.nfmc.in_progress = true;
                info!(index, ?tempo, "registration timed out, NFMC backoff");
                tempo
            }
            None => {
                self.ctx.fail_cause = Some(FailureCause::Register);
                match self.ctx.retry.record(FailureCause::Register) {
                    RetryDecision::Reboot => {
                        let delay = self.config.register_retry_delay;
                        warn!(
                            count = self.ctx.retry.count(FailureCause::Register),
                            ?delay,
                            "registration timed out, backing off"
                        );
                        delay
                    }
                    RetryDecision::Fail => {
                        warn!("registration timed out, retry budget exhausted");
                        self.enter_fail();
                        return;
                    }
                }
            }
        };

        self.power_off_modem();
        self.publish_cellular(ServiceState::Unavailable);
        self.set_state(S::ModemInit);
        self.timers.start(TimerKind::RegisterBackoff, delay);
    }

    fn attach(&mut self) {
        match self.modem.call(|m| m.operator_name()) {
            Ok(name) => self.ctx.operator = Some(name),
            Err(e) => debug!(error = %e, "operator name unavailable"),
        }
        self.publish_cellular(ServiceState::Run);

        if let Err(e) = self.modem.call(|m| m.attach()) {
            warn!(error = %e, "packet domain attach failed");
            self.fail(FailureCause::Attach);
            return;
        }
        self.set_state(S::ModemRegistered);
        self.post(Event::ModemAttached);
    }
}
