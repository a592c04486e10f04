//! Power-on, SIM bring-up, target-state changes and the terminal states.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{Automaton, ConnectivityState as S, MODEM_EVENTS};
use crate::config::{DataPlane, TargetState};
use crate::decision::{self, SimAccess, SlotStatus};
use crate::distrib::ServiceState;
use crate::error::{ApnError, ModemError};
use crate::event::Event;
use crate::modem::InitMode;
#[cfg(feature = "low-power")]
use crate::power::{PowerState, WakeOrigin};
use crate::retry::FailureCause;
use crate::timer::TimerKind;

impl Automaton {
    pub(super) fn on_boot(&mut self, event: &Event) -> bool {
        match event {
            Event::Boot => {
                info!("cellular connectivity manager starting");
                self.publish_cellular(ServiceState::Unavailable);
                self.publish_data(ServiceState::Unavailable);
                self.set_state(S::ModemInit);
                self.post(Event::ModemInit);
                true
            }
            _ => false,
        }
    }

    pub(super) fn on_modem_init(&mut self, event: &Event) -> bool {
        match event {
            Event::ModemInit => {
                self.init_modem();
                true
            }
            Event::TargetStateCmd => {
                // Other targets are picked up by the pending init.
                if self.ctx.target == TargetState::Off {
                    self.power_down();
                }
                true
            }
            // The modem announces its own restart while we power it.
            Event::ModemReboot | Event::ModemReset | Event::ModemPowerDown => true,
            _ => false,
        }
    }

    /// Powers the modem according to the target state.
    fn init_modem(&mut self) {
        self.refresh_config();
        let target = self.ctx.target;
        info!(%target, "initializing modem");
        if target == TargetState::Off {
            self.power_down();
            return;
        }

        self.ensure_polling();
        self.nfmc.in_progress = false;
        if self.ctx.modem_powered {
            self.power_off_modem();
        }

        let events = self.events.clone();
        if let Err(e) = self.modem.call(|m| m.subscribe_sim_events(events)) {
            warn!(error = %e, "SIM event subscription failed");
        }
        if let Err(e) = self.modem.call(|m| m.power_on()) {
            warn!(error = %e, "modem power-on failed");
            self.fail(FailureCause::PowerOn);
            return;
        }
        self.ctx.modem_powered = true;

        let events = self.events.clone();
        if let Err(e) = self
            .modem
            .call(|m| m.subscribe_modem_events(MODEM_EVENTS, events))
        {
            warn!(error = %e, "modem event subscription failed");
        }
        self.publish_cellular(ServiceState::Run);

        if target == TargetState::ModemOnly {
            self.set_state(S::PowerOnOnly);
            return;
        }
        self.set_state(S::ModemReady);
        self.post(Event::ModemReady);
    }

    pub(super) fn on_modem_ready(&mut self, event: &Event) -> bool {
        match event {
            Event::ModemReady => {
                self.init_sim();
                true
            }
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    /// Selects the active SIM, reads identities, resolves the APN and starts
    /// network registration.
    fn init_sim(&mut self) {
        let config = Arc::clone(&self.config);
        let index = self.ctx.sim_slot_index;
        let Some(slot) = config.sim_slots.get(index) else {
            error!(index, "no SIM slot configured");
            self.fail(FailureCause::Sim);
            return;
        };

        info!(slot = index, kind = ?slot.slot, "selecting SIM");
        if let Err(e) = self.modem.call(|m| m.select_sim(slot.slot)) {
            self.sim_failure(e);
            return;
        }

        let mode = if self.ctx.target == TargetState::SimOnly {
            InitMode::SimOnly
        } else {
            InitMode::Full
        };
        if let Err(e) = self.modem.call(|m| m.init(mode)) {
            if e.is_sim() {
                self.sim_failure(e);
            } else {
                warn!(error = %e, "modem init failed");
                self.fail(FailureCause::PowerOn);
            }
            return;
        }

        self.ctx.identity = self
            .modem
            .call(|m| m.device_identity())
            .map_err(|e| warn!(error = %e, "cannot read device identity"))
            .ok();
        self.ctx.iccid = self
            .modem
            .call(|m| m.iccid())
            .map_err(|e| warn!(error = %e, "cannot read ICCID"))
            .ok();
        let imsi = match self.modem.call(|m| m.imsi()) {
            Ok(imsi) => imsi,
            Err(e) => {
                warn!(error = %e, "cannot read IMSI");
                self.sim_failure(if e.is_sim() { e } else { ModemError::SimFailure });
                return;
            }
        };
        self.ctx.imsi = Some(imsi.clone());
        self.mark_slot(index, SlotStatus::Ok);
        self.publish_sim(ServiceState::On);

        if self.nfmc.refresh(&config.nfmc, &imsi) {
            info!(active = self.nfmc.active, tempos = ?self.nfmc.tempos, "NFMC tempos computed");
            self.publish_nfmc();
        }

        #[cfg(feature = "low-power")]
        self.enable_low_power();

        if self.ctx.target == TargetState::SimOnly {
            self.set_state(S::SimOnly);
            self.publish_cellular(ServiceState::Run);
            return;
        }

        let pdn = match decision::resolve_apn(slot, &imsi) {
            Ok((pdn, source)) => {
                info!(apn = ?pdn.apn, ?source, cid = pdn.cid, "APN resolved");
                pdn
            }
            Err(e) => {
                self.config_failure(e);
                return;
            }
        };
        if slot.send_apn {
            if let Err(e) = self.modem.call(|m| m.define_pdn(&pdn)) {
                warn!(error = %e, "PDN definition failed");
                self.fail(FailureCause::PdnDefine);
                return;
            }
        }
        self.pdn = Some(pdn);
        self.publish_cellular(ServiceState::Run);

        if let Err(e) = self.modem.call(|m| m.register(&config.operator)) {
            warn!(error = %e, operator = ?config.operator, "registration request failed");
            self.fail(FailureCause::Register);
            return;
        }
        self.set_state(S::WaitSignalQuality);
        self.post(Event::SignalCheck);
    }

    fn sim_failure(&mut self, err: ModemError) {
        let index = self.ctx.sim_slot_index;
        match decision::classify_sim_error(&err) {
            SimAccess::Lockout(status) => {
                self.mark_slot(index, status);
                error!(slot = index, ?status, "SIM locked, halting until powered off");
                self.timers.stop(TimerKind::Polling);
                self.set_state(S::Lockout);
                self.publish_sim(ServiceState::Fail);
                self.publish_cellular(ServiceState::Fail);
            }
            SimAccess::Fallback(status) => {
                self.mark_slot(index, status);
                let next = decision::next_sim_slot(index, self.config.sim_slots.len());
                warn!(slot = index, ?status, next, "SIM unusable, rotating slot");
                self.ctx.sim_slot_index = next;
                self.publish_sim(ServiceState::Unavailable);
                self.fail(FailureCause::Sim);
            }
        }
    }

    fn mark_slot(&mut self, index: usize, status: SlotStatus) {
        if let Some(slot) = self.ctx.sim_slots.get_mut(index) {
            *slot = status;
        }
    }

    /// Invalid configuration is not retried.
    pub(super) fn config_failure(&mut self, err: ApnError) {
        self.ctx.config_error = Some(err.to_string());
        self.enter_fail();
    }

    #[cfg(feature = "low-power")]
    fn enable_low_power(&mut self) {
        if self.power.state() != PowerState::Disabled {
            return;
        }
        if let Err(e) = self.power.enable(&self.modem, &self.config.power) {
            warn!(error = %e, "low-power init failed");
        }
    }

    /// `SimOnly` and `PowerOnOnly`: the modem is up as far as requested.
    pub(super) fn on_parked(&mut self, event: &Event) -> bool {
        match event {
            Event::PollingTimer => true,
            other => self.on_common(other),
        }
    }

    /// `Reset` / `Reboot`: power-cycle on whatever event arrives, then
    /// initialize again.
    pub(super) fn on_restart(&mut self, event: &Event) -> bool {
        let hard = self.ctx.state == S::Reset;
        debug!(?event, hard, "restarting modem");
        self.data_down();
        if hard {
            if let Err(e) = self.modem.call(|m| m.reset()) {
                warn!(error = %e, "modem reset failed");
            }
        }
        self.power_off_modem();
        self.set_state(S::ModemInit);
        self.post(Event::ModemInit);
        true
    }

    pub(super) fn on_off(&mut self, event: &Event) -> bool {
        match event {
            Event::TargetStateCmd => {
                if self.ctx.target == TargetState::Off {
                    return true;
                }
                self.ctx.retry.reset();
                self.ctx.fail_cause = None;
                self.set_state(S::ModemInit);
                self.post(Event::ModemInit);
                true
            }
            Event::PowerOnOnly => {
                match self.modem.call(|m| m.power_on()) {
                    Ok(()) => {
                        self.ctx.modem_powered = true;
                        self.set_state(S::PowerOnOnly);
                        self.publish_cellular(ServiceState::Run);
                    }
                    Err(e) => warn!(error = %e, "modem power-on failed"),
                }
                true
            }
            _ => false,
        }
    }

    pub(super) fn on_fail(&mut self, event: &Event) -> bool {
        match event {
            Event::RebootModem => {
                info!("reboot requested, leaving fail state");
                self.ctx.retry.reset();
                self.ctx.fail_cause = None;
                self.ctx.config_error = None;
                self.set_state(S::Reboot);
                self.on_restart(event)
            }
            Event::TargetStateCmd if self.ctx.target == TargetState::Off => {
                self.power_down();
                true
            }
            _ => false,
        }
    }

    pub(super) fn on_lockout(&mut self, event: &Event) -> bool {
        match event {
            Event::TargetStateCmd if self.ctx.target == TargetState::Off => {
                info!("leaving SIM lockout on power-off request");
                self.power_down();
                true
            }
            _ => false,
        }
    }

    /// Reacts to a new target state while the modem is running.
    pub(super) fn apply_target(&mut self) {
        let target = self.ctx.target;
        let state = self.ctx.state;
        info!(%target, ?state, "target state changed");
        match target {
            TargetState::Off => self.shut_down(),
            TargetState::SimOnly if state == S::SimOnly => {}
            TargetState::ModemOnly if state == S::PowerOnOnly => {}
            TargetState::Full if !matches!(state, S::SimOnly | S::PowerOnOnly) => {}
            _ => {
                self.data_down();
                self.set_state(S::ModemInit);
                self.post(Event::ModemInit);
            }
        }
    }

    /// Orderly shutdown: close PPP first if it carries the data path.
    fn shut_down(&mut self) {
        if self.config.data_plane == DataPlane::Ppp
            && matches!(
                self.ctx.state,
                S::DataReady | S::PppConfigOnGoing | S::PowerDataIdle
            )
        {
            match self.modem.call(|m| m.ppp_close()) {
                Ok(()) => {
                    self.data_down();
                    self.set_state(S::PppCloseOnGoing);
                    self.timers
                        .start(TimerKind::PppClose, self.config.ppp_close_timeout);
                    return;
                }
                Err(e) => warn!(error = %e, "PPP close failed, powering off anyway"),
            }
        }
        self.power_down();
    }

    /// Tears down the data path, powers the modem off and parks in `Off`.
    pub(super) fn power_down(&mut self) {
        // An idle modem has to be awake to take the teardown commands.
        #[cfg(feature = "low-power")]
        self.power
            .wakeup(WakeOrigin::Host, &self.modem, &mut self.timers);
        if self.ctx.modem_powered {
            if self.ctx.address.is_some() {
                if let Some(cid) = self.pdn.as_ref().map(|p| p.cid) {
                    if let Err(e) = self.modem.call(|m| m.deactivate_pdn(cid)) {
                        debug!(error = %e, "PDN deactivation failed");
                    }
                }
            }
            if self.ctx.state.is_attached() {
                if let Err(e) = self.modem.call(|m| m.detach()) {
                    debug!(error = %e, "detach failed");
                }
            }
            self.power_off_modem();
        }
        self.data_down();
        self.timers.stop(TimerKind::Polling);
        self.set_state(S::Off);
        self.publish_cellular(ServiceState::Off);
        self.publish_data(ServiceState::Off);
        info!("modem off");
    }
}
