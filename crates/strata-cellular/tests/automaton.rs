//! Connectivity automaton scenarios against the simulated modem.
//!
//! Timers never run on their own here: each test fires them explicitly,
//! so every transition is deterministic.

mod common;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use common::{two_slot_config, Harness};
use strata_cellular::config::{
    CellularConfig, DataPlane, NfmcConfig, SimSlotConfig, SimSlotType, TargetState,
};
use strata_cellular::decision::SlotStatus;
use strata_cellular::distrib::{Distribution, ModemState, RecordKey, ServiceState};
use strata_cellular::error::ModemError;
use strata_cellular::event::{Event, EVENT_QUEUE_CAPACITY};
use strata_cellular::fsm::{ConnectivityState as S, ExitReason, RestartCause};
use strata_cellular::modem::sim::ModemCall;
use strata_cellular::modem::{PdnEvent, RegistrationReport, RegistrationState, SimEvent};
use strata_cellular::retry::FailureCause;
use strata_cellular::timer::TimerKind;

// ─── Bring-up ────────────────────────────────────────────────────────────

#[test]
fn boot_reaches_data_ready() {
    let mut h = Harness::new(CellularConfig::default());
    assert_eq!(h.boot(), S::DataReady);

    let ctx = h.automaton.context();
    assert_eq!(ctx.address, Some(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 2))));
    assert_eq!(ctx.imsi.as_deref(), Some("208011234567890"));
    assert_eq!(ctx.operator.as_deref(), Some("Orange F"));
    assert!(ctx.retry.is_clear());

    // No APN configured: resolved from the IMSI's network.
    let pdn = h.modem.defined_pdn().unwrap();
    assert_eq!(pdn.apn.as_deref(), Some("orange"));

    let cellular = h.board.cellular().unwrap();
    assert_eq!(cellular.state, ServiceState::On);
    assert_eq!(cellular.modem_state, ModemState::DataReady);
    assert_eq!(h.board.data_service().unwrap().state, ServiceState::On);
    assert!(h.timers.is_armed(TimerKind::Polling));
}

#[test]
fn published_states_follow_bring_up() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    assert_eq!(
        h.board.state_trail(RecordKey::Cellular),
        vec![ServiceState::Unavailable, ServiceState::Run, ServiceState::On]
    );
    assert_eq!(
        h.board.state_trail(RecordKey::DataService),
        vec![ServiceState::Unavailable, ServiceState::On]
    );
    assert_eq!(
        h.board.state_trail(RecordKey::NetworkInterface),
        vec![ServiceState::Unavailable, ServiceState::On]
    );
}

#[test]
fn weak_signal_waits_for_polling() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem.set_signal(99);
    assert_eq!(h.boot(), S::WaitSignalQuality);
    assert!(h.board.data_service().unwrap().state != ServiceState::On);

    h.modem.set_signal(0);
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::WaitSignalQuality);

    h.modem.set_signal(15);
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::DataReady);
}

#[test]
fn sim_only_target_stops_after_sim() {
    let config = CellularConfig {
        target_state: TargetState::SimOnly,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    assert_eq!(h.boot(), S::SimOnly);
    assert_eq!(h.modem.count(ModemCall::Imsi), 1);
    assert_eq!(h.modem.count(ModemCall::Register), 0);
    assert_eq!(h.board.sim().unwrap().state, ServiceState::On);
}

#[test]
fn modem_only_target_powers_on_only() {
    let config = CellularConfig {
        target_state: TargetState::ModemOnly,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    assert_eq!(h.boot(), S::PowerOnOnly);
    assert!(h.modem.is_powered());
    assert_eq!(h.modem.count(ModemCall::SelectSim), 0);

    // Raising the target continues the bring-up.
    h.board.set_target_state(TargetState::Full);
    assert_eq!(h.send(Event::TargetStateCmd), S::DataReady);
}

// ─── Retry policy ────────────────────────────────────────────────────────

#[test]
fn repeated_failures_end_in_fail() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem.fail_always(ModemCall::PowerOn, ModemError::Timeout);
    assert_eq!(h.boot(), S::Fail);

    // Five reboots allowed, the sixth failure gives up.
    assert_eq!(h.modem.count(ModemCall::PowerOn), 6);
    let ctx = h.automaton.context();
    assert_eq!(ctx.fail_cause, Some(FailureCause::PowerOn));
    assert_eq!(ctx.retry.count(FailureCause::PowerOn), 6);
    assert_eq!(h.board.cellular().unwrap().state, ServiceState::Fail);
    assert!(!h.timers.is_armed(TimerKind::Polling));

    // Fail is sticky until a reboot request.
    h.send(Event::ModemUrc);
    h.send(Event::ModemInit);
    assert_eq!(h.state(), S::Fail);

    h.modem.clear_failure(ModemCall::PowerOn);
    assert_eq!(h.send(Event::RebootModem), S::DataReady);
    assert!(h.automaton.context().retry.is_clear());
}

#[test]
fn transient_failure_recovers_by_reboot() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem.fail_next(ModemCall::Attach, 2, ModemError::Rejected("ERROR".into()));
    assert_eq!(h.boot(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::Attach), 3);
    // Counters clear once the data path is up.
    assert!(h.automaton.context().retry.is_clear());
}

#[test]
fn power_on_failing_max_times_still_comes_up() {
    let mut h = Harness::new(CellularConfig::default());
    let max = h.automaton.context().retry.limits().max_per_cause;
    h.modem
        .fail_next(ModemCall::PowerOn, u32::from(max), ModemError::Timeout);
    assert_eq!(h.boot(), S::DataReady);

    // One reboot per failure, then the successful power-on.
    assert_eq!(h.modem.count(ModemCall::PowerOn), usize::from(max) + 1);
    assert!(h.automaton.context().retry.is_clear());
    assert_eq!(h.board.cellular().unwrap().state, ServiceState::On);
}

#[test]
fn power_on_failing_once_more_than_max_fails() {
    let mut h = Harness::new(CellularConfig::default());
    let max = h.automaton.context().retry.limits().max_per_cause;
    h.modem
        .fail_next(ModemCall::PowerOn, u32::from(max) + 1, ModemError::Timeout);
    assert_eq!(h.boot(), S::Fail);
    assert_eq!(h.modem.count(ModemCall::PowerOn), usize::from(max) + 1);
}

#[test]
fn registration_denied_fails_network() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem
        .set_registration(RegistrationReport::eps(RegistrationState::Denied));
    assert_eq!(h.boot(), S::Fail);
    assert_eq!(
        h.automaton.context().fail_cause,
        Some(FailureCause::Network)
    );
}

// ─── SIM handling ────────────────────────────────────────────────────────

#[test]
fn missing_sim_rotates_to_next_slot() {
    let mut h = Harness::new(two_slot_config());
    h.modem
        .set_sim_error(SimSlotType::Socket, ModemError::SimNotInserted);
    assert_eq!(h.boot(), S::DataReady);

    let ctx = h.automaton.context();
    assert_eq!(ctx.sim_slot_index, 1);
    assert_eq!(ctx.sim_slots, vec![SlotStatus::NotInserted, SlotStatus::Ok]);
    assert_eq!(h.modem.selected_slot(), Some(SimSlotType::Embedded));
    assert_eq!(h.modem.defined_pdn().unwrap().cid, 2);

    let sim = h.board.sim().unwrap();
    assert_eq!(sim.active_slot, 1);
    assert_eq!(sim.state, ServiceState::On);
}

#[test]
fn sim_rotation_settles_on_working_slot() {
    let mut config = two_slot_config();
    config.sim_slots.push(SimSlotConfig {
        slot: SimSlotType::HostResident,
        cid: 3,
        ..SimSlotConfig::default()
    });
    let mut h = Harness::new(config);
    h.modem
        .set_sim_error(SimSlotType::Socket, ModemError::SimNotInserted);
    h.modem
        .set_sim_error(SimSlotType::Embedded, ModemError::SimFailure);
    assert_eq!(h.boot(), S::DataReady);

    let ctx = h.automaton.context();
    assert_eq!(ctx.sim_slot_index, 2);
    assert_eq!(
        ctx.sim_slots,
        vec![SlotStatus::NotInserted, SlotStatus::Failure, SlotStatus::Ok]
    );
    assert_eq!(h.modem.selected_slot(), Some(SimSlotType::HostResident));

    // A working first slot does not pull the manager back after a reboot.
    h.modem.clear_sim_error(SimSlotType::Socket);
    h.modem.clear_calls();
    assert!(h.modem.inject(Event::ModemReboot));
    h.run();
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::PowerOn), 1);
    assert_eq!(h.automaton.context().sim_slot_index, 2);
    assert_eq!(h.modem.selected_slot(), Some(SimSlotType::HostResident));
    assert_eq!(h.modem.defined_pdn().unwrap().cid, 3);
}

#[test]
fn pin_required_locks_out() {
    let mut h = Harness::new(two_slot_config());
    h.modem
        .set_sim_error(SimSlotType::Socket, ModemError::SimPinRequired);
    assert_eq!(h.boot(), S::Lockout);

    // Never tried the other slot, never retried the locked one.
    assert_eq!(h.modem.count(ModemCall::Init), 1);
    assert_eq!(h.automaton.context().sim_slots[0], SlotStatus::PinRequired);
    assert_eq!(h.board.sim().unwrap().state, ServiceState::Fail);
    assert_eq!(h.board.cellular().unwrap().modem_state, ModemState::Locked);
    assert!(!h.timers.is_armed(TimerKind::Polling));

    h.send(Event::RebootModem);
    h.send(Event::ModemInit);
    assert_eq!(h.state(), S::Lockout);

    h.board.set_target_state(TargetState::Off);
    assert_eq!(h.send(Event::TargetStateCmd), S::Off);
    assert!(!h.modem.is_powered());
}

#[test]
fn sim_refresh_resets_modem() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    assert!(h.modem.inject_sim(SimEvent::Refresh));
    h.run();
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::Reset), 1);
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 2);
}

// ─── Registration backoff ────────────────────────────────────────────────

#[test]
fn registration_timeout_without_nfmc_is_counted() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem
        .set_registration(RegistrationReport::eps(RegistrationState::Searching));
    assert_eq!(h.boot(), S::WaitNetworkStatus);
    assert_eq!(
        h.timers.armed(TimerKind::Registration).unwrap().after,
        Duration::from_secs(180)
    );

    assert!(h.fire(TimerKind::Registration));
    assert_eq!(h.state(), S::ModemInit);
    assert!(!h.modem.is_powered());
    assert_eq!(
        h.automaton.context().retry.count(FailureCause::Register),
        1
    );
    assert_eq!(
        h.timers.armed(TimerKind::RegisterBackoff).unwrap().after,
        Duration::from_secs(60)
    );

    // Backoff expiry starts a fresh bring-up.
    assert!(h.fire(TimerKind::RegisterBackoff));
    assert_eq!(h.state(), S::WaitNetworkStatus);
    assert!(h.modem.is_powered());
}

#[test]
fn registration_timeout_with_nfmc_walks_tempos() {
    let config = CellularConfig {
        nfmc: NfmcConfig {
            enabled: true,
            coefficients: vec![60, 120],
        },
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    h.modem
        .set_registration(RegistrationReport::eps(RegistrationState::Searching));
    h.boot();

    let tempos = h.automaton.nfmc().tempos.clone();
    assert_eq!(tempos.len(), 2);
    assert!(h.automaton.nfmc().active);
    assert_eq!(h.board.nfmc().unwrap().tempos_ms.len(), 2);

    let mut seen = Vec::new();
    for _ in 0..3 {
        assert!(h.fire(TimerKind::Registration));
        assert!(h.automaton.nfmc().in_progress);
        seen.push(h.timers.armed(TimerKind::RegisterBackoff).unwrap().after);
        assert!(h.fire(TimerKind::RegisterBackoff));
        assert_eq!(h.state(), S::WaitNetworkStatus);
    }
    assert_eq!(seen, vec![tempos[0], tempos[1], tempos[0]]);
    // NFMC backoff is not counted against the register budget.
    assert!(h.automaton.context().retry.is_clear());
}

#[test]
fn pdn_retry_uses_nfmc_tempo() {
    let config = CellularConfig {
        nfmc: NfmcConfig {
            enabled: true,
            coefficients: vec![30],
        },
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    h.modem
        .fail_next(ModemCall::ActivatePdn, 1, ModemError::Rejected("+CME ERROR: 30".into()));
    assert_eq!(h.boot(), S::PdnActivating);

    let tempo = h.automaton.nfmc().tempos[0];
    assert_eq!(h.timers.armed(TimerKind::PdnRetry).unwrap().after, tempo);

    assert!(h.fire(TimerKind::PdnRetry));
    assert_eq!(h.state(), S::DataReady);
    assert!(!h.automaton.nfmc().in_progress);
}

// ─── Target state ────────────────────────────────────────────────────────

#[test]
fn target_off_tears_down_in_order() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    h.modem.clear_calls();

    h.board.set_target_state(TargetState::Off);
    assert_eq!(h.send(Event::TargetStateCmd), S::Off);

    let calls = h.modem.calls();
    let pos = |c: ModemCall| calls.iter().position(|x| *x == c).unwrap();
    assert!(pos(ModemCall::DeactivatePdn) < pos(ModemCall::Detach));
    assert!(pos(ModemCall::Detach) < pos(ModemCall::PowerOff));
    assert!(!h.modem.is_powered());
    assert!(!h.timers.is_armed(TimerKind::Polling));
    assert_eq!(h.board.cellular().unwrap().state, ServiceState::Off);
    assert_eq!(h.board.data_service().unwrap().state, ServiceState::Off);

    h.board.set_target_state(TargetState::Full);
    assert_eq!(h.send(Event::TargetStateCmd), S::DataReady);
}

#[test]
fn stale_pdn_retry_after_off_is_ignored() {
    let mut h = Harness::new(CellularConfig::default());
    h.modem
        .fail_next(ModemCall::ActivatePdn, 1, ModemError::Timeout);
    assert_eq!(h.boot(), S::PdnActivating);
    let stale = h.timers.fire(TimerKind::PdnRetry).unwrap();

    h.board.set_target_state(TargetState::Off);
    assert_eq!(h.send(Event::TargetStateCmd), S::Off);
    h.modem.clear_calls();

    assert_eq!(h.send(Event::Timer(stale)), S::Off);
    assert!(h.modem.calls().is_empty());
}

#[test]
fn off_target_at_boot_never_powers() {
    let config = CellularConfig {
        target_state: TargetState::Off,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    assert_eq!(h.boot(), S::Off);
    assert_eq!(h.modem.count(ModemCall::PowerOn), 0);

    assert_eq!(h.send(Event::PowerOnOnly), S::PowerOnOnly);
    assert!(h.modem.is_powered());
}

// ─── Supervision ─────────────────────────────────────────────────────────

#[test]
fn lost_registration_tears_down_data() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();

    h.modem
        .set_registration(RegistrationReport::eps(RegistrationState::Searching));
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::WaitNetworkStatus);
    assert_eq!(
        h.board.data_service().unwrap().state,
        ServiceState::Unavailable
    );
    assert_eq!(h.automaton.context().address, None);

    h.modem
        .set_registration(RegistrationReport::eps(RegistrationState::RegisteredRoaming));
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::DataReady);
}

#[test]
fn unknown_registration_keeps_data_path() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    let address = h.automaton.context().address;
    let trail = h.board.state_trail(RecordKey::DataService);
    // Any re-activation would pick this address up.
    h.modem.set_address(IpAddr::V4(Ipv4Addr::new(10, 64, 0, 9)));
    h.modem.clear_calls();

    h.modem
        .push_registration(RegistrationReport::eps(RegistrationState::Unknown));
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.automaton.context().address, address);
    assert_eq!(h.board.state_trail(RecordKey::DataService), trail);
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 0);

    // Next tick reads the registered default again.
    h.fire(TimerKind::Polling);
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.automaton.context().address, address);
}

#[test]
fn pdn_detach_restarts_from_signal() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    assert!(h.modem.inject_pdn(PdnEvent::Detached));
    h.run();
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 2);
    assert_eq!(
        h.automaton.context().last_pdn_event,
        Some(PdnEvent::Detached)
    );
}

#[test]
fn pdn_deactivation_reactivates() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    h.modem.clear_calls();
    assert!(h.modem.inject_pdn(PdnEvent::Deactivated));
    h.run();
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 1);
    assert_eq!(h.modem.count(ModemCall::Attach), 0);
}

#[test]
fn unexpected_modem_reboot_is_a_reset_failure() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    h.modem.clear_calls();
    assert!(h.modem.inject(Event::ModemReboot));
    h.run();
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::PowerOn), 1);
}

// ─── Firmware update ─────────────────────────────────────────────────────

#[test]
fn fota_end_requests_restart() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    h.modem.inject(Event::FotaStart);
    h.run();
    assert_eq!(h.state(), S::Reprogramming);
    assert!(!h.timers.is_armed(TimerKind::Polling));
    assert_eq!(
        h.board.cellular().unwrap().modem_state,
        ModemState::Reprogramming
    );
    assert_eq!(
        h.board.data_service().unwrap().state,
        ServiceState::Unavailable
    );

    // Only the update outcome matters now.
    h.send(Event::ModemUrc);
    assert_eq!(h.state(), S::Reprogramming);

    h.modem.inject(Event::FotaEnd);
    h.run();
    assert_eq!(
        h.automaton.exit_reason(),
        Some(ExitReason::Restart(RestartCause::FotaComplete))
    );
}

#[test]
fn fota_timeout_requests_restart() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();
    h.send(Event::FotaStart);
    assert_eq!(
        h.timers.armed(TimerKind::Fota).unwrap().after,
        Duration::from_secs(360)
    );
    assert!(h.fire(TimerKind::Fota));
    assert_eq!(
        h.automaton.exit_reason(),
        Some(ExitReason::Restart(RestartCause::FotaTimeout))
    );
}

// ─── APN changes ─────────────────────────────────────────────────────────

fn with_apn(apn: &str) -> CellularConfig {
    CellularConfig {
        sim_slots: vec![SimSlotConfig {
            apn: apn.into(),
            ..SimSlotConfig::default()
        }],
        ..CellularConfig::default()
    }
}

#[test]
fn apn_change_reactivates_pdn() {
    let mut h = Harness::new(CellularConfig::default());
    h.boot();

    h.board.set_config(with_apn("internet.custom"));
    assert_eq!(h.send(Event::ApnConfig), S::DataReady);
    assert_eq!(
        h.modem.defined_pdn().unwrap().apn.as_deref(),
        Some("internet.custom")
    );
    assert_eq!(h.modem.count(ModemCall::DeactivatePdn), 1);
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 2);
    // Still registered: no new attach.
    assert_eq!(h.modem.count(ModemCall::Attach), 1);
}

#[test]
fn apn_change_while_off_waits_for_init() {
    let config = CellularConfig {
        target_state: TargetState::Off,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    h.boot();
    h.board.set_config(CellularConfig {
        target_state: TargetState::Off,
        ..with_apn("late.apn")
    });
    assert_eq!(h.send(Event::ApnConfig), S::Off);
    assert!(h.modem.defined_pdn().is_none());
}

#[test]
fn oversize_apn_is_a_config_failure() {
    let mut h = Harness::new(with_apn(&"a".repeat(64)));
    assert_eq!(h.boot(), S::Fail);
    let ctx = h.automaton.context();
    assert!(ctx.config_error.as_deref().unwrap().contains("64"));
    // Not retried.
    assert_eq!(h.modem.count(ModemCall::PowerOn), 1);
    assert_eq!(h.modem.count(ModemCall::DefinePdn), 0);
}

// ─── PPP data plane ──────────────────────────────────────────────────────

#[test]
fn ppp_data_plane_opens_and_closes_link() {
    let config = CellularConfig {
        data_plane: DataPlane::Ppp,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    assert_eq!(h.boot(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::PppOpen), 1);

    h.board.set_target_state(TargetState::Off);
    assert_eq!(h.send(Event::TargetStateCmd), S::Off);
    assert_eq!(h.modem.count(ModemCall::PppClose), 1);
    assert!(!h.modem.is_powered());
}

fn ppp_config() -> CellularConfig {
    CellularConfig {
        data_plane: DataPlane::Ppp,
        ..CellularConfig::default()
    }
}

/// Requests Off and throws away the close confirmation the modem queued.
fn off_without_ppp_confirmation(h: &mut Harness) {
    h.board.set_target_state(TargetState::Off);
    h.automaton.dispatch(Event::TargetStateCmd);
    assert_eq!(h.state(), S::PppCloseOnGoing);
    while h.automaton.queue().try_next().is_some() {}
    assert!(h.modem.is_powered());
}

#[test]
fn unconfirmed_ppp_close_times_out_to_off() {
    let mut h = Harness::new(ppp_config());
    assert_eq!(h.boot(), S::DataReady);
    h.modem.clear_calls();
    off_without_ppp_confirmation(&mut h);
    assert!(h.timers.is_armed(TimerKind::PppClose));

    assert!(h.fire(TimerKind::PppClose));
    assert_eq!(h.state(), S::Off);
    assert!(!h.modem.is_powered());
    assert_eq!(h.modem.count(ModemCall::ActivatePdn), 0);
}

#[test]
fn polling_tick_ends_unconfirmed_ppp_close() {
    let mut h = Harness::new(ppp_config());
    h.boot();
    off_without_ppp_confirmation(&mut h);

    assert!(h.fire(TimerKind::Polling));
    assert_eq!(h.state(), S::Off);
    assert!(!h.modem.is_powered());
    assert!(!h.timers.is_armed(TimerKind::PppClose));
}

#[test]
fn repeated_off_request_ends_unconfirmed_ppp_close() {
    let mut h = Harness::new(ppp_config());
    h.boot();
    off_without_ppp_confirmation(&mut h);

    assert_eq!(h.send(Event::TargetStateCmd), S::Off);
    assert!(!h.modem.is_powered());
    assert!(!h.timers.is_armed(TimerKind::PppClose));
}

#[test]
fn ppp_link_loss_reboots_modem() {
    let config = CellularConfig {
        data_plane: DataPlane::Ppp,
        ..CellularConfig::default()
    };
    let mut h = Harness::new(config);
    h.boot();
    h.modem.clear_calls();
    h.send(Event::PppClosed);
    assert_eq!(h.state(), S::DataReady);
    assert_eq!(h.modem.count(ModemCall::PowerOn), 1);
    assert_eq!(h.modem.count(ModemCall::PppOpen), 1);
}

// ─── Low power ───────────────────────────────────────────────────────────

#[cfg(feature = "low-power")]
mod low_power {
    use super::*;
    use strata_cellular::config::{PowerConfig, PowerMode};
    use strata_cellular::power::PowerState;

    fn low_power_config() -> CellularConfig {
        CellularConfig {
            power: PowerConfig {
                mode: PowerMode::LowPower,
                ..PowerConfig::default()
            },
            ..CellularConfig::default()
        }
    }

    #[test]
    fn real_time_mode_never_idles() {
        let mut h = Harness::new(CellularConfig::default());
        h.boot();
        assert!(!h.timers.is_armed(TimerKind::LpInactivity));
        h.send(Event::SleepRequest);
        assert_eq!(h.state(), S::DataReady);
        assert_eq!(h.modem.count(ModemCall::LpSleepRequest), 0);
    }

    #[test]
    fn inactivity_idles_and_modem_wakeup_resumes() {
        let mut h = Harness::new(low_power_config());
        h.modem.set_auto_sleep(true);
        h.boot();
        assert!(h.modem.lp_config().unwrap().psm);
        assert!(h.timers.is_armed(TimerKind::LpInactivity));

        assert!(h.fire(TimerKind::LpInactivity));
        assert_eq!(h.state(), S::PowerDataIdle);
        assert_eq!(h.automaton.power_context().current, PowerState::Active);
        assert_eq!(h.modem.count(ModemCall::SuspendData), 1);
        // Idle keeps the data service published as up.
        assert_eq!(h.board.data_service().unwrap().state, ServiceState::On);

        h.send(Event::PollingTimer);
        assert_eq!(h.state(), S::PowerDataIdle);

        h.modem.inject(Event::ModemWakeup);
        h.run();
        assert_eq!(h.state(), S::DataReady);
        assert_eq!(h.automaton.power_context().current, PowerState::Inactive);
        assert_eq!(h.modem.count(ModemCall::ResumeData), 1);
        assert_eq!(h.modem.count(ModemCall::LpWakeup), 0);
        assert!(h.timers.is_armed(TimerKind::LpInactivity));
    }

    #[test]
    fn unconfirmed_sleep_times_out() {
        let mut h = Harness::new(low_power_config());
        h.boot();
        h.fire(TimerKind::LpInactivity);
        assert_eq!(h.state(), S::PowerDataIdle);
        assert_eq!(h.automaton.power_context().current, PowerState::Ongoing);

        assert!(h.fire(TimerKind::LpProtection));
        assert_eq!(h.state(), S::DataReady);
        assert_eq!(h.modem.count(ModemCall::LpSleepCancel), 1);
        assert_eq!(h.modem.count(ModemCall::ResumeData), 1);
    }

    #[test]
    fn host_wakeup_wakes_modem() {
        let mut h = Harness::new(low_power_config());
        h.modem.set_auto_sleep(true);
        h.boot();
        h.send(Event::SleepRequest);
        assert_eq!(h.state(), S::PowerDataIdle);

        h.send(Event::HostWakeup);
        assert_eq!(h.state(), S::DataReady);
        assert_eq!(h.modem.count(ModemCall::LpWakeup), 1);
    }

    #[test]
    fn pdn_event_while_idle_wakes_first() {
        let mut h = Harness::new(low_power_config());
        h.modem.set_auto_sleep(true);
        h.boot();
        h.send(Event::SleepRequest);
        h.send(Event::NetworkCallback(PdnEvent::Deactivated));
        assert_eq!(h.state(), S::DataReady);
        assert_eq!(h.modem.count(ModemCall::ResumeData), 1);
        assert_eq!(h.modem.count(ModemCall::ActivatePdn), 2);
    }

    #[test]
    fn target_off_while_idle_wakes_and_powers_down() {
        let mut h = Harness::new(low_power_config());
        h.modem.set_auto_sleep(true);
        h.boot();
        h.send(Event::SleepRequest);
        h.board.set_target_state(TargetState::Off);
        assert_eq!(h.send(Event::TargetStateCmd), S::Off);
        assert_eq!(h.automaton.power_context().current, PowerState::Disabled);
        assert!(!h.timers.is_armed(TimerKind::LpProtection));
    }

    #[test]
    fn power_config_change_rearms_inactivity() {
        let mut h = Harness::new(CellularConfig::default());
        h.boot();
        assert!(!h.timers.is_armed(TimerKind::LpInactivity));

        h.board.set_config(low_power_config());
        h.send(Event::PowerConfigChanged);
        assert!(h.timers.is_armed(TimerKind::LpInactivity));
        assert!(h.modem.lp_config().unwrap().psm);
    }

    #[test]
    fn power_status_is_published() {
        use strata_cellular::distrib::Record;
        use strata_cellular::modem::NegotiatedTimers;

        let mut h = Harness::new(CellularConfig::default());
        h.boot();
        let timers = NegotiatedTimers {
            psm_active_time: Some(Duration::from_secs(2)),
            psm_periodic_tau: Some(Duration::from_secs(3600)),
            edrx_cycle: None,
        };
        h.send(Event::PowerStatusCallback(timers));
        match h.board.read(RecordKey::PowerStatus) {
            Some(Record::PowerStatus(info)) => assert_eq!(info.timers, timers),
            other => panic!("unexpected record {other:?}"),
        }
        assert_eq!(h.state(), S::DataReady);
    }
}

// ─── Queue ───────────────────────────────────────────────────────────────

#[test]
fn queue_overflow_drops_newest() {
    let mut h = Harness::new(CellularConfig::default());
    let tx = h.automaton.sender();
    for _ in 0..EVENT_QUEUE_CAPACITY {
        assert!(tx.post(Event::NoEvent));
    }
    assert!(!tx.post(Event::Boot));
    assert_eq!(h.run(), EVENT_QUEUE_CAPACITY);
    assert_eq!(h.state(), S::Boot);

    // The manager is still usable afterwards.
    assert_eq!(h.boot(), S::DataReady);
}
