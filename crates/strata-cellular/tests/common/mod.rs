//! Synchronous harness: automaton + scripted modem + manual timers.
#![allow(dead_code)]

use std::sync::Arc;

use strata_cellular::config::{CellularConfig, SimSlotConfig, SimSlotType};
use strata_cellular::event::{Event, EventQueue};
use strata_cellular::fsm::{Automaton, ConnectivityState};
use strata_cellular::modem::sim::SimulatedModem;
use strata_cellular::modem::ModemSession;
use strata_cellular::timer::{ManualTimers, TimerKind};
use strata_cellular::StatusBoard;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub automaton: Automaton,
    pub modem: SimulatedModem,
    pub board: Arc<StatusBoard>,
    pub timers: ManualTimers,
}

impl Harness {
    pub fn new(config: CellularConfig) -> Self {
        init_tracing();
        let modem = SimulatedModem::new();
        let board = Arc::new(StatusBoard::new(config));
        let timers = ManualTimers::new();
        let automaton = Automaton::new(
            ModemSession::new(modem.clone()),
            board.clone(),
            Box::new(timers.clone()),
            EventQueue::new(),
        );
        Self {
            automaton,
            modem,
            board,
            timers,
        }
    }

    /// Boots and runs until the queue drains.
    pub fn boot(&mut self) -> ConnectivityState {
        self.automaton.start();
        self.run();
        self.state()
    }

    pub fn run(&mut self) -> usize {
        self.automaton.run_pending()
    }

    /// Dispatches `event` and everything it causes.
    pub fn send(&mut self, event: Event) -> ConnectivityState {
        self.automaton.dispatch(event);
        self.run();
        self.state()
    }

    /// Expires `kind` if armed. Returns `false` if it was not.
    pub fn fire(&mut self, kind: TimerKind) -> bool {
        match self.timers.fire(kind) {
            Some(fired) => {
                self.send(Event::Timer(fired));
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.automaton.state()
    }
}

pub fn two_slot_config() -> CellularConfig {
    CellularConfig {
        sim_slots: vec![
            SimSlotConfig::default(),
            SimSlotConfig {
                slot: SimSlotType::Embedded,
                cid: 2,
                ..SimSlotConfig::default()
            },
        ],
        ..CellularConfig::default()
    }
}
