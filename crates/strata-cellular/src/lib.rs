//! # strata-cellular
//!
//! Cellular connectivity manager: brings a modem from power-on to an active
//! data path and keeps it there through signal loss, network rejection, SIM
//! failures, firmware updates and low-power idling.
//!
//! ## Crate structure
//!
//! - [`fsm`]: Connectivity automaton (states, transitions, context)
//! - [`retry`]: Per-cause and global retry counters
//! - [`power`]: Power coordinator for PSM/eDRX sleep (feature `low-power`)
//! - [`decision`]: Signal, registration, APN, NFMC and SIM decisions
//! - [`event`]: Events and the bounded mailbox
//! - [`timer`]: Generation-stamped timers (thread and manual backends)
//! - [`modem`]: Modem driver trait, serialized session, simulated driver
//! - [`distrib`]: Published status records and the in-process board
//! - [`config`]: TOML configuration
//! - [`runtime`]: Worker thread running the automaton

pub mod config;
pub mod decision;
pub mod distrib;
pub mod error;
pub mod event;
pub mod fsm;
pub mod modem;
#[cfg(feature = "low-power")]
pub mod power;
pub mod retry;
pub mod runtime;
pub mod timer;

pub use config::{CellularConfig, TargetState};
pub use distrib::StatusBoard;
pub use fsm::{ConnectivityState, ExitReason};
pub use runtime::CellularRuntime;
