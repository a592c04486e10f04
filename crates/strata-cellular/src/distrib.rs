//! # Distribution layer
//!
//! Status records the automaton publishes (cellular info, SIM, signal, data
//! service, NFMC, power) and the configuration records it reads. External
//! readers only ever see what was published here, never the automaton's
//! internal context.
//!
//! [`StatusBoard`] is the in-process implementation: latest value per key, a
//! bounded history for inspection, and the configuration behind an
//! `ArcSwap` so updates never block the worker.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::trace;

use crate::config::{CellularConfig, TargetState};
use crate::decision::SlotStatus;
use crate::modem::{AccessTechnology, DeviceIdentity, NegotiatedTimers};

const HISTORY_CAPACITY: usize = 1024;

/// Service state carried by every status record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Unavailable,
    Reset,
    Off,
    Starting,
    Run,
    On,
    Fail,
    ShuttingDown,
}

/// Coarse modem lifecycle as reported to readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModemState {
    #[default]
    Off,
    PoweredOn,
    SimReady,
    Registered,
    DataReady,
    Reprogramming,
    Failed,
    Locked,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CellularInfo {
    pub state: ServiceState,
    pub modem_state: ModemState,
    pub identity: Option<DeviceIdentity>,
    pub operator: Option<String>,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimInfo {
    pub state: ServiceState,
    pub imsi: Option<String>,
    pub iccid: Option<String>,
    /// Index into the configured slot list. Read back at init so the
    /// rotation survives a modem reboot.
    pub active_slot: usize,
    pub slots: Vec<SlotStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalInfo {
    pub state: ServiceState,
    pub rssi: u8,
    pub dbm: Option<i16>,
    pub ber: u8,
    pub access_technology: Option<AccessTechnology>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DataServiceInfo {
    pub state: ServiceState,
    pub address: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NfmcInfo {
    pub state: ServiceState,
    pub active: bool,
    pub tempos_ms: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PowerStatusInfo {
    pub state: ServiceState,
    pub timers: NegotiatedTimers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKey {
    Cellular,
    Sim,
    Signal,
    DataService,
    /// Interface-manager view of the same data path.
    NetworkInterface,
    Nfmc,
    PowerStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "key", rename_all = "snake_case")]
pub enum Record {
    Cellular(CellularInfo),
    Sim(SimInfo),
    Signal(SignalInfo),
    DataService(DataServiceInfo),
    NetworkInterface(DataServiceInfo),
    Nfmc(NfmcInfo),
    PowerStatus(PowerStatusInfo),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Cellular(_) => RecordKey::Cellular,
            Record::Sim(_) => RecordKey::Sim,
            Record::Signal(_) => RecordKey::Signal,
            Record::DataService(_) => RecordKey::DataService,
            Record::NetworkInterface(_) => RecordKey::NetworkInterface,
            Record::Nfmc(_) => RecordKey::Nfmc,
            Record::PowerStatus(_) => RecordKey::PowerStatus,
        }
    }

    pub fn state(&self) -> ServiceState {
        match self {
            Record::Cellular(r) => r.state,
            Record::Sim(r) => r.state,
            Record::Signal(r) => r.state,
            Record::DataService(r) | Record::NetworkInterface(r) => r.state,
            Record::Nfmc(r) => r.state,
            Record::PowerStatus(r) => r.state,
        }
    }
}

/// What the automaton needs from the distribution layer.
pub trait Distribution: Send + Sync {
    fn publish(&self, record: Record);
    fn read(&self, key: RecordKey) -> Option<Record>;
    fn cellular_config(&self) -> Arc<CellularConfig>;
    fn target_state(&self) -> TargetState;
}

// ─── In-process board ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct BoardSnapshot {
    pub target_state: TargetState,
    pub records: Vec<Record>,
}

pub struct StatusBoard {
    config: ArcSwap<CellularConfig>,
    target: RwLock<TargetState>,
    records: RwLock<HashMap<RecordKey, Record>>,
    history: Mutex<VecDeque<Record>>,
}

impl StatusBoard {
    pub fn new(config: CellularConfig) -> Self {
        let target = config.target_state;
        Self {
            config: ArcSwap::from_pointee(config),
            target: RwLock::new(target),
            records: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(64)),
        }
    }

    /// Replaces the configuration record. The caller posts the matching
    /// notification event.
    pub fn set_config(&self, config: CellularConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn set_target_state(&self, target: TargetState) {
        *self.target.write().unwrap_or_else(|e| e.into_inner()) = target;
    }

    /// Every record published under `key`, oldest first.
    pub fn history(&self, key: RecordKey) -> Vec<Record> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.key() == key)
            .cloned()
            .collect()
    }

    /// Service states published under `key`, with consecutive duplicates
    /// collapsed.
    pub fn state_trail(&self, key: RecordKey) -> Vec<ServiceState> {
        let mut trail: Vec<ServiceState> = Vec::new();
        for record in self.history(key) {
            let state = record.state();
            if trail.last() != Some(&state) {
                trail.push(state);
            }
        }
        trail
    }

    pub fn cellular(&self) -> Option<CellularInfo> {
        match self.read(RecordKey::Cellular)? {
            Record::Cellular(info) => Some(info),
            _ => None,
        }
    }

    pub fn sim(&self) -> Option<SimInfo> {
        match self.read(RecordKey::Sim)? {
            Record::Sim(info) => Some(info),
            _ => None,
        }
    }

    pub fn data_service(&self) -> Option<DataServiceInfo> {
        match self.read(RecordKey::DataService)? {
            Record::DataService(info) => Some(info),
            _ => None,
        }
    }

    pub fn nfmc(&self) -> Option<NfmcInfo> {
        match self.read(RecordKey::Nfmc)? {
            Record::Nfmc(info) => Some(info),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<Record> = records.values().cloned().collect();
        records.sort_by_key(|r| r.key() as u8);
        BoardSnapshot {
            target_state: self.target_state(),
            records,
        }
    }
}

impl Distribution for StatusBoard {
    fn publish(&self, record: Record) {
        trace!(key = ?record.key(), state = ?record.state(), "publish");
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() == HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.key(), record);
    }

    fn read(&self, key: RecordKey) -> Option<Record> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    fn cellular_config(&self) -> Arc<CellularConfig> {
        self.config.load_full()
    }

    fn target_state(&self) -> TargetState {
        *self.target.read().unwrap_or_else(|e| e.into_inner())
    }
}
