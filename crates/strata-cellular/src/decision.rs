//! # Decision utilities
//!
//! Pure helpers the automaton consults: signal evaluation, registration
//! classification, APN resolution from the IMSI, NFMC backoff tempos and SIM
//! slot rotation. Nothing here touches the modem or the clock.

use std::time::Duration;

use serde::Serialize;

use crate::config::{NfmcConfig, SimSlotConfig};
use crate::error::{ApnError, ModemError};
use crate::modem::{PdnContext, RegistrationReport, RegistrationState, SignalQuality};

/// Longest APN the modem's PDN definition accepts.
pub const APN_MAX_LEN: usize = 63;
/// Longest username or password.
pub const CREDENTIAL_MAX_LEN: usize = 32;
/// Maximum number of NFMC coefficients / tempos.
pub const NFMC_TEMPO_MAX: usize = 7;
/// Raw RSSI value meaning "not known or not detectable".
pub const RSSI_UNKNOWN: u8 = 99;

// ─── Signal ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalVerdict {
    Usable,
    /// Level 0: at or below the detection floor.
    TooWeak,
    /// Level 99 or out of range: the modem has no measurement yet.
    Unknown,
}

/// Maps the 0–31 scale to dBm: `-113 + 2 * rssi`.
pub fn rssi_to_dbm(rssi: u8) -> Option<i16> {
    (rssi <= 31).then(|| -113 + 2 * i16::from(rssi))
}

pub fn evaluate_signal(quality: SignalQuality) -> SignalVerdict {
    match quality.rssi {
        0 => SignalVerdict::TooWeak,
        1..=31 => SignalVerdict::Usable,
        _ => SignalVerdict::Unknown,
    }
}

// ─── Registration ───────────────────────────────────────────────────────────

/// Outcome of a registration poll, as the automaton consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Registered,
    NotRegistered,
    Unknown,
    /// The network refused us, or the report could not be read.
    Error,
}

/// Registered on either packet domain wins. A denial on either is an error.
/// The circuit-switched domain is informational only.
pub fn classify_registration(report: &RegistrationReport) -> NetworkStatus {
    let packet = [report.ps, report.eps];
    if packet.iter().any(|s| s.is_registered()) {
        return NetworkStatus::Registered;
    }
    if packet.contains(&RegistrationState::Denied) {
        return NetworkStatus::Error;
    }
    if packet
        .iter()
        .any(|s| matches!(s, RegistrationState::Searching | RegistrationState::NotRegistered))
    {
        return NetworkStatus::NotRegistered;
    }
    NetworkStatus::Unknown
}

// ─── APN ────────────────────────────────────────────────────────────────────

/// Default APNs keyed by network identity (MCC + MNC).
const APN_TABLE: &[(&str, &str)] = &[
    ("20801", "orange"),
    ("20810", "sl2sfr"),
    ("20820", "ebouygtel.com"),
    ("29505", "em"),
    ("90140", "iot.1nce.net"),
    ("31041", "broadband"),
];

/// First five digits of the IMSI, if it has that many.
pub fn network_identity(imsi: &str) -> Option<&str> {
    let head = imsi.get(..5)?;
    head.bytes().all(|b| b.is_ascii_digit()).then_some(head)
}

pub fn apn_for_network(plmn: &str) -> Option<&'static str> {
    APN_TABLE
        .iter()
        .find(|(id, _)| *id == plmn)
        .map(|(_, apn)| *apn)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApnSource {
    Configured,
    /// Looked up from the IMSI's network identity.
    Table,
    /// Nothing known: the modem keeps its own default.
    ModemDefault,
}

/// Builds the PDN context for `slot`.
///
/// An explicit APN wins. Otherwise the IMSI's network identity is looked up;
/// unknown networks leave the APN unset. Oversize fields are rejected rather
/// than truncated.
pub fn resolve_apn(slot: &SimSlotConfig, imsi: &str) -> Result<(PdnContext, ApnSource), ApnError> {
    if slot.username.len() > CREDENTIAL_MAX_LEN {
        return Err(ApnError::UsernameTooLong(slot.username.len()));
    }
    if slot.password.len() > CREDENTIAL_MAX_LEN {
        return Err(ApnError::PasswordTooLong(slot.password.len()));
    }

    let (apn, source) = if !slot.apn.is_empty() {
        (Some(slot.apn.clone()), ApnSource::Configured)
    } else {
        match network_identity(imsi).and_then(apn_for_network) {
            Some(apn) => (Some(apn.to_string()), ApnSource::Table),
            None => (None, ApnSource::ModemDefault),
        }
    };
    if let Some(apn) = &apn {
        if apn.len() > APN_MAX_LEN {
            return Err(ApnError::ApnTooLong(apn.len()));
        }
    }

    Ok((
        PdnContext {
            cid: slot.cid,
            apn,
            username: slot.username.clone(),
            password: slot.password.clone(),
        },
        source,
    ))
}

// ─── NFMC ───────────────────────────────────────────────────────────────────

/// IMSI digits as a number, split into (high, low) 32-bit words. Non-digit
/// characters are skipped; an IMSI has at most 15 digits so it fits in u64.
pub fn imsi_words(imsi: &str) -> (u32, u32) {
    let value = imsi
        .bytes()
        .filter(u8::is_ascii_digit)
        .fold(0u64, |acc, b| acc.wrapping_mul(10).wrapping_add(u64::from(b - b'0')));
    ((value >> 32) as u32, value as u32)
}

/// Per-device retry tempos: each coefficient (seconds) plus an IMSI-derived
/// offset inside a window of the same length, so a fleet spreads out.
pub fn compute_nfmc_tempos(imsi: &str, coefficients: &[u32]) -> Vec<Duration> {
    let (_, low) = imsi_words(imsi);
    coefficients
        .iter()
        .take(NFMC_TEMPO_MAX)
        .map(|&coeff| {
            let base_ms = u64::from(coeff) * 1000;
            let window_ms = u64::from(coeff.max(1)) * 1000;
            Duration::from_millis(base_ms + u64::from(low) % window_ms)
        })
        .collect()
}

/// NFMC state owned by the automaton.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NfmcContext {
    pub active: bool,
    /// A backoff is currently running.
    pub in_progress: bool,
    pub tempos: Vec<Duration>,
    /// IMSI the tempos were computed from.
    pub imsi: Option<String>,
}

impl NfmcContext {
    /// Recomputes the tempos if the IMSI or config changed. Returns `true`
    /// when the table was rebuilt.
    pub fn refresh(&mut self, config: &NfmcConfig, imsi: &str) -> bool {
        let active = config.enabled && !config.coefficients.is_empty();
        let tempos = if active {
            compute_nfmc_tempos(imsi, &config.coefficients)
        } else {
            Vec::new()
        };
        if self.imsi.as_deref() == Some(imsi) && self.active == active && self.tempos == tempos {
            return false;
        }
        self.active = active;
        self.tempos = tempos;
        self.imsi = Some(imsi.to_string());
        true
    }

    /// Forget the IMSI so the next SIM read recomputes.
    pub fn invalidate(&mut self) {
        self.imsi = None;
    }

    pub fn tempo(&self, index: usize) -> Option<Duration> {
        if !self.active || self.tempos.is_empty() {
            return None;
        }
        self.tempos.get(index % self.tempos.len()).copied()
    }

    /// Index following `index`, wrapping back to the first tempo.
    pub fn next_index(&self, index: usize) -> usize {
        if self.tempos.is_empty() {
            0
        } else {
            (index + 1) % self.tempos.len()
        }
    }
}

// ─── SIM ────────────────────────────────────────────────────────────────────

/// Per-slot outcome of the last SIM initialization attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    #[default]
    Unknown,
    Ok,
    NotInserted,
    PinRequired,
    PukLocked,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimAccess {
    /// Try the next configured slot.
    Fallback(SlotStatus),
    /// Retrying would burn PIN/PUK attempts: halt.
    Lockout(SlotStatus),
}

pub fn classify_sim_error(err: &ModemError) -> SimAccess {
    match err {
        ModemError::SimPinRequired => SimAccess::Lockout(SlotStatus::PinRequired),
        ModemError::SimPukLocked => SimAccess::Lockout(SlotStatus::PukLocked),
        ModemError::SimNotInserted => SimAccess::Fallback(SlotStatus::NotInserted),
        _ => SimAccess::Fallback(SlotStatus::Failure),
    }
}

pub fn next_sim_slot(current: usize, slot_count: usize) -> usize {
    if slot_count == 0 {
        0
    } else {
        (current + 1) % slot_count
    }
}
