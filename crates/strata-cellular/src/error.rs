//! Error types shared across the connectivity manager.

use thiserror::Error;

// ── Modem ───────────────────────────────────────────────────────────

/// Failure returned by a synchronous Modem Driver call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModemError {
    #[error("modem did not answer in time")]
    Timeout,
    #[error("modem rejected the request: {0}")]
    Rejected(String),
    #[error("operation not supported by this modem")]
    Unsupported,
    #[error("no SIM inserted in the selected slot")]
    SimNotInserted,
    #[error("SIM PIN required or wrong PIN")]
    SimPinRequired,
    #[error("SIM locked, PUK required")]
    SimPukLocked,
    #[error("SIM access failure")]
    SimFailure,
}

impl ModemError {
    /// Whether the error comes from the SIM rather than the modem itself.
    pub fn is_sim(&self) -> bool {
        matches!(
            self,
            ModemError::SimNotInserted
                | ModemError::SimPinRequired
                | ModemError::SimPukLocked
                | ModemError::SimFailure
        )
    }
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config version {0}")]
    Version(u32),
    #[error("too many NFMC coefficients ({0}, max {max})", max = crate::decision::NFMC_TEMPO_MAX)]
    TooManyNfmcValues(usize),
    #[error("invalid operator selection {0:?}")]
    Operator(String),
}

/// Rejection of an APN or credential that does not fit the modem's fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApnError {
    #[error("APN is {0} bytes, limit is {max}", max = crate::decision::APN_MAX_LEN)]
    ApnTooLong(usize),
    #[error("username is {0} bytes, limit is {max}", max = crate::decision::CREDENTIAL_MAX_LEN)]
    UsernameTooLong(usize),
    #[error("password is {0} bytes, limit is {max}", max = crate::decision::CREDENTIAL_MAX_LEN)]
    PasswordTooLong(usize),
}
