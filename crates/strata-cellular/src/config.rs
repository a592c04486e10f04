//! Cellular configuration.
//!
//! The on-disk form is TOML, deserialized into the `*Input` structs with every
//! field optional, then resolved into [`CellularConfig`] with defaults applied.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::decision::NFMC_TEMPO_MAX;
use crate::error::ConfigError;

pub const CONFIG_VERSION: u32 = 1;

pub const DEFAULT_MAX_RETRIES_PER_CAUSE: u8 = 5;
pub const DEFAULT_MAX_GLOBAL_RETRIES: u8 = 5;

// ─── Enumerations ───────────────────────────────────────────────────────────

/// The lifecycle level the operator wants the modem to reach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    Off,
    SimOnly,
    #[default]
    Full,
    ModemOnly,
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetState::Off => write!(f, "off"),
            TargetState::SimOnly => write!(f, "sim_only"),
            TargetState::Full => write!(f, "full"),
            TargetState::ModemOnly => write!(f, "modem_only"),
        }
    }
}

impl std::str::FromStr for TargetState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(TargetState::Off),
            "sim_only" | "sim-only" | "sim" => Ok(TargetState::SimOnly),
            "full" => Ok(TargetState::Full),
            "modem_only" | "modem-only" | "modem" => Ok(TargetState::ModemOnly),
            other => Err(format!("unknown target state: {other}")),
        }
    }
}

/// Physical location of a SIM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimSlotType {
    /// Removable SIM in the modem socket.
    #[default]
    Socket,
    /// Soldered eSIM / MFF2.
    Embedded,
    /// SIM emulated by the host processor.
    HostResident,
}

/// How IP traffic leaves the modem once the PDN is up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPlane {
    /// Modem-internal IP stack driven through socket commands.
    #[default]
    Socket,
    /// PPP over the serial link, host IP stack.
    Ppp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum OperatorSelection {
    #[default]
    Automatic,
    /// Manual selection of a numeric PLMN (MCC + MNC, 5 or 6 digits).
    Manual(String),
}

impl OperatorSelection {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("auto") || raw.eq_ignore_ascii_case("automatic") {
            return Ok(OperatorSelection::Automatic);
        }
        if (5..=6).contains(&raw.len()) && raw.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(OperatorSelection::Manual(raw.to_string()));
        }
        Err(ConfigError::Operator(raw.to_string()))
    }
}

/// Power mode, from "always reachable" to "deepest sleep".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    #[default]
    RealTime,
    LowLatency,
    Balanced,
    Efficient,
    LowPower,
    VeryLowPower,
    UltraLowPower,
}

// ─── Input (deserialized) ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CellularConfigInput {
    pub version: u32,
    pub target_state: Option<TargetState>,
    pub attach_timeout_ms: Option<u64>,
    pub operator: Option<String>,
    pub data_plane: Option<DataPlane>,
    pub polling_period_ms: Option<u64>,
    pub pdn_retry_delay_ms: Option<u64>,
    pub register_retry_delay_ms: Option<u64>,
    pub fota_timeout_ms: Option<u64>,
    pub ppp_close_timeout_ms: Option<u64>,
    pub sim_slots: Vec<SimSlotInput>,
    pub retry: RetryInput,
    pub nfmc: NfmcInput,
    pub power: PowerInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SimSlotInput {
    pub slot: SimSlotType,
    pub apn: String,
    pub cid: Option<u8>,
    pub username: String,
    pub password: String,
    pub send_apn: Option<bool>,
    pub apn_changed: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryInput {
    pub max_per_cause: Option<u8>,
    pub max_global: Option<u8>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NfmcInput {
    pub enabled: bool,
    pub coefficients: Vec<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PowerInput {
    pub mode: Option<PowerMode>,
    pub inactivity_timeout_ms: Option<u64>,
    pub sleep_timeout_ms: Option<u64>,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

/// One SIM slot the manager may use, in rotation order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimSlotConfig {
    pub slot: SimSlotType,
    /// Explicit APN; empty means "resolve from the IMSI".
    pub apn: String,
    pub cid: u8,
    pub username: String,
    pub password: String,
    /// Whether the APN is pushed to the modem at all.
    pub send_apn: bool,
    pub apn_changed: bool,
}

impl Default for SimSlotConfig {
    fn default() -> Self {
        Self {
            slot: SimSlotType::Socket,
            apn: String::new(),
            cid: 1,
            username: String::new(),
            password: String::new(),
            send_apn: true,
            apn_changed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryLimits {
    pub max_per_cause: u8,
    pub max_global: u8,
}

impl Default for RetryLimits {
    fn default() -> Self {
        Self {
            max_per_cause: DEFAULT_MAX_RETRIES_PER_CAUSE,
            max_global: DEFAULT_MAX_GLOBAL_RETRIES,
        }
    }
}

/// Network-friendly backoff configuration. Coefficients are in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NfmcConfig {
    pub enabled: bool,
    pub coefficients: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerConfig {
    pub mode: PowerMode,
    /// Data inactivity before the coordinator is asked to idle the link.
    pub inactivity_timeout: Duration,
    /// Protection window for the modem to confirm a sleep request.
    pub sleep_timeout: Duration,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            mode: PowerMode::RealTime,
            inactivity_timeout: Duration::from_secs(10),
            sleep_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CellularConfig {
    pub version: u32,
    pub target_state: TargetState,
    pub sim_slots: Vec<SimSlotConfig>,
    pub attach_timeout: Duration,
    pub operator: OperatorSelection,
    pub data_plane: DataPlane,
    pub polling_period: Duration,
    pub pdn_retry_delay: Duration,
    pub register_retry_delay: Duration,
    pub fota_timeout: Duration,
    /// How long a PPP close may stay unconfirmed before the modem is
    /// powered off regardless.
    pub ppp_close_timeout: Duration,
    pub retry: RetryLimits,
    pub nfmc: NfmcConfig,
    pub power: PowerConfig,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            target_state: TargetState::Full,
            sim_slots: vec![SimSlotConfig::default()],
            attach_timeout: Duration::from_secs(180),
            operator: OperatorSelection::Automatic,
            data_plane: DataPlane::Socket,
            polling_period: Duration::from_secs(5),
            pdn_retry_delay: Duration::from_secs(30),
            register_retry_delay: Duration::from_secs(60),
            fota_timeout: Duration::from_secs(6 * 60),
            ppp_close_timeout: Duration::from_secs(10),
            retry: RetryLimits::default(),
            nfmc: NfmcConfig::default(),
            power: PowerConfig::default(),
        }
    }
}

impl CellularConfigInput {
    pub fn resolve(self) -> Result<CellularConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::Version(version));
        }

        let defaults = CellularConfig::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

        let mut sim_slots: Vec<SimSlotConfig> = self
            .sim_slots
            .into_iter()
            .map(|s| SimSlotConfig {
                slot: s.slot,
                apn: s.apn.trim().to_string(),
                cid: s.cid.unwrap_or(1).max(1),
                username: s.username,
                password: s.password,
                send_apn: s.send_apn.unwrap_or(true),
                apn_changed: s.apn_changed,
            })
            .collect();
        if sim_slots.is_empty() {
            sim_slots = defaults.sim_slots.clone();
        }

        if self.nfmc.coefficients.len() > NFMC_TEMPO_MAX {
            return Err(ConfigError::TooManyNfmcValues(self.nfmc.coefficients.len()));
        }

        let operator = match self.operator {
            Some(raw) => OperatorSelection::parse(&raw)?,
            None => OperatorSelection::Automatic,
        };

        let power_defaults = PowerConfig::default();
        let power = PowerConfig {
            mode: self.power.mode.unwrap_or(power_defaults.mode),
            inactivity_timeout: ms(
                self.power.inactivity_timeout_ms,
                power_defaults.inactivity_timeout,
            ),
            sleep_timeout: ms(self.power.sleep_timeout_ms, power_defaults.sleep_timeout),
        };

        Ok(CellularConfig {
            version,
            target_state: self.target_state.unwrap_or(defaults.target_state),
            sim_slots,
            attach_timeout: ms(self.attach_timeout_ms, defaults.attach_timeout),
            operator,
            data_plane: self.data_plane.unwrap_or_default(),
            // A zero polling period would spin the timer thread.
            polling_period: ms(self.polling_period_ms, defaults.polling_period)
                .max(Duration::from_millis(100)),
            pdn_retry_delay: ms(self.pdn_retry_delay_ms, defaults.pdn_retry_delay),
            register_retry_delay: ms(self.register_retry_delay_ms, defaults.register_retry_delay),
            fota_timeout: ms(self.fota_timeout_ms, defaults.fota_timeout),
            ppp_close_timeout: ms(self.ppp_close_timeout_ms, defaults.ppp_close_timeout),
            retry: RetryLimits {
                max_per_cause: self
                    .retry
                    .max_per_cause
                    .unwrap_or(DEFAULT_MAX_RETRIES_PER_CAUSE),
                max_global: self.retry.max_global.unwrap_or(DEFAULT_MAX_GLOBAL_RETRIES),
            },
            nfmc: NfmcConfig {
                enabled: self.nfmc.enabled,
                coefficients: self.nfmc.coefficients,
            },
            power,
        })
    }
}

impl CellularConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(CellularConfig::default());
        }
        let parsed: CellularConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}
