//! # Retry / backoff policy
//!
//! Every recoverable failure is counted against its cause and against a
//! global budget. While both budgets hold, the automaton power-cycles the
//! modem and starts over; once either is exceeded it stops in `Fail`.
//! Counters are cleared when the data path comes up.

use serde::Serialize;

use crate::config::RetryLimits;

/// Recoverable failure categories, one counter each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    PowerOn,
    Reset,
    SignalQuality,
    Attach,
    PdnDefine,
    Register,
    Network,
    Sim,
    Ppp,
}

impl FailureCause {
    pub const ALL: [FailureCause; 9] = [
        FailureCause::PowerOn,
        FailureCause::Reset,
        FailureCause::SignalQuality,
        FailureCause::Attach,
        FailureCause::PdnDefine,
        FailureCause::Register,
        FailureCause::Network,
        FailureCause::Sim,
        FailureCause::Ppp,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCause::PowerOn => "power_on",
            FailureCause::Reset => "reset",
            FailureCause::SignalQuality => "signal_quality",
            FailureCause::Attach => "attach",
            FailureCause::PdnDefine => "pdn_define",
            FailureCause::Register => "register",
            FailureCause::Network => "network",
            FailureCause::Sim => "sim",
            FailureCause::Ppp => "ppp",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Budget left: reboot the modem and try again.
    Reboot,
    /// Budget exhausted: stop until an operator intervenes.
    Fail,
}

/// Failure counters plus the limits they are checked against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    limits: RetryLimits,
    counters: [u8; FailureCause::ALL.len()],
    global: u8,
}

impl RetryPolicy {
    pub fn new(limits: RetryLimits) -> Self {
        Self {
            limits,
            counters: [0; FailureCause::ALL.len()],
            global: 0,
        }
    }

    pub fn set_limits(&mut self, limits: RetryLimits) {
        self.limits = limits;
    }

    pub fn limits(&self) -> RetryLimits {
        self.limits
    }

    /// Counts one failure and decides what happens next.
    ///
    /// Every failure also ends in a modem reset, so the reset counter moves
    /// with it, once.
    pub fn record(&mut self, cause: FailureCause) -> RetryDecision {
        let slot = &mut self.counters[cause.index()];
        *slot = slot.saturating_add(1);
        if cause != FailureCause::Reset {
            let reset = &mut self.counters[FailureCause::Reset.index()];
            *reset = reset.saturating_add(1);
        }
        self.global = self.global.saturating_add(1);

        if self.count(cause) <= self.limits.max_per_cause && self.global <= self.limits.max_global
        {
            RetryDecision::Reboot
        } else {
            RetryDecision::Fail
        }
    }

    pub fn count(&self, cause: FailureCause) -> u8 {
        self.counters[cause.index()]
    }

    pub fn global(&self) -> u8 {
        self.global
    }

    pub fn is_clear(&self) -> bool {
        self.global == 0 && self.counters.iter().all(|&c| c == 0)
    }

    pub fn reset(&mut self) {
        self.counters = [0; FailureCause::ALL.len()];
        self.global = 0;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryLimits::default())
    }
}
