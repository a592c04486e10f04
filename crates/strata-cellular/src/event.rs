//! # Event Queue
//!
//! Every producer (timer thread, modem URC callbacks, operator commands,
//! distribution-layer notifications) talks to the automaton by posting an
//! [`Event`] into a single bounded mailbox. The automaton worker is the only
//! consumer.
//!
//! The mailbox is a `crossbeam_channel::bounded` channel of
//! [`EVENT_QUEUE_CAPACITY`] slots. Producers never block: when the queue is
//! full the event is logged and dropped.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{trace, warn};

#[cfg(feature = "low-power")]
use crate::modem::NegotiatedTimers;
use crate::modem::{PdnEvent, SimEvent};
use crate::timer::TimerFired;

/// Mailbox depth. Producers drop on overflow.
pub const EVENT_QUEUE_CAPACITY: usize = 10;

/// Coarse origin of an event, used for triage before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    /// Internal progression, modem driver callbacks and timer expiries.
    Service,
    /// Explicit request from an operator or API caller.
    Command,
    /// A record the automaton reads changed in the distribution layer.
    Notification,
}

/// Semantic event consumed by the connectivity automaton.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Boot,
    ModemInit,
    ModemReady,
    SignalCheck,
    NetworkStatusCheck,
    NetworkStatusOk,
    ModemAttached,
    PdnActivated,
    PdnStatusCheck,
    PdnRetryTimer,
    /// The data plane (sockets or PPP) reported a failure.
    DataFail,
    PollingTimer,
    /// Registration-related URC: the modem thinks the network status changed.
    ModemUrc,
    NoEvent,
    UnknownCommand,
    /// The target-state record changed.
    TargetStateCmd,
    /// The APN configuration changed.
    ApnConfig,
    RebootModem,
    PowerOnOnly,
    /// PDN event from the packet-domain subscription.
    NetworkCallback(PdnEvent),
    RegistrationTimeout,
    FotaStart,
    FotaEnd,
    FotaTimeout,
    ModemReset,
    ModemReboot,
    PppOpened,
    PppClosed,
    /// The modem never confirmed a PPP close.
    PppCloseTimeout,
    ModemPowerDown,
    /// SIM hardware event (insert / remove / refresh).
    SimReset(SimEvent),
    /// The modem reported the PSM/eDRX timers granted by the network.
    #[cfg(feature = "low-power")]
    PowerStatusCallback(NegotiatedTimers),
    #[cfg(feature = "low-power")]
    PowerConfigChanged,
    #[cfg(feature = "low-power")]
    SleepTimeout,
    #[cfg(feature = "low-power")]
    SleepRequest,
    #[cfg(feature = "low-power")]
    SleepComplete,
    #[cfg(feature = "low-power")]
    HostWakeup,
    #[cfg(feature = "low-power")]
    ModemWakeup,
    #[cfg(feature = "low-power")]
    SleepAbort,
    #[cfg(feature = "low-power")]
    LpInactivity,
    /// Raw timer expiry. Translated to its semantic event by the automaton
    /// only if the timer is still armed with the same generation.
    Timer(TimerFired),
}

impl Event {
    pub fn class(&self) -> MessageClass {
        match self {
            Event::RebootModem | Event::PowerOnOnly | Event::UnknownCommand => {
                MessageClass::Command
            }
            #[cfg(feature = "low-power")]
            Event::SleepRequest | Event::HostWakeup => MessageClass::Command,
            Event::TargetStateCmd | Event::ApnConfig => MessageClass::Notification,
            #[cfg(feature = "low-power")]
            Event::PowerConfigChanged => MessageClass::Notification,
            _ => MessageClass::Service,
        }
    }
}

// ─── Mailbox ────────────────────────────────────────────────────────────────

/// Producer half of the mailbox. Cheap to clone and hand to callbacks.
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    /// Posts an event without blocking. Returns `false` if it was dropped.
    pub fn post(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(?event, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(event)) => {
                trace!(?event, "event queue closed, dropping event");
                false
            }
        }
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("pending", &self.tx.len())
            .finish()
    }
}

/// Single-consumer mailbox owned by the automaton.
pub struct EventQueue {
    tx: Sender<Event>,
    rx: Receiver<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self { tx, rx }
    }

    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn receiver(&self) -> &Receiver<Event> {
        &self.rx
    }

    /// Pops the next pending event without blocking.
    pub fn try_next(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
