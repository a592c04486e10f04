//! # Timers
//!
//! One-shot and periodic alarms owned by the automaton. Each arm bumps a
//! generation counter; the expiry carries that generation back through the
//! event queue and [`Timers::accept`] drops it unless the same arm is still
//! live. A cancel that races an expiry already sitting in the queue therefore
//! cannot deliver a stale event to the next state.
//!
//! Two backends are provided:
//!
//! - [`ThreadTimers`]: a dedicated thread fed by a crossbeam command channel,
//!   deadlines measured with `quanta::Instant`.
//! - [`ManualTimers`]: records arms and lets the caller fire them, for
//!   deterministic tests and for hosts that already own a clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use tracing::{debug, trace};

use crate::event::{Event, EventSender};

/// Every alarm the automaton can arm. At most one of each kind is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Attachment timeout while waiting for network registration.
    Registration,
    PdnRetry,
    /// Delay before re-powering the modem after a registration timeout.
    RegisterBackoff,
    Fota,
    Polling,
    /// Confirmation window for a PPP close before powering off.
    PppClose,
    #[cfg(feature = "low-power")]
    LpInactivity,
    /// Protection window around a sleep request.
    #[cfg(feature = "low-power")]
    LpProtection,
}

const TIMER_SLOTS: usize = 8;

impl TimerKind {
    fn slot(self) -> usize {
        match self {
            TimerKind::Registration => 0,
            TimerKind::PdnRetry => 1,
            TimerKind::RegisterBackoff => 2,
            TimerKind::Fota => 3,
            TimerKind::Polling => 4,
            TimerKind::PppClose => 5,
            #[cfg(feature = "low-power")]
            TimerKind::LpInactivity => 6,
            #[cfg(feature = "low-power")]
            TimerKind::LpProtection => 7,
        }
    }

    pub fn is_periodic(self) -> bool {
        matches!(self, TimerKind::Polling)
    }

    /// The event delivered to state handlers when this timer expires.
    pub fn event(self) -> Event {
        match self {
            TimerKind::Registration => Event::RegistrationTimeout,
            TimerKind::PdnRetry => Event::PdnRetryTimer,
            TimerKind::RegisterBackoff => Event::ModemInit,
            TimerKind::Fota => Event::FotaTimeout,
            TimerKind::Polling => Event::PollingTimer,
            TimerKind::PppClose => Event::PppCloseTimeout,
            #[cfg(feature = "low-power")]
            TimerKind::LpInactivity => Event::LpInactivity,
            #[cfg(feature = "low-power")]
            TimerKind::LpProtection => Event::SleepTimeout,
        }
    }
}

/// Expiry notice posted by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub generation: u64,
}

/// Scheduling backend. Expiries are delivered as [`Event::Timer`].
pub trait TimerBackend: Send {
    fn arm(&mut self, kind: TimerKind, generation: u64, after: Duration, periodic: bool);
    fn cancel(&mut self, kind: TimerKind);
}

// ─── Generation bookkeeping ─────────────────────────────────────────────────

/// Automaton-side view of the timers: what is armed, with which generation.
pub struct Timers {
    backend: Box<dyn TimerBackend>,
    armed: [Option<u64>; TIMER_SLOTS],
    generation: u64,
}

impl Timers {
    pub fn new(backend: Box<dyn TimerBackend>) -> Self {
        Self {
            backend,
            armed: [None; TIMER_SLOTS],
            generation: 0,
        }
    }

    /// Arms `kind`, replacing any previous arm of the same kind.
    pub fn start(&mut self, kind: TimerKind, after: Duration) {
        self.generation += 1;
        self.armed[kind.slot()] = Some(self.generation);
        trace!(?kind, ?after, generation = self.generation, "timer armed");
        self.backend
            .arm(kind, self.generation, after, kind.is_periodic());
    }

    pub fn stop(&mut self, kind: TimerKind) {
        if self.armed[kind.slot()].take().is_some() {
            trace!(?kind, "timer stopped");
            self.backend.cancel(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed[kind.slot()].is_some()
    }

    /// Translates an expiry into its semantic event, or `None` if stale.
    pub fn accept(&mut self, fired: TimerFired) -> Option<Event> {
        let slot = fired.kind.slot();
        match self.armed[slot] {
            Some(generation) if generation == fired.generation => {
                if !fired.kind.is_periodic() {
                    self.armed[slot] = None;
                }
                Some(fired.kind.event())
            }
            _ => {
                debug!(kind = ?fired.kind, generation = fired.generation, "discarding stale timer expiry");
                None
            }
        }
    }
}

// ─── Thread backend ─────────────────────────────────────────────────────────

enum TimerCommand {
    Arm {
        kind: TimerKind,
        generation: u64,
        after: Duration,
        periodic: bool,
    },
    Cancel(TimerKind),
    Shutdown,
}

/// Timer thread posting expiries into the event queue.
pub struct ThreadTimers {
    tx: Sender<TimerCommand>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadTimers {
    pub fn spawn(events: EventSender) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded();
        let handle = thread::Builder::new()
            .name("strata-cell-timers".into())
            .spawn(move || timer_worker(rx, events))
            .map_err(|e| anyhow::anyhow!("Failed to spawn timer thread: {}", e))?;
        Ok(Self {
            tx,
            handle: Some(handle),
        })
    }
}

impl TimerBackend for ThreadTimers {
    fn arm(&mut self, kind: TimerKind, generation: u64, after: Duration, periodic: bool) {
        let _ = self.tx.send(TimerCommand::Arm {
            kind,
            generation,
            after,
            periodic,
        });
    }

    fn cancel(&mut self, kind: TimerKind) {
        let _ = self.tx.send(TimerCommand::Cancel(kind));
    }
}

impl Drop for ThreadTimers {
    fn drop(&mut self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Pending {
    generation: u64,
    deadline: Instant,
    period: Option<Duration>,
}

fn timer_worker(rx: Receiver<TimerCommand>, events: EventSender) {
    let mut pending: HashMap<TimerKind, Pending> = HashMap::new();

    loop {
        let now = Instant::now();
        pending.retain(|&kind, p| {
            if p.deadline > now {
                return true;
            }
            events.post(Event::Timer(TimerFired {
                kind,
                generation: p.generation,
            }));
            match p.period {
                Some(period) => {
                    p.deadline = now + period;
                    true
                }
                None => false,
            }
        });

        let next = pending.values().map(|p| p.deadline).min();
        let command = match next {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };

        match command {
            TimerCommand::Arm {
                kind,
                generation,
                after,
                periodic,
            } => {
                pending.insert(
                    kind,
                    Pending {
                        generation,
                        deadline: Instant::now() + after,
                        period: periodic.then_some(after),
                    },
                );
            }
            TimerCommand::Cancel(kind) => {
                pending.remove(&kind);
            }
            TimerCommand::Shutdown => break,
        }
    }
}

// ─── Manual backend ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedTimer {
    pub generation: u64,
    pub after: Duration,
    pub periodic: bool,
}

/// Backend that only records arms. Clones share state, so a test keeps one
/// clone and hands the other to the automaton.
#[derive(Debug, Clone, Default)]
pub struct ManualTimers {
    armed: Arc<Mutex<HashMap<TimerKind, ArmedTimer>>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed(&self, kind: TimerKind) -> Option<ArmedTimer> {
        self.lock().get(&kind).copied()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.lock().contains_key(&kind)
    }

    /// Expires `kind` now. One-shot timers are disarmed. Returns the notice to
    /// post, or `None` if the timer was not armed.
    pub fn fire(&self, kind: TimerKind) -> Option<TimerFired> {
        let mut armed = self.lock();
        let timer = armed.get(&kind).copied()?;
        if !timer.periodic {
            armed.remove(&kind);
        }
        Some(TimerFired {
            kind,
            generation: timer.generation,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TimerKind, ArmedTimer>> {
        self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TimerBackend for ManualTimers {
    fn arm(&mut self, kind: TimerKind, generation: u64, after: Duration, periodic: bool) {
        self.lock().insert(
            kind,
            ArmedTimer {
                generation,
                after,
                periodic,
            },
        );
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.lock().remove(&kind);
    }
}
