use crate::config::CellularConfig;
use crate::distrib::{Distribution, StatusBoard};
use crate::error::ModemError;
use crate::event::{Event, EventQueue, EventSender};
use crate::fsm::{Automaton, ConnectivityContext, ExitReason};
use crate::modem::{ModemDriver, ModemSession};
use crate::timer::ThreadTimers;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{info, warn};

/// Control messages sent to the worker (infrequent).
enum ControlMessage {
    Shutdown,
}

/// Thread-safe handle to the connectivity worker.
///
/// Owns a background thread that runs the [`Automaton`] against the event
/// queue. Producers (timers, modem callbacks, this handle) post events into
/// the bounded queue; the **control path** (shutdown) uses a separate
/// crossbeam channel so it is never dropped on overflow.
///
/// Dropping the runtime powers the modem down and joins the worker.
pub struct CellularRuntime {
    events: EventSender,
    control_tx: Sender<ControlMessage>,
    board: Arc<StatusBoard>,
    modem: ModemSession,
    context: Arc<Mutex<ConnectivityContext>>,
    handle: Option<thread::JoinHandle<ExitReason>>,
    exit: Option<ExitReason>,
}

impl CellularRuntime {
    /// Starts the worker and its timer thread, then boots the automaton.
    pub fn spawn(driver: impl ModemDriver + 'static, board: Arc<StatusBoard>) -> anyhow::Result<Self> {
        let modem = ModemSession::new(driver);
        let queue = EventQueue::new();
        let events = queue.sender();
        let timers = ThreadTimers::spawn(queue.sender())?;
        let distribution: Arc<dyn Distribution> = board.clone();
        let automaton = Automaton::new(modem.clone(), distribution, Box::new(timers), queue);

        let context = Arc::new(Mutex::new(automaton.context().clone()));
        let context_clone = context.clone();
        let (control_tx, control_rx) = bounded(4);

        let handle = thread::Builder::new()
            .name("strata-cellular".into())
            .spawn(move || runtime_worker(automaton, control_rx, context_clone))
            .map_err(|e| anyhow::anyhow!("Failed to spawn cellular worker: {}", e))?;

        Ok(Self {
            events,
            control_tx,
            board,
            modem,
            context,
            handle: Some(handle),
            exit: None,
        })
    }

    /// Posts an event. Returns `false` if the queue was full.
    pub fn post(&self, event: Event) -> bool {
        self.events.post(event)
    }

    /// A producer handle for callbacks living outside the runtime.
    pub fn sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn board(&self) -> &Arc<StatusBoard> {
        &self.board
    }

    /// Latest context published by the worker (thread-safe clone).
    pub fn snapshot(&self) -> ConnectivityContext {
        self.context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Updates the target-state record and notifies the automaton.
    pub fn set_target_state(&self, target: crate::config::TargetState) -> bool {
        self.board.set_target_state(target);
        self.post(Event::TargetStateCmd)
    }

    /// Replaces the configuration record and posts the notifications that
    /// match what changed. A slot's `apn_changed` flag is consumed here: it
    /// is cleared in the stored record once the APN notification is posted.
    pub fn update_config(&self, mut config: CellularConfig) {
        let previous = self.board.cellular_config();
        let changes = config_changes(&previous, &config);
        for slot in &mut config.sim_slots {
            slot.apn_changed = false;
        }
        let target = config.target_state;

        self.board.set_config(config);
        for event in changes {
            if event == Event::TargetStateCmd {
                self.board.set_target_state(target);
            }
            self.post(event);
        }
    }

    /// Requests a modem reboot. Also the only way out of `Fail`.
    pub fn reboot_modem(&self) -> bool {
        self.post(Event::RebootModem)
    }

    /// Sends a raw AT command through the shared modem session.
    pub fn raw_command(&self, command: &str) -> Result<String, ModemError> {
        self.modem.raw_command(command)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Blocks until the worker exits and returns why.
    pub fn wait(&mut self) -> ExitReason {
        if let Some(handle) = self.handle.take() {
            let reason = handle.join().unwrap_or_else(|_| {
                warn!("cellular worker panicked");
                ExitReason::Shutdown
            });
            self.exit = Some(reason);
        }
        self.exit.unwrap_or(ExitReason::Shutdown)
    }

    /// Gracefully shuts down the worker thread. Idempotent.
    pub fn shutdown(&mut self) -> ExitReason {
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        self.wait()
    }
}

impl Drop for CellularRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Notifications implied by replacing `previous` with `next`.
fn config_changes(previous: &CellularConfig, next: &CellularConfig) -> Vec<Event> {
    let mut events = Vec::new();
    if previous.target_state != next.target_state {
        events.push(Event::TargetStateCmd);
    }
    // The flag forces a re-apply even when the slot values are unchanged.
    if previous.sim_slots != next.sim_slots || next.sim_slots.iter().any(|s| s.apn_changed) {
        events.push(Event::ApnConfig);
    }
    #[cfg(feature = "low-power")]
    {
        if previous.power != next.power {
            events.push(Event::PowerConfigChanged);
        }
    }
    events
}

fn runtime_worker(
    mut automaton: Automaton,
    control_rx: Receiver<ControlMessage>,
    context: Arc<Mutex<ConnectivityContext>>,
) -> ExitReason {
    let events = automaton.queue().receiver().clone();
    automaton.start();

    let reason = loop {
        select! {
            recv(events) -> msg => match msg {
                Ok(event) => automaton.dispatch(event),
                Err(_) => break ExitReason::Shutdown,
            },
            recv(control_rx) -> msg => match msg {
                Ok(ControlMessage::Shutdown) | Err(_) => {
                    automaton.shutdown();
                    break ExitReason::Shutdown;
                }
            },
        }

        *context.lock().unwrap_or_else(|e| e.into_inner()) = automaton.context().clone();
        if let Some(reason) = automaton.exit_reason() {
            break reason;
        }
    };

    *context.lock().unwrap_or_else(|e| e.into_inner()) = automaton.context().clone();
    info!(?reason, "cellular worker exiting");
    reason
}
