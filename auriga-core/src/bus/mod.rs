//! Central event bus and module lifecycle controller.
//!
//! Mediator pattern: modules never call each other, every hop goes through
//! [`SystemController`]. The controller owns
//!
//! - the module registry and its ordered lifecycle (initialize/start in
//!   registration order, stop in reverse, idempotent stop),
//! - synchronous publish/subscribe fan-out,
//! - the voice state machine and the glue that turns its side-effect flags
//!   into `STATE_CHANGED` / `WAKEWORD_RESET` events,
//! - a bounded audit ring of recent events,
//! - a `tokio::sync::broadcast` tap for out-of-process observers (GUI,
//!   IPC) that must not run on the bus path.
//!
//! ## Concurrency contract
//!
//! Publishing is safe from any thread. No registry lock is held while user
//! code runs: publish snapshots the subscriber/module lists under a short
//! critical section, then invokes them. Delivery to a single consumer is
//! serialized through a per-consumer reentrant guard — reentrant so a
//! consumer may publish from inside its own callback without deadlocking.
//! Panics in consumers are caught, counted and isolated.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::{AurigaError, Result};
use crate::event::{Event, EventPayload, EventType};
use crate::module::Module;
use crate::state::{StateConfig, StateEvent, TransitionOutcome, VoiceState, VoiceStateMachine};

/// Bounded audit ring capacity. Overflow drops the oldest event.
const AUDIT_CAPACITY: usize = 1000;

/// Broadcast tap capacity for slow external observers.
const TAP_CAPACITY: usize = 256;

struct RegisteredModule {
    module: Arc<dyn Module>,
    /// Serializes delivery to this module across publisher threads.
    /// Reentrant: a module may publish from inside `handle_event`.
    serial: ReentrantMutex<()>,
}

struct Subscription {
    name: String,
    serial: ReentrantMutex<()>,
    callback: Box<dyn Fn(&Event) + Send + Sync>,
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default)]
pub struct BusStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub handler_errors: u64,
    pub modules: usize,
    pub running: bool,
}

pub struct SystemController {
    modules: Mutex<Vec<Arc<RegisteredModule>>>,
    subscriptions: Mutex<HashMap<EventType, Vec<Arc<Subscription>>>>,
    audit: Mutex<VecDeque<Arc<Event>>>,
    state_machine: Mutex<Option<Arc<VoiceStateMachine>>>,
    running: AtomicBool,
    event_seq: AtomicU64,
    events_published: AtomicU64,
    events_dropped: AtomicU64,
    handler_errors: AtomicU64,
    tap: broadcast::Sender<Arc<Event>>,
}

impl SystemController {
    pub fn new() -> Arc<Self> {
        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        Arc::new(Self {
            modules: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            audit: Mutex::new(VecDeque::with_capacity(AUDIT_CAPACITY)),
            state_machine: Mutex::new(None),
            running: AtomicBool::new(false),
            event_seq: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            tap,
        })
    }

    // ── Module registry ─────────────────────────────────────────────────

    /// Add a worker. Registration order is lifecycle order.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<()> {
        let mut modules = self.modules.lock();
        let name = module.name().to_string();
        if modules.iter().any(|m| m.module.name() == name) {
            return Err(AurigaError::ModuleAlreadyRegistered { name });
        }
        debug!(module = %name, "module registered");
        modules.push(Arc::new(RegisteredModule {
            module,
            serial: ReentrantMutex::new(()),
        }));
        Ok(())
    }

    pub fn module_names(&self) -> Vec<String> {
        self.modules
            .lock()
            .iter()
            .map(|m| m.module.name().to_string())
            .collect()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Build the state machine, then initialize every module in insertion
    /// order. The first failure aborts startup.
    pub fn initialize_all(&self, state_config: StateConfig) -> Result<()> {
        *self.state_machine.lock() = Some(Arc::new(VoiceStateMachine::new(state_config)));
        info!("voice state machine ready");

        let modules = self.snapshot_modules();
        for entry in modules {
            let name = entry.module.name().to_string();
            entry
                .module
                .initialize()
                .map_err(|e| AurigaError::ModuleInit {
                    name: name.clone(),
                    reason: e.to_string(),
                })?;
            debug!(module = %name, "module initialized");
        }
        info!("all modules initialized");
        Ok(())
    }

    /// Start every module in insertion order, then announce
    /// `SYSTEM_START`. A failure stops the modules already started —
    /// nothing runs partially.
    pub fn start_all(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AurigaError::AlreadyRunning);
        }

        let modules = self.snapshot_modules();
        let mut started: Vec<Arc<RegisteredModule>> = Vec::with_capacity(modules.len());
        for entry in modules {
            let name = entry.module.name().to_string();
            if let Err(e) = entry.module.start() {
                error!(module = %name, error = %e, "module start failed, rolling back");
                for prior in started.iter().rev() {
                    prior.module.stop();
                }
                self.running.store(false, Ordering::SeqCst);
                return Err(AurigaError::ModuleStart {
                    name,
                    reason: e.to_string(),
                });
            }
            debug!(module = %name, "module started");
            started.push(entry);
        }

        self.publish(Event::new(
            EventType::SystemStart,
            "system",
            EventPayload::None,
        ));
        info!("system started");
        Ok(())
    }

    /// Announce `SYSTEM_STOP`, then stop modules in reverse order.
    /// Idempotent: calling it while stopped does nothing.
    pub fn stop_all(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.publish(Event::new(
            EventType::SystemStop,
            "system",
            EventPayload::None,
        ));

        for entry in self.snapshot_modules().into_iter().rev() {
            let name = entry.module.name().to_string();
            let result = catch_unwind(AssertUnwindSafe(|| entry.module.stop()));
            if result.is_err() {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(module = %name, "module panicked during stop");
            }
        }
        info!("system stopped");
    }

    /// Release module resources after stop and clear the registry.
    pub fn cleanup_all(&self) {
        self.stop_all();
        for entry in self.snapshot_modules().into_iter().rev() {
            entry.module.cleanup();
        }
        self.modules.lock().clear();
        self.subscriptions.lock().clear();
        self.audit.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Publish / subscribe ─────────────────────────────────────────────

    /// Synchronously deliver `event` to every matching subscriber and
    /// every module. Consumer failures are isolated; ordering per
    /// publisher thread is preserved.
    pub fn publish(&self, mut event: Event) {
        event.id = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);

        {
            let mut audit = self.audit.lock();
            if audit.len() == AUDIT_CAPACITY {
                audit.pop_front();
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
            audit.push_back(Arc::clone(&event));
        }
        self.events_published.fetch_add(1, Ordering::Relaxed);

        if event.event_type != EventType::AudioFrameReady {
            debug!(
                event = %event.event_type,
                source = %event.source,
                msg_id = event.msg_id.as_deref().unwrap_or(""),
                "event published"
            );
        }

        let _ = self.tap.send(Arc::clone(&event));

        // Snapshot under a short lock; never hold it through user code.
        let subscribers: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        for subscription in subscribers {
            let _serial = subscription.serial.lock();
            let result = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(&event)));
            if result.is_err() {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscriber = %subscription.name,
                    event = %event.event_type,
                    "subscriber panicked, isolated"
                );
            }
        }

        for entry in self.snapshot_modules() {
            let _serial = entry.serial.lock();
            let result = catch_unwind(AssertUnwindSafe(|| entry.module.handle_event(&event)));
            if result.is_err() {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    module = %entry.module.name(),
                    event = %event.event_type,
                    "module panicked in handle_event, isolated"
                );
            }
        }
    }

    /// Register a named callback for one event type. A duplicate
    /// `(type, name)` registration is suppressed.
    pub fn subscribe(
        &self,
        event_type: EventType,
        name: impl Into<String>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut subscriptions = self.subscriptions.lock();
        let entries = subscriptions.entry(event_type).or_default();
        if entries.iter().any(|s| s.name == name) {
            warn!(event = %event_type, subscriber = %name, "duplicate subscription ignored");
            return;
        }
        entries.push(Arc::new(Subscription {
            name,
            serial: ReentrantMutex::new(()),
            callback: Box::new(callback),
        }));
    }

    pub fn unsubscribe(&self, event_type: EventType, name: &str) {
        if let Some(entries) = self.subscriptions.lock().get_mut(&event_type) {
            entries.retain(|s| s.name != name);
        }
    }

    /// Out-of-band tap carrying every published event.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<Event>> {
        self.tap.subscribe()
    }

    /// Most recent audited events, oldest first.
    pub fn recent_events(&self, count: usize) -> Vec<Arc<Event>> {
        let audit = self.audit.lock();
        audit.iter().rev().take(count).rev().cloned().collect()
    }

    // ── State machine glue ──────────────────────────────────────────────

    pub fn state_machine(&self) -> Option<Arc<VoiceStateMachine>> {
        self.state_machine.lock().clone()
    }

    pub fn current_state(&self) -> Option<VoiceState> {
        self.state_machine().map(|m| m.current_state())
    }

    /// Drive the state machine and publish the resulting events:
    /// `STATE_CHANGED` for every applied transition, plus
    /// `WAKEWORD_RESET` when the outcome demands it.
    pub fn handle_state_event(&self, event: StateEvent) -> Option<TransitionOutcome> {
        let machine = self.state_machine()?;
        let outcome = machine.handle_event(event);
        if outcome.applied {
            self.publish_transition(&outcome);
        }
        Some(outcome)
    }

    /// Poll the wake deadline; on expiry announce `WAKEWORD_TIMEOUT` and
    /// the follow-up transition events.
    pub fn check_timeout(&self) -> Option<TransitionOutcome> {
        let machine = self.state_machine()?;
        let outcome = machine.check_timeout()?;
        if outcome.applied {
            self.publish(Event::new(
                EventType::WakewordTimeout,
                "system",
                EventPayload::None,
            ));
            self.publish_transition(&outcome);
        }
        Some(outcome)
    }

    fn publish_transition(&self, outcome: &TransitionOutcome) {
        self.publish(Event::new(
            EventType::StateChanged,
            "state_machine",
            EventPayload::StateChange {
                from: outcome.previous.as_str().into(),
                to: outcome.current.as_str().into(),
                reason: outcome.reason.clone(),
            },
        ));
        if outcome.should_reset_wakeword {
            self.publish(Event::new(
                EventType::WakewordReset,
                "system",
                EventPayload::None,
            ));
        }
    }

    // ── Stats ───────────────────────────────────────────────────────────

    pub fn stats(&self) -> BusStats {
        BusStats {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            modules: self.modules.lock().len(),
            running: self.is_running(),
        }
    }

    fn snapshot_modules(&self) -> Vec<Arc<RegisteredModule>> {
        self.modules.lock().clone()
    }
}
