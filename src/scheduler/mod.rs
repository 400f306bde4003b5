//! Instruction scheduler.
//!
//! One shared interactive surface, many producers. The scheduler admits
//! verified instructions into a queue and keeps at most one of them in the
//! active slot at a time. Around that slot it:
//!
//! - **Arbitrates conflicts**: per-kind rules decide whether a new
//!   instruction supersedes, displaces or waits behind existing ones
//! - **Orders the queue**: priority, then explicit sequence, then submission
//! - **Limits admission**: queue capacity, a global sliding-window rate and
//!   a per-producer rate
//! - **Bounds lifetime**: the active entry may carry a timeout
//! - **Persists**: every change is written to a [`StateStore`] in the
//!   background and can be restored, keeping only the time each active entry
//!   had left
//!
//! ## Concurrency
//!
//! [`Scheduler`] is a cheap cloneable handle. Every operation runs to
//! completion under one mutex; subscribers are notified after it is
//! released, and may call back into the scheduler.
//!
//! ## Example
//!
//! ```no_run
//! use instruction_arbiter::instruction::{Instruction, InstructionKind};
//! use instruction_arbiter::registry::{ProducerInfo, ProducerRegistry};
//! use instruction_arbiter::scheduler::Scheduler;
//!
//! # async fn run() -> instruction_arbiter::error::ArbiterResult<()> {
//! let registry = ProducerRegistry::new().register(
//!     ProducerInfo::new("form_collector", "Form Collection Agent", 2)
//!         .permit([InstructionKind::RequestEmail]),
//! );
//! let scheduler = Scheduler::builder(registry).init().await?;
//!
//! let email = Instruction::email_request("Please enter your email address:", None)
//!     .with_producer("form_collector");
//! if let Some(id) = scheduler.enqueue(email, None)? {
//!     println!("queued as {}", id);
//! }
//! # Ok(())
//! # }
//! ```

mod conflict;
mod events;
mod machine;
mod rate_limit;
mod state;
mod timer;


pub use machine::TIMEOUT_MESSAGE;
pub use conflict::{ConflictRule, ConflictTable};
pub use events::{
    EventLogEntry, RejectReason, SchedulerChange, SchedulerEvent, SchedulerSnapshot,
    SchedulerSubscriber, SubscriptionId,
};
pub use state::{InstructionState, InstructionStatus, compare, sort_queue};
pub use timer::{
    Clock, ManualClock, SystemClock, TimerCallback, TimerDriver, TimerHandle, TokioTimers,
};

use machine::{ExpireHook, PersistAction, SchedulerCore};
use crate::error::ArbiterResult;
use crate::instruction::Instruction;
use crate::persistence::{PersistedState, Persister, StateStore};
use crate::registry::ProducerRegistry;
use crate::types::{InstructionId, StorageKey};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tunables for a scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    /// Maximum number of live (pending, deferred or active) entries
    pub max_queue_size: usize,
    /// Accepted instructions per sliding minute across all producers
    pub global_rate_limit_per_minute: Option<u32>,
    /// Per-producer limit for producers that do not declare their own
    pub default_producer_rate_limit_per_minute: Option<u32>,
    /// Timeout applied when `enqueue` is given none
    pub default_timeout_ms: Option<u64>,
    pub storage_key: StorageKey,
    /// Persisted state older than this is discarded on restore
    pub staleness_secs: u64,
    pub event_log_capacity: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 50,
            global_rate_limit_per_minute: Some(30),
            default_producer_rate_limit_per_minute: None,
            default_timeout_ms: None,
            storage_key: StorageKey::new("instruction_arbiter_state"),
            staleness_secs: 3600,
            event_log_capacity: 100,
        }
    }
}

impl SchedulerSettings {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

type SubscriberList = Vec<(SubscriptionId, Arc<dyn SchedulerSubscriber>)>;

struct Shared {
    core: Mutex<SchedulerCore>,
    subscribers: Mutex<SubscriberList>,
    next_subscription: AtomicU64,
    persister: Option<Persister>,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, SchedulerCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribers(&self) -> MutexGuard<'_, SubscriberList> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a scheduler instance.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

/// Configures and initializes a [`Scheduler`].
pub struct SchedulerBuilder {
    registry: Arc<ProducerRegistry>,
    conflicts: ConflictTable,
    settings: SchedulerSettings,
    clock: Option<Arc<dyn Clock>>,
    timers: Option<Arc<dyn TimerDriver>>,
    store: Option<Arc<dyn StateStore>>,
    restore: bool,
}

impl SchedulerBuilder {
    fn new(registry: Arc<ProducerRegistry>) -> Self {
        Self {
            registry,
            conflicts: ConflictTable::default(),
            settings: SchedulerSettings::default(),
            clock: None,
            timers: None,
            store: None,
            restore: true,
        }
    }

    pub fn conflicts(mut self, conflicts: ConflictTable) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timers(mut self, timers: Arc<dyn TimerDriver>) -> Self {
        self.timers = Some(timers);
        self
    }

    /// Drive both time and timers from a virtual clock.
    pub fn manual_clock(self, clock: &ManualClock) -> Self {
        self.clock(Arc::new(clock.clone()))
            .timers(Arc::new(clock.clone()))
    }

    /// Persist state to `store`. Without a store the scheduler is volatile.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Do not load persisted state during `init`.
    pub fn skip_restore(mut self) -> Self {
        self.restore = false;
        self
    }

    /// Build the scheduler and, when a store is configured, restore its
    /// persisted state. Must run inside a tokio runtime.
    pub async fn init(self) -> ArbiterResult<Scheduler> {
        let Self {
            registry,
            conflicts,
            settings,
            clock,
            timers,
            store,
            restore,
        } = self;

        let clock: Arc<dyn Clock> = match clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };
        let timers: Arc<dyn TimerDriver> = match timers {
            Some(timers) => timers,
            None => Arc::new(TokioTimers::current()?),
        };
        let persister = store.map(|store| Persister::spawn(store, settings.storage_key.clone()));
        let producers = registry.len();

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let on_expire: ExpireHook = Arc::new(move |id, token| {
                if let Some(shared) = weak.upgrade() {
                    Scheduler { shared }.expire(id, token);
                }
            });

            Shared {
                core: Mutex::new(SchedulerCore::new(
                    settings, registry, conflicts, clock, timers, on_expire,
                )),
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                persister,
            }
        });

        let scheduler = Scheduler { shared };
        info!("Scheduler initialized with {} producers", producers);

        if restore {
            scheduler.restore().await;
        }

        Ok(scheduler)
    }
}

impl Scheduler {
    pub fn builder(registry: impl Into<Arc<ProducerRegistry>>) -> SchedulerBuilder {
        SchedulerBuilder::new(registry.into())
    }

    /// Run one operation as a single critical section, then persist and
    /// notify.
    fn mutate<R>(&self, op: impl FnOnce(&mut SchedulerCore) -> R) -> R {
        let (result, change) = {
            let mut core = self.shared.core();
            let result = op(&mut core);

            // Queued under the lock so writes keep operation order.
            if let Some(action) = core.take_persist() {
                if let Some(persister) = &self.shared.persister {
                    match action {
                        PersistAction::Save => persister.save(&core.persisted_state()),
                        PersistAction::Remove => persister.remove(),
                    }
                }
            }

            (result, core.take_change())
        };

        if let Some(change) = change {
            self.notify(&change);
        }
        result
    }

    fn notify(&self, change: &SchedulerChange) {
        let subscribers: Vec<Arc<dyn SchedulerSubscriber>> = self
            .shared
            .subscribers()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in subscribers {
            subscriber.on_change(change);
        }
    }

    // ----- operations -----

    /// Verify and admit an instruction.
    ///
    /// Returns `Err` for invalid or unauthorized instructions, `Ok(None)`
    /// when the queue is full or a rate limit is hit, and the new id
    /// otherwise. `timeout` falls back to the configured default.
    pub fn enqueue(
        &self,
        instruction: Instruction,
        timeout: Option<Duration>,
    ) -> ArbiterResult<Option<InstructionId>> {
        self.mutate(|core| core.enqueue(instruction, timeout))
    }

    /// Promote the next eligible entry if the slot is free.
    pub fn try_activate_next(&self) -> Option<InstructionId> {
        self.mutate(|core| core.try_activate_next())
    }

    /// Complete the active entry. Returns its id, or `None` when the slot
    /// was empty.
    pub fn complete_active(&self, response: Option<serde_json::Value>) -> Option<InstructionId> {
        self.mutate(|core| core.complete_active(response))
    }

    pub fn cancel_active(&self, reason: Option<String>) -> Option<InstructionId> {
        self.mutate(|core| core.cancel_active(reason))
    }

    pub fn error_active(&self, message: impl Into<String>) -> Option<InstructionId> {
        let message = message.into();
        self.mutate(|core| core.error_active(message))
    }

    /// Withdraw the active entry into the queue as `deferred`. It is placed
    /// by queue order like any live entry and is not promoted until resumed.
    pub fn defer_active(&self, reason: Option<String>) -> Option<InstructionId> {
        self.mutate(|core| core.defer_active(reason))
    }

    /// Re-queue an errored, timed-out or cancelled entry.
    pub fn retry_instruction(&self, id: InstructionId) -> bool {
        self.mutate(|core| core.retry(id))
    }

    /// Re-queue a deferred entry.
    pub fn resume_instruction(&self, id: InstructionId) -> bool {
        self.mutate(|core| core.resume(id))
    }

    /// Drop terminal entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.mutate(|core| core.cleanup())
    }

    /// Drop everything, cancel the timer and erase persisted state.
    pub fn clear(&self) {
        self.mutate(|core| core.clear())
    }

    fn expire(&self, id: InstructionId, token: u64) {
        self.mutate(|core| core.expire(id, token));
    }

    // ----- inspection -----

    pub fn get(&self, id: InstructionId) -> Option<InstructionState> {
        self.shared.core().get(id).cloned()
    }

    pub fn active(&self) -> Option<InstructionState> {
        self.shared.core().active().cloned()
    }

    /// Queued entries in queue order, excluding the active one.
    pub fn queue(&self) -> Vec<InstructionState> {
        self.shared.core().queue().to_vec()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.shared.core().snapshot()
    }

    /// Number of entries held, active and terminal ones included.
    pub fn len(&self) -> usize {
        self.shared.core().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn event_log(&self) -> Vec<EventLogEntry> {
        self.shared.core().event_log()
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.shared.core().settings().clone()
    }

    // ----- subscriptions -----

    pub fn subscribe(&self, subscriber: impl SchedulerSubscriber + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared.subscribers().push((id, Arc::new(subscriber)));
        debug!("Added scheduler subscriber {:?}", id);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.shared.subscribers();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    // ----- lifecycle -----

    /// Reload persisted state, replacing what is in memory.
    ///
    /// Returns `true` if state was restored. Missing, stale or unreadable
    /// state is discarded; failures are logged, never returned.
    pub async fn restore(&self) -> bool {
        let Some(persister) = &self.shared.persister else {
            return false;
        };
        persister.flush().await;

        let raw = match persister.store().get(persister.key()).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted scheduler state under {}", persister.key());
                return false;
            }
            Err(e) => {
                warn!("Failed to load persisted scheduler state: {}", e);
                return false;
            }
        };

        let (now, staleness) = {
            let core = self.shared.core();
            (core.now(), core.settings().staleness())
        };

        match PersistedState::decode_fresh(&raw, now, staleness) {
            Ok(Some(state)) => {
                self.mutate(|core| core.restore(state));
                true
            }
            Ok(None) => {
                persister.remove();
                false
            }
            Err(e) => {
                warn!("Discarding unreadable scheduler state: {}", e);
                persister.remove();
                false
            }
        }
    }

    /// Wait until every state write queued so far has reached the store.
    pub async fn flush(&self) {
        if let Some(persister) = &self.shared.persister {
            persister.flush().await;
        }
    }

    /// Cancel the timer, flush state, stop the writer and drop subscribers.
    pub async fn dispose(&self) {
        self.shared.core().shutdown();
        self.flush().await;
        if let Some(persister) = &self.shared.persister {
            persister.close().await;
        }
        self.shared.subscribers().clear();
        info!("Scheduler disposed");
    }
}
