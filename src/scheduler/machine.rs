//! The scheduler state machine.
//!
//! Everything here is synchronous and runs under the scheduler's single
//! mutex. Side effects leave through three narrow channels: timers are armed
//! via the injected [`TimerDriver`], events accumulate for the next
//! [`SchedulerChange`], and a pending [`PersistAction`] tells the handle what
//! to write once the operation is over.

use super::SchedulerSettings;
use super::conflict::ConflictTable;
use super::events::{
    EventLog, EventLogEntry, RejectReason, SchedulerChange, SchedulerEvent, SchedulerSnapshot,
};
use super::rate_limit::{RateLimitExceeded, RateLimiter};
use super::state::{InstructionState, InstructionStatus, compare, sort_queue};
use super::timer::{Clock, TimerDriver, TimerHandle};
use crate::error::ArbiterResult;
use crate::instruction::{Instruction, InstructionKind};
use crate::persistence::PersistedState;
use crate::registry::{ProducerRegistry, Verifier};
use crate::types::{InstructionId, ProducerId};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Error message recorded on entries whose timer fired.
pub const TIMEOUT_MESSAGE: &str = "Instruction timed out";

/// Invoked by an expired timer with the entry id and the timer's token.
pub(crate) type ExpireHook = Arc<dyn Fn(InstructionId, u64) + Send + Sync>;

/// What the handle should write to the durable store after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PersistAction {
    Save,
    Remove,
}

/// Outcome of arbitrating a new instruction against one existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arbitration {
    /// Existing entry is replaced outright.
    Supersede,
    /// Incoming wins on priority: a queued entry is superseded, the active
    /// one goes back to pending behind it.
    Displace,
    /// Unresolved: the side named here records the other in `conflicts_with`.
    Blocked { on_incoming: bool },
}

struct ArmedTimer {
    id: InstructionId,
    token: u64,
    handle: TimerHandle,
}

pub(crate) struct SchedulerCore {
    settings: SchedulerSettings,
    verifier: Verifier,
    conflicts: ConflictTable,
    clock: Arc<dyn Clock>,
    timers: Arc<dyn TimerDriver>,
    on_expire: ExpireHook,

    /// Pending, deferred and terminal entries, kept in queue order
    queue: Vec<InstructionState>,
    active: Option<InstructionState>,
    next_id: InstructionId,
    limiter: RateLimiter,
    log: EventLog,

    /// Timer of the active entry, if it has a timeout
    timer: Option<ArmedTimer>,
    next_token: u64,

    revision: u64,
    changes: Vec<SchedulerEvent>,
    persist: Option<PersistAction>,
}

impl SchedulerCore {
    pub(crate) fn new(
        settings: SchedulerSettings,
        registry: Arc<ProducerRegistry>,
        conflicts: ConflictTable,
        clock: Arc<dyn Clock>,
        timers: Arc<dyn TimerDriver>,
        on_expire: ExpireHook,
    ) -> Self {
        let limiter = RateLimiter::new(settings.global_rate_limit_per_minute);
        let log = EventLog::new(settings.event_log_capacity);
        Self {
            settings,
            verifier: Verifier::new(registry),
            conflicts,
            clock,
            timers,
            on_expire,
            queue: Vec::new(),
            active: None,
            next_id: InstructionId::new(1),
            limiter,
            log,
            timer: None,
            next_token: 0,
            revision: 0,
            changes: Vec::new(),
            persist: None,
        }
    }

    pub(crate) fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn registry(&self) -> &ProducerRegistry {
        self.verifier.registry()
    }

    // ----- bookkeeping -----

    fn record(&mut self, at: DateTime<Utc>, event: SchedulerEvent) {
        self.log.push(at, event.clone());
        self.changes.push(event);
        self.persist.get_or_insert(PersistAction::Save);
    }

    /// Drain the events of the last operation into a change notification.
    pub(crate) fn take_change(&mut self) -> Option<SchedulerChange> {
        if self.changes.is_empty() {
            return None;
        }
        self.revision += 1;
        Some(SchedulerChange {
            revision: self.revision,
            events: std::mem::take(&mut self.changes),
            snapshot: self.snapshot(),
        })
    }

    pub(crate) fn take_persist(&mut self) -> Option<PersistAction> {
        self.persist.take()
    }

    pub(crate) fn persisted_state(&self) -> PersistedState {
        PersistedState {
            queue: self.queue.clone(),
            active: self.active.clone(),
            timestamp: self.clock.now(),
        }
    }

    // ----- inspection -----

    pub(crate) fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            active: self.active.clone(),
            queue: self.queue.clone(),
        }
    }

    pub(crate) fn get(&self, id: InstructionId) -> Option<&InstructionState> {
        self.active
            .iter()
            .chain(self.queue.iter())
            .find(|e| e.id == id)
    }

    pub(crate) fn active(&self) -> Option<&InstructionState> {
        self.active.as_ref()
    }

    pub(crate) fn queue(&self) -> &[InstructionState] {
        &self.queue
    }

    /// Every entry held, including the active one and terminal entries
    /// awaiting cleanup.
    pub(crate) fn len(&self) -> usize {
        self.queue.len() + usize::from(self.active.is_some())
    }

    pub(crate) fn event_log(&self) -> Vec<EventLogEntry> {
        self.log.entries()
    }

    fn live_count(&self) -> usize {
        self.queue.iter().filter(|e| e.status.is_live()).count()
            + usize::from(self.active.is_some())
    }

    fn is_live(&self, id: InstructionId) -> bool {
        self.active.as_ref().is_some_and(|a| a.id == id)
            || self.queue.iter().any(|e| e.id == id && e.status.is_live())
    }

    fn is_blocked(&self, entry: &InstructionState) -> bool {
        entry.conflicts_with.iter().any(|id| self.is_live(*id))
    }

    // ----- admission -----

    pub(crate) fn enqueue(
        &mut self,
        instruction: Instruction,
        timeout: Option<Duration>,
    ) -> ArbiterResult<Option<InstructionId>> {
        let producer = self.verifier.verify(&instruction)?.clone();
        let kind = instruction.kind();
        let now = self.clock.now();

        if self.live_count() >= self.settings.max_queue_size {
            warn!(
                "Queue full ({} live entries), rejecting {} from {}",
                self.settings.max_queue_size, kind, producer.id
            );
            self.reject(kind, &producer.id, RejectReason::QueueFull, now);
            return Ok(None);
        }

        let producer_limit = producer
            .rate_limit_per_minute
            .or(self.settings.default_producer_rate_limit_per_minute);
        if let Err(exceeded) = self.limiter.check(&producer.id, producer_limit, now) {
            let reason = match exceeded {
                RateLimitExceeded::Global => RejectReason::GlobalRateLimit,
                RateLimitExceeded::Producer => RejectReason::ProducerRateLimit,
            };
            warn!("Rate limited {} from {}: {}", kind, producer.id, reason);
            self.reject(kind, &producer.id, reason, now);
            return Ok(None);
        }
        self.limiter.record(&producer.id, now);

        let id = self.next_id;
        self.next_id = id.next();

        let timeout_ms = timeout
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .or(self.settings.default_timeout_ms);
        let mut entry = InstructionState::new(id, instruction, now, timeout_ms);

        info!("Enqueued instruction {} ({}) from {}", id, kind, producer.id);
        self.record(
            now,
            SchedulerEvent::Enqueued {
                id,
                kind,
                producer_id: Some(producer.id.clone()),
            },
        );

        self.resolve_conflicts(&mut entry, producer.priority, now);

        self.queue.push(entry);
        sort_queue(&mut self.queue);
        self.try_activate_next();

        Ok(Some(id))
    }

    fn reject(
        &mut self,
        kind: InstructionKind,
        producer: &ProducerId,
        reason: RejectReason,
        now: DateTime<Utc>,
    ) {
        // Diagnostics only; a rejection is not a state change.
        self.log.push(
            now,
            SchedulerEvent::Rejected {
                kind,
                producer_id: Some(producer.clone()),
                reason,
            },
        );
    }

    fn arbitrate(
        &self,
        incoming: &InstructionState,
        incoming_producer_priority: i32,
        existing: &InstructionState,
    ) -> Option<Arbitration> {
        let (new_kind, old_kind) = (incoming.kind(), existing.kind());

        if self.conflicts.supersedes(new_kind, old_kind) {
            return Some(Arbitration::Supersede);
        }
        if !self.conflicts.conflicts(new_kind, old_kind) {
            return None;
        }
        if existing.is_from(incoming.producer_id.as_ref()) {
            return Some(Arbitration::Supersede);
        }

        let existing_producer_priority = existing
            .producer_id
            .as_ref()
            .map_or(0, |p| self.registry().priority_of(p.as_str()));

        let outcome = match incoming_producer_priority
            .cmp(&existing_producer_priority)
            .then_with(|| incoming.priority().cmp(&existing.priority()))
        {
            Ordering::Greater => Arbitration::Displace,
            Ordering::Less => Arbitration::Blocked { on_incoming: true },
            Ordering::Equal => Arbitration::Blocked {
                on_incoming: existing.status == InstructionStatus::Active
                    || compare(incoming, existing) != Ordering::Less,
            },
        };
        Some(outcome)
    }

    fn resolve_conflicts(
        &mut self,
        incoming: &mut InstructionState,
        producer_priority: i32,
        now: DateTime<Utc>,
    ) {
        let mut displaced = None;
        if let Some(active) = self.active.as_ref() {
            let active_id = active.id;
            match self.arbitrate(incoming, producer_priority, active) {
                None => {}
                Some(Arbitration::Supersede) => {
                    if let Some(mut entry) = self.release_active() {
                        entry.finish(InstructionStatus::Superseded, now);
                        entry.superseded_by = Some(incoming.id);
                        info!("Active instruction {} superseded by {}", active_id, incoming.id);
                        self.record(
                            now,
                            SchedulerEvent::Superseded {
                                id: active_id,
                                by: incoming.id,
                            },
                        );
                        self.queue.push(entry);
                    }
                }
                Some(Arbitration::Displace) => {
                    // Back to pending behind the winner; it returns on its own
                    // once the winner is terminal.
                    if let Some(mut entry) = self.release_active() {
                        entry.status = InstructionStatus::Pending;
                        entry.started_at = None;
                        entry.conflicts_with.insert(incoming.id);
                        let reason = format!("Deferred for higher-priority instruction {}", incoming.id);
                        info!("Active instruction {} requeued behind {}", active_id, incoming.id);
                        self.record(
                            now,
                            SchedulerEvent::Deferred {
                                id: active_id,
                                reason: Some(reason.clone()),
                            },
                        );
                        entry.reason = Some(reason);
                        displaced = Some(active_id);
                        self.queue.push(entry);
                    }
                }
                Some(Arbitration::Blocked { .. }) => {
                    self.block(incoming, active_id, now);
                }
            }
        }

        for index in 0..self.queue.len() {
            // The entry requeued above already lost; it only waits now.
            if !self.queue[index].status.is_live() || Some(self.queue[index].id) == displaced {
                continue;
            }
            let existing_id = self.queue[index].id;
            match self.arbitrate(incoming, producer_priority, &self.queue[index]) {
                None => {}
                Some(Arbitration::Supersede) | Some(Arbitration::Displace) => {
                    let entry = &mut self.queue[index];
                    entry.finish(InstructionStatus::Superseded, now);
                    entry.superseded_by = Some(incoming.id);
                    info!("Queued instruction {} superseded by {}", existing_id, incoming.id);
                    self.record(
                        now,
                        SchedulerEvent::Superseded {
                            id: existing_id,
                            by: incoming.id,
                        },
                    );
                }
                Some(Arbitration::Blocked { on_incoming: true }) => {
                    self.block(incoming, existing_id, now);
                }
                Some(Arbitration::Blocked { on_incoming: false }) => {
                    self.queue[index].conflicts_with.insert(incoming.id);
                    debug!("Instruction {} now waits for {}", existing_id, incoming.id);
                    self.record(
                        now,
                        SchedulerEvent::ConflictRecorded {
                            id: existing_id,
                            blocked_by: incoming.id,
                        },
                    );
                }
            }
        }
    }

    fn block(&mut self, incoming: &mut InstructionState, blocked_by: InstructionId, now: DateTime<Utc>) {
        if incoming.conflicts_with.insert(blocked_by) {
            debug!("Instruction {} waits for conflicting {}", incoming.id, blocked_by);
            self.record(
                now,
                SchedulerEvent::ConflictRecorded {
                    id: incoming.id,
                    blocked_by,
                },
            );
        }
    }

    // ----- active slot -----

    /// Promote the first unblocked pending entry if the slot is free.
    ///
    /// Tie-broken conflicts follow [`compare`], which is not transitive when
    /// pinned and unpinned sequences mix, so pending entries can end up
    /// waiting on each other in a loop. When nothing else can run, the first
    /// entry in queue order on such a loop is promoted.
    pub(crate) fn try_activate_next(&mut self) -> Option<InstructionId> {
        if self.active.is_some() {
            return None;
        }

        let index = self
            .queue
            .iter()
            .position(|e| e.status == InstructionStatus::Pending && !self.is_blocked(e))
            .or_else(|| self.first_in_wait_cycle())?;

        let now = self.clock.now();
        let mut entry = self.queue.remove(index);
        entry.status = InstructionStatus::Active;
        entry.started_at = Some(now);

        let id = entry.id;
        let timeout_ms = entry.timeout_ms;
        info!("Activated instruction {} ({})", id, entry.kind());
        self.active = Some(entry);

        if let Some(ms) = timeout_ms {
            self.arm_timer(id, Duration::from_millis(ms));
        }
        self.record(now, SchedulerEvent::Activated { id });
        Some(id)
    }

    fn first_in_wait_cycle(&self) -> Option<usize> {
        let index = self
            .queue
            .iter()
            .position(|e| e.status == InstructionStatus::Pending && self.waits_on(e, e.id))?;
        warn!(
            "Instructions wait on each other; promoting {} to break the cycle",
            self.queue[index].id
        );
        Some(index)
    }

    /// Whether `from` waits, directly or through other live entries, on `target`.
    fn waits_on(&self, from: &InstructionState, target: InstructionId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<InstructionId> = from.conflicts_with.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(next) = self.queue.iter().find(|e| e.id == id && e.status.is_live()) {
                stack.extend(next.conflicts_with.iter().copied());
            }
        }
        false
    }

    fn arm_timer(&mut self, id: InstructionId, delay: Duration) {
        self.disarm_timer();
        self.next_token += 1;
        let token = self.next_token;
        let hook = self.on_expire.clone();
        let handle = self.timers.schedule(delay, Box::new(move || hook(id, token)));
        debug!("Armed {:?} timeout for instruction {}", delay, id);
        self.timer = Some(ArmedTimer { id, token, handle });
    }

    fn disarm_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.cancel();
        }
    }

    /// Take the active entry out of the slot and cancel its timer.
    fn release_active(&mut self) -> Option<InstructionState> {
        let entry = self.active.take()?;
        self.disarm_timer();
        Some(entry)
    }

    /// Put a finished or withdrawn entry back into the queue and refill the
    /// slot.
    fn settle(&mut self, entry: InstructionState) {
        self.queue.push(entry);
        sort_queue(&mut self.queue);
        self.try_activate_next();
    }

    pub(crate) fn complete_active(&mut self, response: Option<serde_json::Value>) -> Option<InstructionId> {
        let mut entry = self.release_active()?;
        let now = self.clock.now();
        let id = entry.id;
        entry.finish(InstructionStatus::Completed, now);
        entry.response = response;
        info!("Instruction {} completed", id);
        self.record(now, SchedulerEvent::Completed { id });
        self.settle(entry);
        Some(id)
    }

    pub(crate) fn cancel_active(&mut self, reason: Option<String>) -> Option<InstructionId> {
        let mut entry = self.release_active()?;
        let now = self.clock.now();
        let id = entry.id;
        entry.finish(InstructionStatus::Cancelled, now);
        entry.reason = reason.clone();
        info!("Instruction {} cancelled", id);
        self.record(now, SchedulerEvent::Cancelled { id, reason });
        self.settle(entry);
        Some(id)
    }

    pub(crate) fn error_active(&mut self, message: String) -> Option<InstructionId> {
        let mut entry = self.release_active()?;
        let now = self.clock.now();
        let id = entry.id;
        entry.finish(InstructionStatus::Error, now);
        entry.reason = Some(message.clone());
        warn!("Instruction {} failed: {}", id, message);
        self.record(now, SchedulerEvent::Failed { id, message });
        self.settle(entry);
        Some(id)
    }

    pub(crate) fn defer_active(&mut self, reason: Option<String>) -> Option<InstructionId> {
        let mut entry = self.release_active()?;
        let now = self.clock.now();
        let id = entry.id;
        entry.status = InstructionStatus::Deferred;
        entry.reason = reason.clone();
        info!("Instruction {} deferred", id);
        self.record(now, SchedulerEvent::Deferred { id, reason });
        // Deferred entries rank with pending ones; `compare` places it.
        self.settle(entry);
        Some(id)
    }

    /// Timer callback. Stale tokens (a timer cancelled after it already
    /// fired) are ignored.
    pub(crate) fn expire(&mut self, id: InstructionId, token: u64) -> bool {
        match &self.timer {
            Some(timer) if timer.id == id && timer.token == token => {}
            _ => return false,
        }
        // The timer has fired; nothing left to cancel.
        self.timer = None;

        let Some(mut entry) = self.active.take_if(|a| a.id == id) else {
            return false;
        };
        let now = self.clock.now();
        entry.finish(InstructionStatus::Timeout, now);
        entry.reason = Some(TIMEOUT_MESSAGE.to_string());
        warn!(
            "Instruction {} timed out after {}ms",
            id,
            entry.timeout_ms.unwrap_or_default()
        );
        self.record(now, SchedulerEvent::TimedOut { id });
        self.settle(entry);
        true
    }

    // ----- queue maintenance -----

    pub(crate) fn retry(&mut self, id: InstructionId) -> bool {
        let Some(entry) = self.queue.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if !entry.status.is_retryable() {
            debug!("Instruction {} is {}, not retryable", id, entry.status);
            return false;
        }
        entry.reset();
        entry.retry_count += 1;
        let retry_count = entry.retry_count;

        let now = self.clock.now();
        info!("Retrying instruction {} (attempt {})", id, retry_count + 1);
        self.record(now, SchedulerEvent::Retried { id, retry_count });
        sort_queue(&mut self.queue);
        self.try_activate_next();
        true
    }

    pub(crate) fn resume(&mut self, id: InstructionId) -> bool {
        let Some(entry) = self.queue.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if entry.status != InstructionStatus::Deferred {
            debug!("Instruction {} is {}, not resumable", id, entry.status);
            return false;
        }
        entry.reset();

        let now = self.clock.now();
        info!("Resumed instruction {}", id);
        self.record(now, SchedulerEvent::Resumed { id });
        sort_queue(&mut self.queue);
        self.try_activate_next();
        true
    }

    pub(crate) fn cleanup(&mut self) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| e.status.is_live());
        let removed = before - self.queue.len();
        if removed > 0 {
            debug!("Cleaned up {} finished instructions", removed);
            let now = self.clock.now();
            self.record(now, SchedulerEvent::CleanedUp { removed });
        }
        removed
    }

    pub(crate) fn clear(&mut self) {
        self.disarm_timer();
        self.queue.clear();
        self.active = None;
        info!("Scheduler cleared");
        let now = self.clock.now();
        self.record(now, SchedulerEvent::Cleared);
        self.persist = Some(PersistAction::Remove);
    }

    /// Cancel the armed timer without touching any entry.
    pub(crate) fn shutdown(&mut self) {
        self.disarm_timer();
    }

    // ----- restore -----

    /// Replace in-memory state with persisted state.
    ///
    /// An active entry keeps only the time it had left when it was saved:
    /// its timer is re-armed for `timeout - (now - started_at)`, and if
    /// nothing remains it times out immediately.
    pub(crate) fn restore(&mut self, state: PersistedState) {
        let now = self.clock.now();
        self.disarm_timer();

        let mut queue = state.queue;
        for entry in queue.iter_mut().filter(|e| e.status == InstructionStatus::Active) {
            entry.status = InstructionStatus::Pending;
            entry.started_at = None;
        }

        if let Some(max_id) = queue.iter().chain(state.active.iter()).map(|e| e.id).max() {
            if max_id >= self.next_id {
                self.next_id = max_id.next();
            }
        }

        info!(
            "Restored {} queued instructions (active: {})",
            queue.len(),
            state
                .active
                .as_ref()
                .map_or_else(|| "none".to_string(), |a| a.id.to_string())
        );
        self.record(
            now,
            SchedulerEvent::Restored {
                queued: queue.len(),
                active: state.active.as_ref().map(|a| a.id),
            },
        );
        self.queue = queue;
        self.active = None;

        if let Some(entry) = state.active {
            self.restore_active(entry, now);
        }
        sort_queue(&mut self.queue);
        self.try_activate_next();
    }

    fn restore_active(&mut self, mut entry: InstructionState, now: DateTime<Utc>) {
        if entry.status != InstructionStatus::Active {
            self.queue.push(entry);
            return;
        }

        let id = entry.id;
        let Some(timeout_ms) = entry.timeout_ms else {
            self.active = Some(entry);
            return;
        };

        let started_at = *entry.started_at.get_or_insert(now);
        let elapsed_ms = u64::try_from((now - started_at).num_milliseconds()).unwrap_or(0);

        if elapsed_ms >= timeout_ms {
            entry.finish(InstructionStatus::Timeout, now);
            entry.reason = Some(TIMEOUT_MESSAGE.to_string());
            warn!("Restored instruction {} had already timed out", id);
            self.record(now, SchedulerEvent::TimedOut { id });
            self.queue.push(entry);
            return;
        }

        let remaining = Duration::from_millis(timeout_ms - elapsed_ms);
        info!("Re-arming instruction {} with {:?} remaining", id, remaining);
        self.active = Some(entry);
        self.arm_timer(id, remaining);
    }
}
