//! Scheduler events, the diagnostic event log and change subscriptions.

use super::state::InstructionState;
use crate::instruction::InstructionKind;
use crate::types::{InstructionId, ProducerId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Why `enqueue` turned an instruction away without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    QueueFull,
    GlobalRateLimit,
    ProducerRateLimit,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "queue full"),
            Self::GlobalRateLimit => write!(f, "global rate limit"),
            Self::ProducerRateLimit => write!(f, "producer rate limit"),
        }
    }
}

/// Something that happened inside the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Enqueued {
        id: InstructionId,
        kind: InstructionKind,
        producer_id: Option<ProducerId>,
    },
    Rejected {
        kind: InstructionKind,
        producer_id: Option<ProducerId>,
        reason: RejectReason,
    },
    /// `id` lost an arbitration and waits for `blocked_by` to finish.
    ConflictRecorded {
        id: InstructionId,
        blocked_by: InstructionId,
    },
    Superseded {
        id: InstructionId,
        by: InstructionId,
    },
    Deferred {
        id: InstructionId,
        reason: Option<String>,
    },
    Activated {
        id: InstructionId,
    },
    Completed {
        id: InstructionId,
    },
    Cancelled {
        id: InstructionId,
        reason: Option<String>,
    },
    Failed {
        id: InstructionId,
        message: String,
    },
    TimedOut {
        id: InstructionId,
    },
    Retried {
        id: InstructionId,
        retry_count: u32,
    },
    Resumed {
        id: InstructionId,
    },
    CleanedUp {
        removed: usize,
    },
    Cleared,
    Restored {
        queued: usize,
        active: Option<InstructionId>,
    },
}

/// One timestamped event in the diagnostic log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventLogEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: SchedulerEvent,
}

/// Bounded ring buffer of recent events. Diagnostics only.
#[derive(Debug, Clone)]
pub struct EventLog {
    capacity: usize,
    entries: VecDeque<EventLogEntry>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, at: DateTime<Utc>, event: SchedulerEvent) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(EventLogEntry { at, event });
    }

    pub fn entries(&self) -> Vec<EventLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read-only copy of the scheduler's visible state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub active: Option<InstructionState>,
    /// Queue in display order
    pub queue: Vec<InstructionState>,
}

impl SchedulerSnapshot {
    pub fn active_id(&self) -> Option<InstructionId> {
        self.active.as_ref().map(|s| s.id)
    }

    /// Find an entry in either the active slot or the queue.
    pub fn get(&self, id: InstructionId) -> Option<&InstructionState> {
        self.active
            .iter()
            .chain(self.queue.iter())
            .find(|s| s.id == id)
    }
}

/// Notification delivered to subscribers after each mutating operation.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerChange {
    /// Increases by one per delivered change
    pub revision: u64,
    pub events: Vec<SchedulerEvent>,
    pub snapshot: SchedulerSnapshot,
}

/// Observer of scheduler changes.
///
/// Called after the scheduler's lock is released, so implementations may
/// call back into the scheduler.
pub trait SchedulerSubscriber: Send + Sync {
    fn on_change(&self, change: &SchedulerChange);
}

impl<F> SchedulerSubscriber for F
where
    F: Fn(&SchedulerChange) + Send + Sync,
{
    fn on_change(&self, change: &SchedulerChange) {
        self(change)
    }
}

/// Token returned by `Scheduler::subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);
