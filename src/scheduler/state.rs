//! Scheduler entries and their ordering.

use crate::instruction::{Instruction, InstructionKind, Priority};
use crate::types::{InstructionId, ProducerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

/// Lifecycle status of a scheduled instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionStatus {
    Pending,
    Active,
    /// Withdrawn from the active slot; waits for an explicit resume.
    Deferred,
    Completed,
    Cancelled,
    Error,
    Timeout,
    Superseded,
}

impl InstructionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Deferred => "deferred",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Superseded => "superseded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Error | Self::Timeout | Self::Superseded
        )
    }

    /// Still competing for (or holding) the active slot.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    /// Statuses `retry_instruction` accepts.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Error | Self::Timeout | Self::Cancelled)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending | Self::Deferred | Self::Active => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for InstructionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An admitted instruction together with its scheduling state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionState {
    pub id: InstructionId,
    pub instruction: Instruction,
    pub status: InstructionStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_id: Option<ProducerId>,
    /// Ids this entry is blocked by while any of them is still live.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub conflicts_with: BTreeSet<InstructionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<InstructionId>,
    #[serde(default)]
    pub retry_count: u32,
    /// User response recorded by `complete_active`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    /// Cancel/defer reason or error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl InstructionState {
    pub fn new(
        id: InstructionId,
        instruction: Instruction,
        submitted_at: DateTime<Utc>,
        timeout_ms: Option<u64>,
    ) -> Self {
        let producer_id = instruction.producer_id().cloned();
        Self {
            id,
            instruction,
            status: InstructionStatus::Pending,
            submitted_at,
            started_at: None,
            completed_at: None,
            timeout_ms,
            producer_id,
            conflicts_with: BTreeSet::new(),
            superseded_by: None,
            retry_count: 0,
            response: None,
            reason: None,
        }
    }

    pub fn kind(&self) -> InstructionKind {
        self.instruction.kind()
    }

    pub fn priority(&self) -> Priority {
        self.instruction.priority()
    }

    pub fn is_from(&self, producer: Option<&ProducerId>) -> bool {
        matches!((self.producer_id.as_ref(), producer), (Some(a), Some(b)) if a == b)
    }

    /// Move to a terminal status.
    pub(crate) fn finish(&mut self, status: InstructionStatus, at: DateTime<Utc>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(at);
    }

    /// Back to `pending` for another run, dropping the previous outcome.
    pub(crate) fn reset(&mut self) {
        self.status = InstructionStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.response = None;
        self.reason = None;
    }
}

/// Queue order: live before terminal, then higher priority, then lower
/// explicit sequence (only when both entries carry one), then submission id.
pub fn compare(a: &InstructionState, b: &InstructionState) -> Ordering {
    a.status
        .rank()
        .cmp(&b.status.rank())
        .then_with(|| b.priority().cmp(&a.priority()))
        .then_with(|| match (a.instruction.sequence(), b.instruction.sequence()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort entries by [`compare`].
///
/// `compare` is not transitive once pinned and unpinned sequences mix, which
/// `slice::sort_by` may reject. A stable insertion sort stays deterministic
/// for any input; queues are small.
pub fn sort_queue(entries: &mut [InstructionState]) {
    for i in 1..entries.len() {
        let mut j = i;
        while j > 0 && compare(&entries[j - 1], &entries[j]) == Ordering::Greater {
            entries.swap(j - 1, j);
            j -= 1;
        }
    }
}
