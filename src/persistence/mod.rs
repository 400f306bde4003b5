//! Durable scheduler state.
//!
//! The scheduler writes its whole visible state (`queue`, `active`,
//! `timestamp`) as one JSON document under a single key after every
//! mutating operation. Stores only need get/set/remove by key.

mod connection;
mod memory;
mod surreal;
mod writer;

pub use connection::{DatabaseConfig, Db, create_connection, ensure_schema};
pub use memory::MemoryStore;
pub use surreal::SurrealStore;
pub use writer::Persister;

use crate::error::{ArbiterError, ArbiterResult};
use crate::scheduler::InstructionState;
use crate::types::StorageKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Key-value store for serialized scheduler state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &StorageKey) -> ArbiterResult<Option<String>>;

    async fn set(&self, key: &StorageKey, value: String) -> ArbiterResult<()>;

    async fn remove(&self, key: &StorageKey) -> ArbiterResult<()>;
}

/// Serialized form of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub queue: Vec<InstructionState>,
    #[serde(default)]
    pub active: Option<InstructionState>,
    /// When the state was written
    pub timestamp: DateTime<Utc>,
}

impl PersistedState {
    pub fn encode(&self) -> ArbiterResult<String> {
        serde_json::to_string(self)
            .map_err(|e| ArbiterError::Persistence(format!("Failed to encode state: {}", e)))
    }

    /// Decode a stored document. Instructions inside it are decoded through
    /// the same checks as newly submitted ones.
    pub fn decode(raw: &str) -> ArbiterResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ArbiterError::Persistence(format!("Failed to decode state: {}", e)))
    }

    /// Decode and drop the document if it is older than `staleness`.
    pub fn decode_fresh(
        raw: &str,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> ArbiterResult<Option<Self>> {
        let state = Self::decode(raw)?;
        if state.is_stale(now, staleness) {
            info!(
                "Discarding persisted scheduler state from {} (older than {:?})",
                state.timestamp, staleness
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub fn is_stale(&self, now: DateTime<Utc>, staleness: Duration) -> bool {
        chrono::Duration::from_std(staleness).is_ok_and(|max_age| now - self.timestamp > max_age)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;
    use crate::scheduler::InstructionStatus;
    use crate::types::InstructionId;

    fn state(timestamp: DateTime<Utc>) -> PersistedState {
        let mut active = InstructionState::new(
            InstructionId::new(1),
            Instruction::email_request("Email?", None).with_producer("agent1"),
            timestamp,
            Some(30_000),
        );
        active.status = InstructionStatus::Active;
        active.started_at = Some(timestamp);

        let queued = InstructionState::new(
            InstructionId::new(2),
            Instruction::progress_indicator("Working", None).with_producer("agent1"),
            timestamp,
            None,
        );

        PersistedState {
            queue: vec![queued],
            active: Some(active),
            timestamp,
        }
    }

    #[test]
    fn test_encode_decode() {
        let original = state(Utc::now());
        let raw = original.encode().unwrap();
        assert!(raw.contains("\"startedAt\""));
        assert_eq!(PersistedState::decode(&raw).unwrap(), original);
    }

    #[test]
    fn test_stale_state_is_dropped() {
        let now = Utc::now();
        let hour = Duration::from_secs(3600);

        let fresh = state(now - chrono::Duration::minutes(59)).encode().unwrap();
        assert!(PersistedState::decode_fresh(&fresh, now, hour).unwrap().is_some());

        let stale = state(now - chrono::Duration::minutes(61)).encode().unwrap();
        assert!(PersistedState::decode_fresh(&stale, now, hour).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        assert!(matches!(
            PersistedState::decode("{not json"),
            Err(ArbiterError::Persistence(_))
        ));

        // Structurally valid JSON holding an unknown kind is rejected too.
        let raw = r#"{"queue":[{"id":1,"instruction":{"kind":"show_fireworks","parameters":{},"metadata":{"version":"1.0.0"}},"status":"pending","submittedAt":"2026-01-01T00:00:00Z"}],"timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(PersistedState::decode(raw).is_err());
    }
}
