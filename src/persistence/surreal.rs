//! SurrealDB-backed state store.

use super::{Db, StateStore};
use crate::error::{ArbiterError, ArbiterResult};
use crate::types::StorageKey;
use async_trait::async_trait;

#[derive(serde::Deserialize)]
struct Stored {
    payload: String,
}

/// Stores each key as a `scheduler_state` record whose id is the key.
#[derive(Clone)]
pub struct SurrealStore {
    db: Db,
}

impl SurrealStore {
    /// Create a store on a connection prepared by `ensure_schema`.
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateStore for SurrealStore {
    async fn get(&self, key: &StorageKey) -> ArbiterResult<Option<String>> {
        let query = r#"
            SELECT payload FROM type::thing('scheduler_state', $key)
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("key", key.as_str().to_string()))
            .await
            .map_err(|e| ArbiterError::Persistence(e.to_string()))?;

        let rows: Vec<Stored> = res
            .take(0)
            .map_err(|e| ArbiterError::Persistence(e.to_string()))?;

        Ok(rows.into_iter().next().map(|r| r.payload))
    }

    async fn set(&self, key: &StorageKey, value: String) -> ArbiterResult<()> {
        let query = r#"
            UPSERT type::thing('scheduler_state', $key) SET
                storage_key = $key,
                payload = $payload
            RETURN payload
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("key", key.as_str().to_string()))
            .bind(("payload", value))
            .await
            .map_err(|e| ArbiterError::Persistence(e.to_string()))?;

        // Statement-level errors only surface on `take`.
        let _: Vec<Stored> = res
            .take(0)
            .map_err(|e| ArbiterError::Persistence(e.to_string()))?;

        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> ArbiterResult<()> {
        let query = r#"
            DELETE type::thing('scheduler_state', $key)
        "#;

        self.db
            .query(query)
            .bind(("key", key.as_str().to_string()))
            .await
            .map_err(|e| ArbiterError::Persistence(e.to_string()))?;

        Ok(())
    }
}
