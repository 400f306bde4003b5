//! In-process state store.

use super::StateStore;
use crate::error::ArbiterResult;
use crate::types::StorageKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Volatile store, shared between clones. Used by tests and by the CLI when
/// no database is configured.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<StorageKey, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &StorageKey) -> ArbiterResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &StorageKey, value: String) -> ArbiterResult<()> {
        self.entries.lock().await.insert(key.clone(), value);
        Ok(())
    }

    async fn remove(&self, key: &StorageKey) -> ArbiterResult<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_entries() {
        let store = MemoryStore::new();
        let other = store.clone();
        let key = StorageKey::new("state");

        store.set(&key, "payload".to_string()).await.unwrap();
        assert_eq!(other.get(&key).await.unwrap().as_deref(), Some("payload"));

        other.remove(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
