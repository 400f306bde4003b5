//! Background persistence writer.
//!
//! Scheduler operations are synchronous, so they hand writes to a tokio task
//! over an unbounded channel instead of awaiting the store. The task applies
//! commands strictly in send order; a failed write is logged and the next
//! command proceeds.

use super::{PersistedState, StateStore};
use crate::types::StorageKey;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
enum PersistCommand {
    Save(String),
    Remove,
    Flush(oneshot::Sender<()>),
}

/// Handle to the writer task for one store and key.
pub struct Persister {
    store: Arc<dyn StateStore>,
    key: StorageKey,
    sender: Mutex<Option<mpsc::UnboundedSender<PersistCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Persister {
    /// Spawn the writer on the current tokio runtime.
    pub fn spawn(store: Arc<dyn StateStore>, key: StorageKey) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(Self::write_loop(store.clone(), key.clone(), receiver));

        Self {
            store,
            key,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    async fn write_loop(
        store: Arc<dyn StateStore>,
        key: StorageKey,
        mut receiver: mpsc::UnboundedReceiver<PersistCommand>,
    ) {
        debug!("Persistence writer started for key {}", key);

        while let Some(command) = receiver.recv().await {
            match command {
                PersistCommand::Save(payload) => {
                    if let Err(e) = store.set(&key, payload).await {
                        warn!("Failed to persist scheduler state: {}", e);
                    }
                }
                PersistCommand::Remove => {
                    if let Err(e) = store.remove(&key).await {
                        warn!("Failed to erase persisted scheduler state: {}", e);
                    }
                }
                PersistCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }

        debug!("Persistence writer stopped for key {}", key);
    }

    fn send(&self, command: PersistCommand) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }

    /// Queue a snapshot write. Never fails; problems are logged.
    pub fn save(&self, state: &PersistedState) {
        match state.encode() {
            Ok(payload) => {
                if !self.send(PersistCommand::Save(payload)) {
                    debug!("Persistence writer closed, dropping state write");
                }
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Queue removal of the persisted state.
    pub fn remove(&self) {
        if !self.send(PersistCommand::Remove) {
            debug!("Persistence writer closed, dropping state removal");
        }
    }

    /// Wait until every previously queued command has been applied.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.send(PersistCommand::Flush(done)) {
            let _ = wait.await;
        }
    }

    /// Apply outstanding commands and stop the writer. Later saves are
    /// dropped.
    pub async fn close(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Persistence writer ended abnormally: {}", e);
            }
        }
    }
}
