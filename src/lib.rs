// Core modules
pub mod config;
pub mod error;
pub mod instruction;
pub mod registry;
pub mod types;

// Scheduling and state
pub mod persistence;
pub mod replay;
pub mod scheduler;

// Re-export key types and functions
pub use config::{ArbiterConfig, ProducerConfig, load_config};
pub use error::{ArbiterError, ArbiterResult, AuthorizationError, ValidationError};
pub use instruction::{Instruction, InstructionKind, Priority};
pub use persistence::{DatabaseConfig, StateStore, SurrealStore, create_connection, ensure_schema};
pub use registry::{ProducerInfo, ProducerRegistry, Verifier};
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerSettings};
pub use types::{InstructionId, ProducerId};

use std::sync::Arc;

/// Convenience function to build a scheduler from a loaded configuration,
/// persisting to SurrealDB at `db`.
///
/// This connects, ensures the schema, and restores any fresh persisted state.
pub async fn create_scheduler(config: &ArbiterConfig, db: DatabaseConfig) -> anyhow::Result<Scheduler> {
    let conn = create_connection(db).await?;
    ensure_schema(&conn).await?;

    let scheduler = Scheduler::builder(config.registry())
        .conflicts(config.conflict_table()?)
        .settings(config.scheduler.clone())
        .store(Arc::new(SurrealStore::new(conn)))
        .init()
        .await?;

    Ok(scheduler)
}
