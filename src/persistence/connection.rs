//! SurrealDB connection settings and the `scheduler_state` schema.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use tracing::debug;

pub type Db = Surreal<Any>;

const DEFAULT_URL: &str = "memory";
const DEFAULT_NAMESPACE: &str = "arbiter";
const DEFAULT_DATABASE: &str = "scheduler";

/// Where scheduler state is stored. `Default` reads the `SURREALDB_*`
/// variables and falls back to an in-memory database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env_or("SURREALDB_URL", DEFAULT_URL),
            namespace: env_or("SURREALDB_NAMESPACE", DEFAULT_NAMESPACE),
            database: env_or("SURREALDB_DATABASE", DEFAULT_DATABASE),
            username: env::var("SURREALDB_USERNAME").ok(),
            password: env::var("SURREALDB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// Environment defaults with an explicit endpoint.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Root credentials, when both halves are set.
    fn root(&self) -> Option<Root<'_>> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => Some(Root { username, password }),
            _ => None,
        }
    }
}

fn env_or(key: &str, fallback: &str) -> String {
    env::var(key).unwrap_or_else(|_| fallback.to_string())
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url.as_str())
        .await
        .with_context(|| format!("Could not connect to {}", config.url))?;

    if let Some(root) = config.root() {
        db.signin(root).await.context("SurrealDB sign-in failed")?;
    }

    db.use_ns(config.namespace.as_str())
        .use_db(config.database.as_str())
        .await?;
    debug!(
        "Connected to {} ({}/{})",
        config.url, config.namespace, config.database
    );

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    // One record per storage key; the payload is the serialized state document.
    db.query(
        "DEFINE TABLE IF NOT EXISTS scheduler_state SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS storage_key ON TABLE scheduler_state TYPE string;
         DEFINE FIELD IF NOT EXISTS payload ON TABLE scheduler_state TYPE string;
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE scheduler_state VALUE time::now();
         DEFINE INDEX IF NOT EXISTS scheduler_state_key ON TABLE scheduler_state COLUMNS storage_key UNIQUE;",
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_url_overrides_endpoint_only() {
        let config = DatabaseConfig::for_url("mem://");
        assert_eq!(config.url, "mem://");
        assert_eq!(config.namespace, DatabaseConfig::default().namespace);
    }

    #[test]
    fn test_root_needs_both_credentials() {
        let mut config = DatabaseConfig::for_url(DEFAULT_URL);
        config.username = Some("root".to_string());
        config.password = None;
        assert!(config.root().is_none());

        config.password = Some("secret".to_string());
        assert!(config.root().is_some());
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let mut config = DatabaseConfig::for_url(DEFAULT_URL);
        config.username = None;
        config.password = None;
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
    }
}
