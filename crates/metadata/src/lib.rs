//! Storage core for the trove daemon.
//!
//! This crate provides:
//! - A role-aware connection pool that narrows every transaction to one role
//! - A hash-chained, append-only audit log
//! - Checksum-verified, lock-guarded schema migrations
//! - PostgreSQL (authoritative) and SQLite (cache-only) stores

pub mod audit;
pub mod error;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{ErrorKind, MetadataError, MetadataResult};
pub use migrations::{MigrationManager, MigrationReport};
pub use pool::{AuditAction, Outcome, PoolStats, RoleConnection, RoleDialect, RolePool};
pub use postgres::{PgPoolSettings, PostgresStore};
pub use repos::AuditRepo;
pub use store::{MetadataStore, SqliteStore, StoreOptions};

use std::sync::Arc;
use std::time::Duration;
use trove_core::config::{AppConfig, MetadataConfig};
use trove_core::{ModeEnforcementResult, enforce_mode};

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    options: StoreOptions,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs, options).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            host,
            port,
            username,
            password,
            database,
            ssl_mode,
            max_connections,
            acquire_timeout_secs,
            statement_timeout_ms,
        } => {
            let settings = PgPoolSettings {
                max_connections: *max_connections,
                acquire_timeout: Duration::from_secs(*acquire_timeout_secs),
                statement_timeout_ms: *statement_timeout_ms,
            };
            let store = if let Some(url) = url {
                // URL takes precedence over individual fields
                tracing::info!("Connecting to PostgreSQL using connection URL");
                PostgresStore::from_url(url, settings, options).await?
            } else if let (Some(host), Some(database)) = (host.as_ref(), database.as_ref()) {
                PostgresStore::from_params(
                    host,
                    port.unwrap_or(5432),
                    username.as_deref(),
                    password.as_deref(),
                    database,
                    *ssl_mode,
                    settings,
                    options,
                )
                .await?
            } else {
                return Err(MetadataError::Config(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ));
            };
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

/// A store opened under a checked node mode.
pub struct OpenedStore {
    pub store: Arc<dyn MetadataStore>,
    /// Mode the node must actually run in.
    pub enforcement: ModeEnforcementResult,
}

/// Gate the configured mode against the backend, then open (and migrate)
/// the store.
///
/// A full-mode node on a cache-only backend is downgraded to selective;
/// enforcement never upgrades trust to match the requested mode.
pub async fn open(config: &AppConfig, options: StoreOptions) -> MetadataResult<OpenedStore> {
    let enforcement = enforce_mode(config.node.mode, config.metadata.backend()).into_result()?;
    if enforcement.downgraded {
        tracing::warn!(
            requested = %enforcement.original_mode,
            effective = %enforcement.effective_mode,
            "{}",
            enforcement.warning
        );
    } else if !enforcement.warning.is_empty() {
        tracing::info!(mode = %enforcement.effective_mode, "{}", enforcement.warning);
    }

    let store = from_config(&config.metadata, options).await?;
    Ok(OpenedStore { store, enforcement })
}
