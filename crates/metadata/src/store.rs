//! Metadata store trait and SQLite implementation.

use crate::audit::{self, AUDIT_COLUMNS, GENESIS_HASH};
use crate::error::{MetadataError, MetadataResult};
use crate::migrations::sqlite::SqliteMigrationDriver;
use crate::migrations::{Migration, MigrationManager, MigrationReport, SQLITE_MIGRATIONS};
use crate::models::{AuditEntry, MigrationInfo};
use crate::pool::{PoolStats, RolePool};
use crate::repos::AuditRepo;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use trove_core::config::{AppConfig, AuditConfig, MigrationConfig};
use trove_core::{BackendType, RequestContext};

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: AuditRepo + Send + Sync {
    fn backend(&self) -> BackendType;

    /// Bring the schema up to date.
    async fn migrate(&self) -> MetadataResult<MigrationReport>;

    /// Revert the most recent migration.
    async fn migrate_down(&self) -> MetadataResult<Option<i64>>;

    /// Embedded and applied migrations.
    async fn list_migrations(&self) -> MetadataResult<Vec<MigrationInfo>>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    fn pool_stats(&self) -> PoolStats;

    /// Close the pool. Subsequent acquisitions fail with `PoolClosed`.
    async fn close(&self);
}

/// Settings shared by both store implementations.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Recorded in every audit entry written through the store's pool.
    pub node_id: String,
    pub audit: AuditConfig,
    pub migrations: MigrationConfig,
    /// Run pending migrations while opening (default: true).
    pub auto_migrate: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            node_id: "trove-node".to_string(),
            audit: AuditConfig::default(),
            migrations: MigrationConfig::default(),
            auto_migrate: true,
        }
    }
}

impl From<&AppConfig> for StoreOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            node_id: config.node.node_id.clone(),
            audit: config.audit.clone(),
            migrations: config.migrations.clone(),
            auto_migrate: true,
        }
    }
}

/// SQLite-based metadata store.
///
/// Cache-only: no role isolation, one connection, and an in-process writer
/// lock around audit appends.
pub struct SqliteStore {
    pool: RolePool<Sqlite>,
    audit: AuditConfig,
    migrations: MigrationManager,
    audit_writer: Mutex<()>,
}

impl SqliteStore {
    /// Create a new SQLite store.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
        options: StoreOptions,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();
        let query_timeout_secs = query_timeout_secs.unwrap_or(600); // 10 minutes default

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes writers inside the process.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let migrations = MigrationManager::new(
            Arc::new(SqliteMigrationDriver::new(
                pool.clone(),
                options.migrations.lock_timeout(),
            )),
            Migration::from_files(SQLITE_MIGRATIONS)?,
            options.migrations.clone(),
        );

        let store = Self {
            pool: RolePool::new(pool, options.node_id),
            audit: options.audit,
            migrations,
            audit_writer: Mutex::new(()),
        };
        if options.auto_migrate {
            store.migrate().await?;
        }

        tracing::warn!(
            query_timeout_secs = query_timeout_secs,
            "SQLite backend is cache-only: no per-role isolation and advisory query timeouts. \
             Use PostgreSQL for authoritative (full mode) deployments."
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.pool.inner()
    }

    /// Role pool without an audit sink.
    pub fn role_pool(&self) -> &RolePool<Sqlite> {
        &self.pool
    }

    /// Role pool that records every executed unit of work in this store's
    /// audit log (when auditing is enabled).
    pub fn audited_pool(self: &Arc<Self>) -> RolePool<Sqlite> {
        if !self.audit.enabled {
            return self.pool.clone();
        }
        self.pool
            .clone()
            .with_audit(self.clone(), self.audit.failure_policy)
    }

    pub fn migration_manager(&self) -> &MigrationManager {
        &self.migrations
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    fn backend(&self) -> BackendType {
        BackendType::Sqlite
    }

    async fn migrate(&self) -> MetadataResult<MigrationReport> {
        self.migrations.up(&RequestContext::new()).await
    }

    async fn migrate_down(&self) -> MetadataResult<Option<i64>> {
        self.migrations.down(&RequestContext::new()).await
    }

    async fn list_migrations(&self) -> MetadataResult<Vec<MigrationInfo>> {
        self.migrations.list().await
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(self.pool.inner()).await?;
        Ok(())
    }

    fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl AuditRepo for SqliteStore {
    async fn log(&self, mut entry: AuditEntry) -> MetadataResult<AuditEntry> {
        let _writer = self.audit_writer.lock().await;
        let mut conn = self.pool.acquire_for_audit().await?;

        if self.audit.hash_chain && !entry.is_sealed() {
            let prev: Option<String> =
                sqlx::query_scalar("SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                    .fetch_optional(conn.conn()?)
                    .await?;
            audit::seal(&mut entry, prev.as_deref().unwrap_or(GENESIS_HASH));
        } else {
            entry.timestamp = audit::truncate_timestamp(entry.timestamp);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO audit_log (
                timestamp, node_id, operation_id, job_id, role_used, action, table_name,
                rows_affected, duration_ms, source_component, actor, query_hash, metadata,
                prev_hash, entry_hash, break_glass, rate_limited, suspicious, alert_triggered
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(audit::format_timestamp(entry.timestamp))
        .bind(&entry.node_id)
        .bind(&entry.operation_id)
        .bind(&entry.job_id)
        .bind(&entry.role_used)
        .bind(&entry.action)
        .bind(&entry.table_name)
        .bind(entry.rows_affected)
        .bind(entry.duration_ms)
        .bind(&entry.source_component)
        .bind(&entry.actor)
        .bind(&entry.query_hash)
        .bind(&entry.metadata)
        .bind(&entry.prev_hash)
        .bind(&entry.entry_hash)
        .bind(entry.break_glass)
        .bind(entry.rate_limited)
        .bind(entry.suspicious)
        .bind(entry.alert_triggered)
        .fetch_one(conn.conn()?)
        .await?;
        conn.commit().await?;

        entry.id = id;
        Ok(entry)
    }

    async fn last_hash(&self) -> MetadataResult<String> {
        let hash: Option<String> =
            sqlx::query_scalar("SELECT entry_hash FROM audit_log ORDER BY id DESC LIMIT 1")
                .fetch_optional(self.pool.inner())
                .await?;
        Ok(hash.unwrap_or_default())
    }

    async fn purge(&self, before: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE timestamp < ?")
            .bind(audit::format_timestamp(before))
            .execute(self.pool.inner())
            .await;
        match result {
            Ok(done) => Ok(done.rows_affected()),
            Err(err) if audit::is_append_only_rejection(&err) => {
                Err(MetadataError::AppendOnly("audit_log".to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn list_entries(&self, from_id: i64, to_id: i64) -> MetadataResult<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id BETWEEN ? AND ? ORDER BY id"
        );
        let entries = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(from_id)
            .bind(to_id)
            .fetch_all(self.pool.inner())
            .await?;
        Ok(entries)
    }

    async fn list_page(
        &self,
        from_id: i64,
        to_id: i64,
        limit: i64,
    ) -> MetadataResult<Vec<AuditEntry>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id BETWEEN ? AND ? ORDER BY id LIMIT ?"
        );
        let entries = sqlx::query_as::<_, AuditEntry>(&sql)
            .bind(from_id)
            .bind(to_id)
            .bind(limit)
            .fetch_all(self.pool.inner())
            .await?;
        Ok(entries)
    }

    async fn hash_before(&self, id: i64) -> MetadataResult<Option<String>> {
        let hash = sqlx::query_scalar(
            "SELECT entry_hash FROM audit_log WHERE id < ? ORDER BY id DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(hash)
    }
}
