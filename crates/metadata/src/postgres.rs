//! PostgreSQL-based metadata store implementation.

use crate::audit::{self, AUDIT_CHAIN_LOCK_KEY, AUDIT_COLUMNS, GENESIS_HASH};
use crate::error::{MetadataError, MetadataResult};
use crate::migrations::postgres::PgMigrationDriver;
use crate::migrations::{Migration, MigrationManager, MigrationReport, POSTGRES_MIGRATIONS};
use crate::models::{AuditEntry, MigrationInfo};
use crate::pool::{PoolStats, RolePool};
use crate::repos::AuditRepo;
use crate::store::{MetadataStore, StoreOptions};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use trove_core::config::{AuditConfig, PgSslMode};
use trove_core::{BackendType, RequestContext};

/// Pool sizing and timeouts for [`PostgresStore`].
#[derive(Clone, Copy, Debug)]
pub struct PgPoolSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub statement_timeout_ms: Option<u64>,
}

impl Default for PgPoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            statement_timeout_ms: None,
        }
    }
}

/// PostgreSQL-based metadata store.
///
/// Authoritative: every role connection runs under `SET LOCAL ROLE`, and
/// audit appends are serialized by a transaction-scoped advisory lock.
pub struct PostgresStore {
    pool: RolePool<Postgres>,
    audit: AuditConfig,
    migrations: MigrationManager,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        settings: PgPoolSettings,
        options: StoreOptions,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, settings, options).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    ///
    /// This allows credentials to be passed separately, enabling better
    /// secret management (e.g., passwords via environment variables).
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        settings: PgPoolSettings,
        options: StoreOptions,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, settings, options).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        settings: PgPoolSettings,
        options: StoreOptions,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = settings.statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(opts)
            .await?;

        let migrations = MigrationManager::new(
            Arc::new(PgMigrationDriver::new(pool.clone())),
            Migration::from_files(POSTGRES_MIGRATIONS)?,
            options.migrations.clone(),
        );

        let store = Self {
            pool: RolePool::new(pool, options.node_id),
            audit: options.audit,
            migrations,
        };
        if options.auto_migrate {
            store.migrate().await?;
        }

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        self.pool.inner()
    }

    /// Role pool without an audit sink.
    pub fn role_pool(&self) -> &RolePool<Postgres> {
        &self.pool
    }

    /// Role pool that records every executed unit of work in this store's
    /// audit log (when auditing is enabled).
    pub fn audited_pool(self: &Arc<Self>) -> RolePool<Postgres> {
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
impl MetadataStore for PostgresStore {
    fn backend(&self) -> BackendType {
        BackendType::Postgres
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
impl AuditRepo for PostgresStore {
    async fn log(&self, mut entry: AuditEntry) -> MetadataResult<AuditEntry> {
        let mut conn = self.pool.acquire_for_audit().await?;

        if self.audit.hash_chain && !entry.is_sealed() {
            // Held until commit, so the tail read below stays the tail.
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(AUDIT_CHAIN_LOCK_KEY)
                .execute(conn.conn()?)
                .await?;
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING id
            "#,
        )
        .bind(entry.timestamp)
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
        let result = sqlx::query("DELETE FROM audit_log WHERE timestamp < $1")
            .bind(before)
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
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id BETWEEN $1 AND $2 ORDER BY id"
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
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE id BETWEEN $1 AND $2 ORDER BY id LIMIT $3"
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
            "SELECT entry_hash FROM audit_log WHERE id < $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(id)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(hash)
    }
}
