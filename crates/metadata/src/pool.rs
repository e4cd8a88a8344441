//! Role-aware transactional connection pool.
//!
//! A single pool of connections authenticated as the store's owning identity
//! serves every role. Each acquisition opens a transaction and narrows it to
//! the requested [`DbRole`] for that transaction only, so privileges follow
//! the operation rather than the connection.

use crate::error::{MetadataError, MetadataResult};
use crate::models::AuditEntry;
use crate::repos::AuditRepo;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::{PgConnection, Pool, Postgres, Sqlite, SqliteConnection, Transaction};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use trove_core::config::AuditFailurePolicy;
use trove_core::{BackendType, DbRole, OperationContext, RequestContext, sha256_hex};

/// Backend-specific privilege narrowing.
pub trait RoleDialect: sqlx::Database {
    const BACKEND: BackendType;

    /// Restrict the open transaction on `conn` to `role` until it ends.
    fn narrow_role(
        conn: &mut Self::Connection,
        role: DbRole,
    ) -> BoxFuture<'_, Result<(), sqlx::Error>>;
}

impl RoleDialect for Postgres {
    const BACKEND: BackendType = BackendType::Postgres;

    fn narrow_role(
        conn: &mut PgConnection,
        role: DbRole,
    ) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        Box::pin(async move {
            // Identifiers cannot be bound as parameters. The name comes from
            // the closed role enum only.
            let statement = format!("SET LOCAL ROLE {}", role.db_role_name());
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&statement)).await?;
            Ok(())
        })
    }
}

impl RoleDialect for Sqlite {
    const BACKEND: BackendType = BackendType::Sqlite;

    /// SQLite has no roles; the requested role is kept for attribution and
    /// audit entries are marked `role_enforced: false`.
    fn narrow_role(
        _conn: &mut SqliteConnection,
        _role: DbRole,
    ) -> BoxFuture<'_, Result<(), sqlx::Error>> {
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// What an audited unit of work did, for the audit entry it produces.
#[derive(Debug, Clone)]
pub struct AuditAction {
    pub action: String,
    pub table: String,
    pub query: Option<String>,
}

impl AuditAction {
    pub fn new(action: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            table: table.into(),
            query: None,
        }
    }

    /// Attach the statement text; only its hash is recorded.
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }
}

/// How an executed unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
    Panicked,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::RolledBack => "rolled_back",
            Outcome::Panicked => "panicked",
            Outcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    acquired: AtomicU64,
    acquire_count: AtomicU64,
    wait_count: AtomicU64,
    wait_micros: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    audit_failures: AtomicU64,
    per_role: [AtomicU64; DbRole::ALL.len()],
}

/// Point-in-time pool saturation and usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub backend: BackendType,
    pub max_connections: u32,
    /// Physical connections currently open (idle + in use).
    pub total_connections: u32,
    pub idle_connections: u32,
    /// Role connections currently checked out.
    pub acquired: u64,
    pub acquire_count: u64,
    /// Acquisitions that started while every connection was in use.
    pub wait_count: u64,
    pub wait_duration: Duration,
    pub commits: u64,
    pub rollbacks: u64,
    pub audit_failures: u64,
    pub role_invocations: BTreeMap<DbRole, u64>,
}

/// Pool handing out role-scoped transactions.
///
/// Clones share the underlying pool and counters.
pub struct RolePool<DB: RoleDialect> {
    pool: Pool<DB>,
    node_id: Arc<str>,
    audit: Option<Arc<dyn AuditRepo>>,
    audit_policy: AuditFailurePolicy,
    counters: Arc<PoolCounters>,
}

impl<DB: RoleDialect> Clone for RolePool<DB> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            node_id: self.node_id.clone(),
            audit: self.audit.clone(),
            audit_policy: self.audit_policy,
            counters: self.counters.clone(),
        }
    }
}

fn map_acquire_error(err: sqlx::Error) -> MetadataError {
    match err {
        sqlx::Error::PoolTimedOut => MetadataError::AcquireTimeout,
        sqlx::Error::PoolClosed => MetadataError::PoolClosed,
        other => MetadataError::Database(other),
    }
}

impl<DB: RoleDialect> RolePool<DB> {
    /// Wrap `pool`. Audit entries written by [`RolePool::execute`] carry `node_id`.
    pub fn new(pool: Pool<DB>, node_id: impl Into<Arc<str>>) -> Self {
        Self {
            pool,
            node_id: node_id.into(),
            audit: None,
            audit_policy: AuditFailurePolicy::default(),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Emit one audit entry per executed unit of work to `audit`.
    pub fn with_audit(mut self, audit: Arc<dyn AuditRepo>, policy: AuditFailurePolicy) -> Self {
        self.audit = Some(audit);
        self.audit_policy = policy;
        self
    }

    pub fn backend(&self) -> BackendType {
        DB::BACKEND
    }

    /// The underlying sqlx pool, for statements that bypass role scoping.
    pub fn inner(&self) -> &Pool<DB> {
        &self.pool
    }

    pub fn max_connections(&self) -> u32 {
        self.pool.options().get_max_connections()
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Open a transaction narrowed to `role`.
    ///
    /// If narrowing fails the transaction is rolled back and the connection
    /// returned before the error is reported.
    pub async fn acquire_with_role(&self, role: DbRole) -> MetadataResult<RoleConnection<DB>> {
        let conn = self.begin(role).await?;
        self.counters.per_role[role.index()].fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// Audit-role transaction for the store's own chain appends.
    ///
    /// Not counted in the per-role invocations, which track callers' work.
    pub(crate) async fn acquire_for_audit(&self) -> MetadataResult<RoleConnection<DB>> {
        self.begin(DbRole::Audit).await
    }

    async fn begin(&self, role: DbRole) -> MetadataResult<RoleConnection<DB>> {
        if self.pool.is_closed() {
            return Err(MetadataError::PoolClosed);
        }

        let saturated = self.pool.num_idle() == 0 && self.pool.size() >= self.max_connections();
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_acquire_error)?;
        if saturated {
            let waited = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            self.counters.wait_count.fetch_add(1, Ordering::Relaxed);
            self.counters
                .wait_micros
                .fetch_add(waited, Ordering::Relaxed);
        }

        if let Err(source) = DB::narrow_role(&mut *tx, role).await {
            tracing::warn!(
                role = %role,
                db_role = role.db_role_name(),
                error = %source,
                "Role switch rejected by database"
            );
            if let Err(err) = tx.rollback().await {
                tracing::debug!(error = %err, "Rollback after failed role switch also failed");
            }
            return Err(MetadataError::RoleSwitchFailed { role, source });
        }

        self.counters.acquired.fetch_add(1, Ordering::Relaxed);
        self.counters.acquire_count.fetch_add(1, Ordering::Relaxed);

        Ok(RoleConnection {
            tx: Some(tx),
            role,
            state: TxState::Open,
            rows_affected: 0,
            acquired_at: Instant::now(),
            comment: None,
            counters: self.counters.clone(),
        })
    }

    /// Parse `name` against the closed role set, then acquire.
    pub async fn acquire_with_role_name(&self, name: &str) -> MetadataResult<RoleConnection<DB>> {
        let role: DbRole = name.parse()?;
        self.acquire_with_role(role).await
    }

    /// Acquire with the role of the operation attached to `ctx`.
    ///
    /// A request without an operation context is rejected rather than
    /// given a guessed role.
    pub async fn acquire_with_context(
        &self,
        ctx: &RequestContext,
    ) -> MetadataResult<RoleConnection<DB>> {
        let op = ctx
            .operation()
            .ok_or(MetadataError::MissingOperationContext)?;
        let mut conn = ctx.run(self.acquire_with_role(op.role)).await??;
        conn.comment = Some(op.query_comment());
        Ok(conn)
    }

    /// Run `f` in a transaction under the role of the operation attached to
    /// `ctx`, committing on success and rolling back otherwise.
    pub async fn execute<T, F>(
        &self,
        ctx: &RequestContext,
        action: AuditAction,
        f: F,
    ) -> MetadataResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut RoleConnection<DB>) -> BoxFuture<'c, MetadataResult<T>> + Send,
    {
        let role = ctx
            .operation()
            .ok_or(MetadataError::MissingOperationContext)?
            .role;
        self.execute_with_role(ctx, role, action, f).await
    }

    /// Run `f` in a transaction narrowed to `role`.
    ///
    /// The transaction never outlives this call: it is committed when `f`
    /// returns `Ok`, and rolled back when `f` errors, panics, or `ctx` is
    /// cancelled or times out. A panic is re-raised after rollback and audit.
    pub async fn execute_with_role<T, F>(
        &self,
        ctx: &RequestContext,
        role: DbRole,
        action: AuditAction,
        f: F,
    ) -> MetadataResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut RoleConnection<DB>) -> BoxFuture<'c, MetadataResult<T>> + Send,
    {
        ctx.check()?;
        let op = OperationContext::from_request(ctx);
        let mut conn = ctx.run(self.acquire_with_role(role)).await??;
        conn.comment = Some(op.query_comment());
        let started = Instant::now();

        let run = ctx
            .run(AssertUnwindSafe(f(&mut conn)).catch_unwind())
            .await;
        let (result, panic, outcome) = match run {
            Ok(Ok(Ok(value))) => match conn.commit().await {
                Ok(()) => (Ok(value), None, Outcome::Committed),
                Err(err) => (Err(err), None, Outcome::RolledBack),
            },
            Ok(Ok(Err(err))) => {
                discard(&mut conn).await;
                (Err(err), None, Outcome::RolledBack)
            }
            Ok(Err(payload)) => {
                discard(&mut conn).await;
                let err = MetadataError::Internal("unit of work panicked".to_string());
                (Err(err), Some(payload), Outcome::Panicked)
            }
            Err(err) => {
                discard(&mut conn).await;
                (Err(err.into()), None, Outcome::Cancelled)
            }
        };
        let rows = conn.rows_affected();
        drop(conn);

        let audited = self
            .record(&op, role, &action, outcome, rows, started.elapsed())
            .await;
        if let Some(payload) = panic {
            std::panic::resume_unwind(payload);
        }
        match (result, audited) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), _) => Err(err),
        }
    }

    async fn record(
        &self,
        op: &OperationContext,
        role: DbRole,
        action: &AuditAction,
        outcome: Outcome,
        rows: u64,
        elapsed: Duration,
    ) -> MetadataResult<()> {
        let Some(audit) = &self.audit else {
            return Ok(());
        };

        let mut entry = AuditEntry::new(
            self.node_id.as_ref(),
            op,
            action.action.as_str(),
            action.table.as_str(),
        )
        .with_role(role)
        .with_rows_affected(rows)
        .with_duration(elapsed)
        .with_metadata("outcome", outcome.as_str())
        .with_metadata("role_enforced", DB::BACKEND.supports_role_isolation());
        if let Some(query) = &action.query {
            entry = entry.with_query_hash(sha256_hex(query.as_bytes()));
        }

        match audit.log(entry).await {
            Ok(_) => Ok(()),
            Err(err) => {
                self.counters.audit_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %err,
                    policy = ?self.audit_policy,
                    action = %action.action,
                    table = %action.table,
                    outcome = outcome.as_str(),
                    "Audit write failed"
                );
                match self.audit_policy {
                    AuditFailurePolicy::Warn => Ok(()),
                    AuditFailurePolicy::Fail => Err(MetadataError::AuditWrite {
                        outcome: outcome.as_str(),
                        reason: err.to_string(),
                    }),
                }
            }
        }
    }

    /// Snapshot of saturation, usage and per-role invocation counts.
    pub fn stats(&self) -> PoolStats {
        let c = &self.counters;
        PoolStats {
            backend: DB::BACKEND,
            max_connections: self.max_connections(),
            total_connections: self.pool.size(),
            idle_connections: u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX),
            acquired: c.acquired.load(Ordering::Relaxed),
            acquire_count: c.acquire_count.load(Ordering::Relaxed),
            wait_count: c.wait_count.load(Ordering::Relaxed),
            wait_duration: Duration::from_micros(c.wait_micros.load(Ordering::Relaxed)),
            commits: c.commits.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
            audit_failures: c.audit_failures.load(Ordering::Relaxed),
            role_invocations: DbRole::ALL
                .iter()
                .map(|role| (*role, c.per_role[role.index()].load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

async fn discard<DB: RoleDialect>(conn: &mut RoleConnection<DB>) {
    if let Err(err) = conn.release().await {
        tracing::debug!(role = %conn.role, error = %err, "Rollback failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// One physical connection holding one role-narrowed transaction.
///
/// The handle is neither `Clone` nor shareable; every statement goes through
/// `&mut self`. Dropping it without [`commit`](Self::commit),
/// [`rollback`](Self::rollback) or [`release`](Self::release) rolls the
/// transaction back.
pub struct RoleConnection<DB: RoleDialect> {
    tx: Option<Transaction<'static, DB>>,
    role: DbRole,
    state: TxState,
    rows_affected: u64,
    acquired_at: Instant,
    comment: Option<String>,
    counters: Arc<PoolCounters>,
}

impl<DB: RoleDialect> RoleConnection<DB> {
    pub fn role(&self) -> DbRole {
        self.role
    }

    /// The connection to run statements on while the transaction is open.
    pub fn conn(&mut self) -> MetadataResult<&mut DB::Connection> {
        self.tx
            .as_deref_mut()
            .ok_or(MetadataError::TransactionClosed)
    }

    /// Add to the row count reported in this operation's audit entry.
    pub fn record_rows(&mut self, rows: u64) {
        self.rows_affected = self.rows_affected.saturating_add(rows);
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    /// Prefix `sql` with the operation's correlation comment, if any.
    pub fn annotate(&self, sql: &str) -> String {
        match &self.comment {
            Some(comment) => format!("{comment} {sql}"),
            None => sql.to_string(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == TxState::Open
    }

    pub fn is_committed(&self) -> bool {
        self.state == TxState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TxState::RolledBack
    }

    /// How long the transaction has been open.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub async fn commit(&mut self) -> MetadataResult<()> {
        let tx = self.tx.take().ok_or(MetadataError::TransactionClosed)?;
        match tx.commit().await {
            Ok(()) => {
                self.finish(TxState::Committed);
                Ok(())
            }
            Err(err) => {
                self.finish(TxState::RolledBack);
                Err(err.into())
            }
        }
    }

    pub async fn rollback(&mut self) -> MetadataResult<()> {
        let tx = self.tx.take().ok_or(MetadataError::TransactionClosed)?;
        self.finish(TxState::RolledBack);
        tx.rollback().await?;
        Ok(())
    }

    /// Roll back unless already committed or rolled back. Safe to call any
    /// number of times.
    pub async fn release(&mut self) -> MetadataResult<()> {
        if self.tx.is_none() {
            return Ok(());
        }
        self.rollback().await
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.counters.acquired.fetch_sub(1, Ordering::Relaxed);
        match state {
            TxState::Committed => self.counters.commits.fetch_add(1, Ordering::Relaxed),
            _ => self.counters.rollbacks.fetch_add(1, Ordering::Relaxed),
        };
    }
}

impl<DB: RoleDialect> Drop for RoleConnection<DB> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::warn!(
                role = %self.role,
                held_ms = self.acquired_at.elapsed().as_millis() as u64,
                "RoleConnection dropped without release; rolling back"
            );
            // Dropping an unfinished sqlx transaction queues its rollback.
            drop(tx);
            self.finish(TxState::RolledBack);
        }
    }
}

impl<DB: RoleDialect> std::fmt::Debug for RoleConnection<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleConnection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("rows_affected", &self.rows_affected)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(Outcome::Committed.as_str(), "committed");
        assert_eq!(Outcome::RolledBack.as_str(), "rolled_back");
        assert_eq!(Outcome::Panicked.as_str(), "panicked");
        assert_eq!(Outcome::Cancelled.as_str(), "cancelled");
    }

    #[test]
    fn test_audit_action_builder() {
        let action = AuditAction::new("insert", "datasets").with_query("INSERT INTO datasets");
        assert_eq!(action.action, "insert");
        assert_eq!(action.table, "datasets");
        assert_eq!(action.query.as_deref(), Some("INSERT INTO datasets"));
    }

    #[test]
    fn test_acquire_error_mapping() {
        assert!(matches!(
            map_acquire_error(sqlx::Error::PoolTimedOut),
            MetadataError::AcquireTimeout
        ));
        assert!(matches!(
            map_acquire_error(sqlx::Error::PoolClosed),
            MetadataError::PoolClosed
        ));
        assert!(matches!(
            map_acquire_error(sqlx::Error::RowNotFound),
            MetadataError::Database(_)
        ));
    }
}
