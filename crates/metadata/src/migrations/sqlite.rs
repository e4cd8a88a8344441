//! SQLite migration sessions.
//!
//! SQLite has no advisory locks; a single-row lock table stands in. A row
//! older than ten lock timeouts is treated as abandoned by a crashed run and
//! taken over.

use super::{Migration, MigrationDriver, MigrationFile, MigrationSession};
use crate::error::{MetadataError, MetadataResult};
use crate::models::{AppliedMigrationRow, MigrationChecksumRow};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Sqlite, SqlitePool};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Multiple of the lock timeout after which a held lock counts as stale.
const STALE_LOCK_FACTOR: u32 = 10;

const BOOKKEEPING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS schema_migration_checksums (
    version INTEGER NOT NULL,
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (version, filename)
);
"#;

const LOCK_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migration_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    owner TEXT NOT NULL,
    acquired_at INTEGER NOT NULL
);
"#;

pub struct SqliteMigrationDriver {
    pool: SqlitePool,
    stale_after: Duration,
}

impl SqliteMigrationDriver {
    pub fn new(pool: SqlitePool, lock_timeout: Duration) -> Self {
        Self {
            pool,
            stale_after: lock_timeout.saturating_mul(STALE_LOCK_FACTOR),
        }
    }
}

#[async_trait]
impl MigrationDriver for SqliteMigrationDriver {
    async fn session(&self) -> MetadataResult<Box<dyn MigrationSession>> {
        let conn = self.pool.acquire().await?;
        Ok(Box::new(SqliteMigrationSession {
            conn,
            owner: Uuid::new_v4().to_string(),
            stale_after: self.stale_after,
            locked: false,
        }))
    }
}

struct SqliteMigrationSession {
    conn: PoolConnection<Sqlite>,
    owner: String,
    stale_after: Duration,
    locked: bool,
}

fn migration_error(version: i64, err: sqlx::Error) -> MetadataError {
    MetadataError::Migration {
        version,
        reason: err.to_string(),
    }
}

#[async_trait]
impl MigrationSession for SqliteMigrationSession {
    async fn lock(&mut self) -> MetadataResult<()> {
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(LOCK_SCHEMA)).await?;
        loop {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            let inserted = sqlx::query(
                "INSERT INTO schema_migration_lock (id, owner, acquired_at) VALUES (1, ?, ?) \
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(&self.owner)
            .bind(now)
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
            if inserted == 1 {
                self.locked = true;
                return Ok(());
            }

            let stale_before = now - i64::try_from(self.stale_after.as_secs()).unwrap_or(i64::MAX);
            let taken_over = sqlx::query(
                "DELETE FROM schema_migration_lock WHERE id = 1 AND acquired_at < ?",
            )
            .bind(stale_before)
            .execute(&mut *self.conn)
            .await?
            .rows_affected();
            if taken_over > 0 {
                tracing::warn!(
                    stale_after_secs = self.stale_after.as_secs(),
                    "Removed stale migration lock"
                );
                continue;
            }

            tracing::debug!("Migration lock held elsewhere; waiting");
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&mut self) -> MetadataResult<()> {
        if !self.locked {
            return Ok(());
        }
        sqlx::query("DELETE FROM schema_migration_lock WHERE id = 1 AND owner = ?")
            .bind(&self.owner)
            .execute(&mut *self.conn)
            .await?;
        self.locked = false;
        Ok(())
    }

    async fn ensure_schema(&mut self) -> MetadataResult<()> {
        sqlx::Executor::execute(&mut *self.conn, sqlx::raw_sql(BOOKKEEPING_SCHEMA))
            .await?;
        Ok(())
    }

    async fn applied(&mut self) -> MetadataResult<Vec<AppliedMigrationRow>> {
        let rows = sqlx::query_as::<_, AppliedMigrationRow>(
            "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn recorded_checksums(&mut self) -> MetadataResult<Vec<MigrationChecksumRow>> {
        let rows = sqlx::query_as::<_, MigrationChecksumRow>(
            "SELECT version, filename, checksum FROM schema_migration_checksums ORDER BY version, filename",
        )
        .fetch_all(&mut *self.conn)
        .await?;
        Ok(rows)
    }

    async fn apply(&mut self, migration: &Migration) -> MetadataResult<()> {
        let version = migration.version;
        let mut tx = self.conn.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(migration.up.sql))
            .await
            .map_err(|err| migration_error(version, err))?;
        sqlx::query("INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(&migration.description)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn revert(&mut self, migration: &Migration, down: &MigrationFile) -> MetadataResult<()> {
        let version = migration.version;
        let mut tx = self.conn.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(down.sql))
            .await
            .map_err(|err| migration_error(version, err))?;
        sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM schema_migration_checksums WHERE version = ?")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn store_checksums(&mut self, files: &[&MigrationFile]) -> MetadataResult<()> {
        let mut tx = self.conn.begin().await?;
        for file in files {
            sqlx::query(
                r#"
                INSERT INTO schema_migration_checksums (version, filename, checksum, recorded_at)
                SELECT ?1, ?2, ?3, ?4
                WHERE EXISTS (SELECT 1 FROM schema_migrations WHERE version = ?1)
                ON CONFLICT (version, filename) DO NOTHING
                "#,
            )
            .bind(file.version)
            .bind(file.filename)
            .bind(&file.checksum)
            .bind(OffsetDateTime::now_utc())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
