//! PostgreSQL migration sessions.
//!
//! The lock is a session-level advisory lock on a connection detached from
//! the pool, so it is released when the session ends even if unlocking
//! never runs.

use super::{Migration, MigrationDriver, MigrationFile, MigrationSession};
use crate::error::{MetadataError, MetadataResult};
use crate::models::{AppliedMigrationRow, MigrationChecksumRow};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool};
use std::time::Duration;
use time::OffsetDateTime;

/// Advisory lock key for migration runs ("trove:migrate").
const MIGRATION_LOCK_KEY: i64 = 0x7472_6f76_656d_6967;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

const BOOKKEEPING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version BIGINT PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE TABLE IF NOT EXISTS schema_migration_checksums (
    version BIGINT NOT NULL,
    filename TEXT NOT NULL,
    checksum TEXT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (version, filename)
);
"#;

pub struct PgMigrationDriver {
    pool: PgPool,
}

impl PgMigrationDriver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationDriver for PgMigrationDriver {
    async fn session(&self) -> MetadataResult<Box<dyn MigrationSession>> {
        let conn = self.pool.acquire().await?.detach();
        Ok(Box::new(PgMigrationSession {
            conn,
            locked: false,
        }))
    }
}

struct PgMigrationSession {
    conn: PgConnection,
    locked: bool,
}

fn migration_error(version: i64, err: sqlx::Error) -> MetadataError {
    MetadataError::Migration {
        version,
        reason: err.to_string(),
    }
}

#[async_trait]
impl MigrationSession for PgMigrationSession {
    async fn lock(&mut self) -> MetadataResult<()> {
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(MIGRATION_LOCK_KEY)
                .fetch_one(&mut self.conn)
                .await?;
            if acquired {
                self.locked = true;
                return Ok(());
            }
            tracing::debug!("Migration lock held elsewhere; waiting");
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&mut self) -> MetadataResult<()> {
        if !self.locked {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut self.conn)
            .await?;
        self.locked = false;
        Ok(())
    }

    async fn ensure_schema(&mut self) -> MetadataResult<()> {
        sqlx::Executor::execute(&mut self.conn, sqlx::raw_sql(BOOKKEEPING_SCHEMA))
            .await?;
        Ok(())
    }

    async fn applied(&mut self) -> MetadataResult<Vec<AppliedMigrationRow>> {
        let rows = sqlx::query_as::<_, AppliedMigrationRow>(
            "SELECT version, description, applied_at FROM schema_migrations ORDER BY version",
        )
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows)
    }

    async fn recorded_checksums(&mut self) -> MetadataResult<Vec<MigrationChecksumRow>> {
        let rows = sqlx::query_as::<_, MigrationChecksumRow>(
            "SELECT version, filename, checksum FROM schema_migration_checksums ORDER BY version, filename",
        )
        .fetch_all(&mut self.conn)
        .await?;
        Ok(rows)
    }

    async fn apply(&mut self, migration: &Migration) -> MetadataResult<()> {
        let version = migration.version;
        let mut tx = self.conn.begin().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(migration.up.sql))
            .await
            .map_err(|err| migration_error(version, err))?;
        sqlx::query(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES ($1, $2, $3)",
        )
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
        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM schema_migration_checksums WHERE version = $1")
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
                SELECT $1, $2, $3, $4
                WHERE EXISTS (SELECT 1 FROM schema_migrations WHERE version = $1)
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
