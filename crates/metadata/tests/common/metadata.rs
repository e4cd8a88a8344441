//! Metadata store test utilities.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Postgres as SqlxPostgres, Sqlite};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;
use testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use trove_metadata::{
    MetadataError, MetadataResult, PgPoolSettings, PostgresStore, RolePool, SqliteStore,
    StoreOptions,
};

/// Stable prefix for Docker/container startup failures in Postgres test setup.
/// Tests use this marker to decide whether to skip due to unavailable Docker.
pub const POSTGRES_CONTAINER_START_ERR_PREFIX: &str = "postgres-container-start:";

/// A SQLite-backed test store that cleans up on drop.
#[allow(dead_code)]
pub struct TestMetadata {
    pub store: Arc<SqliteStore>,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestMetadata {
    /// Create a migrated store with default options.
    pub async fn new() -> MetadataResult<Self> {
        Self::with_options(StoreOptions {
            node_id: "test-node".to_string(),
            ..StoreOptions::default()
        })
        .await
    }

    pub async fn with_options(options: StoreOptions) -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, None, options).await?;

        Ok(Self {
            store: Arc::new(store),
            temp_dir,
        })
    }

    /// Get the SQLite connection pool for raw queries.
    pub fn pool(&self) -> &Pool<Sqlite> {
        self.store.pool()
    }

    /// A separate role pool over the same database file with `max` connections.
    pub async fn role_pool(&self, max: u32) -> RolePool<Sqlite> {
        let path = self.temp_dir.path().join("test.db");
        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .expect("valid sqlite url")
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .acquire_timeout(std::time::Duration::from_secs(10))
            .connect_with(opts)
            .await
            .expect("Failed to open sqlite pool");
        RolePool::new(pool, "test-node")
    }

    /// Number of rows in `table`.
    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.pool())
            .await
            .expect("count query")
    }

    /// Whether a table named `name` exists.
    pub async fn table_exists(&self, name: &str) -> bool {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
        )
        .bind(name)
        .fetch_one(self.pool())
        .await
        .expect("sqlite_master query")
    }
}

/// PostgreSQL test metadata store wrapper that manages a testcontainer.
#[allow(dead_code)]
pub struct PostgresTestMetadata {
    pub store: Arc<PostgresStore>,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl PostgresTestMetadata {
    /// Create a new PostgreSQL test store with a testcontainer.
    pub async fn new() -> MetadataResult<Self> {
        Self::with_settings(PgPoolSettings {
            max_connections: 5,
            ..PgPoolSettings::default()
        })
        .await
    }

    pub async fn with_settings(settings: PgPoolSettings) -> MetadataResult<Self> {
        // Start PostgreSQL container
        let container = Postgres::default()
            .with_tag("15-alpine")
            .start()
            .await
            .map_err(|e| {
                MetadataError::Internal(format!(
                    "{} Failed to start PostgreSQL container: {e}",
                    POSTGRES_CONTAINER_START_ERR_PREFIX
                ))
            })?;

        let host = container.get_host().await.expect("Failed to get host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get port");

        // Default credentials from testcontainers-modules postgres
        let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

        let options = StoreOptions {
            node_id: "pg-test-node".to_string(),
            ..StoreOptions::default()
        };
        let store = PostgresStore::from_url(&url, settings, options).await?;

        Ok(Self {
            store: Arc::new(store),
            _container: container,
        })
    }

    /// Get the PostgreSQL connection pool for raw queries.
    pub fn pool(&self) -> &Pool<SqlxPostgres> {
        self.store.pool()
    }
}

/// Try to create a PostgreSQL test store, skipping if Docker is unavailable
/// or SKIP_POSTGRES_TESTS is set.
///
/// Only container-start failures (Docker unavailable) cause a skip.
/// Schema, migration, or connection errors still panic so real regressions
/// are not silently swallowed.
#[allow(dead_code)]
pub async fn postgres_or_skip_with(settings: PgPoolSettings) -> Option<PostgresTestMetadata> {
    if std::env::var("SKIP_POSTGRES_TESTS").is_ok() {
        return None;
    }
    match PostgresTestMetadata::with_settings(settings).await {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            let msg = err.to_string();
            if msg.contains(POSTGRES_CONTAINER_START_ERR_PREFIX) {
                eprintln!("Skipping PostgreSQL test (Docker unavailable): {msg}");
                None
            } else {
                panic!("PostgreSQL test setup failed: {msg}");
            }
        }
    }
}

#[allow(dead_code)]
pub async fn postgres_or_skip() -> Option<PostgresTestMetadata> {
    postgres_or_skip_with(PgPoolSettings {
        max_connections: 5,
        ..PgPoolSettings::default()
    })
    .await
}
