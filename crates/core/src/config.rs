//! Configuration types shared across crates.

use crate::mode::{BackendType, NodeMode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node identity and declared operating mode.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Stable node identifier, recorded in every audit entry.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// Declared mode. May be narrowed at startup to match the backend.
    #[serde(default)]
    pub mode: NodeMode,
    /// Bind address for the health/metrics/capabilities listener.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint (default: true).
    /// SECURITY: restrict this endpoint to scrapers at the network level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_node_id() -> String {
    "trove-node".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            mode: NodeMode::default(),
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database. Cache-only: never authoritative.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database. Authoritative; supports per-transaction roles.
    Postgres {
        /// Connection URL (optional if using individual fields).
        /// Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host (e.g., "localhost" or "db.example.com").
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username. Must be able to `SET ROLE` to every trove_* role.
        username: Option<String>,
        /// Database password.
        /// WARNING: Prefer TROVE_METADATA__PASSWORD env var over storing in config.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// How long an acquisition may wait for a free connection.
        #[serde(default = "default_acquire_timeout_secs")]
        acquire_timeout_secs: u64,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_secs() -> u64 {
    30
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300000) // 5 minutes
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/trove.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Backend selected by this configuration.
    pub fn backend(&self) -> BackendType {
        match self {
            MetadataConfig::Sqlite { .. } => BackendType::Sqlite,
            MetadataConfig::Postgres { .. } => BackendType::Postgres,
        }
    }

    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err("postgres max_connections must be at least 1".to_string());
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    ),
                    (None, Some(_), None) => Err(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    ),
                }
            }
        }
    }
}

/// What to do when an audit write fails after the audited operation ran.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditFailurePolicy {
    /// Log and count the failure; the operation's own result stands.
    #[default]
    Warn,
    /// Report the failure to the caller.
    Fail,
}

/// Audit log configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Record an audit entry for every pooled operation (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Link entries into a hash chain (default: true).
    #[serde(default = "default_true")]
    pub hash_chain: bool,
    /// Behavior when an audit write fails (default: warn).
    #[serde(default)]
    pub failure_policy: AuditFailurePolicy,
}

fn default_true() -> bool {
    true
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hash_chain: true,
            failure_policy: AuditFailurePolicy::default(),
        }
    }
}

/// How a changed checksum on an applied migration is handled.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    /// Abort startup (default).
    #[default]
    Fail,
    /// Log the drift and continue.
    Warn,
    /// Continue silently.
    Ignore,
}

/// Schema migration configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Compare embedded migration checksums against recorded ones (default: true).
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
    /// Policy applied to checksum drift.
    #[serde(default)]
    pub checksum_policy: ChecksumPolicy,
    /// Maximum time to wait for the migration lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

fn default_lock_timeout_secs() -> u64 {
    30
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            verify_checksums: true,
            checksum_policy: ChecksumPolicy::default(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

impl MigrationConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node identity and mode.
    #[serde(default)]
    pub node: NodeConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Audit log configuration.
    #[serde(default)]
    pub audit: AuditConfig,
    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationConfig,
}

impl AppConfig {
    /// Create a test configuration backed by the SQLite file at `path`.
    ///
    /// **For testing only.**
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig {
                node_id: "test-node".to_string(),
                ..NodeConfig::default()
            },
            metadata: MetadataConfig::Sqlite {
                path: path.into(),
                query_timeout_secs: None,
            },
            audit: AuditConfig::default(),
            migrations: MigrationConfig::default(),
        }
    }

    /// Validate the whole configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.node.node_id.trim().is_empty() {
            return Err("node.node_id must not be empty".to_string());
        }
        if self.migrations.lock_timeout_secs == 0 {
            return Err("migrations.lock_timeout_secs must be at least 1".to_string());
        }
        self.metadata.validate()
    }
}
