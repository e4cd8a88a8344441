//! Database models mapping to the metadata schema.

use serde::Serialize;
use sqlx::FromRow;
use sqlx::types::Json;
use time::OffsetDateTime;
use trove_core::{DbRole, OperationContext};

// =============================================================================
// Audit log
// =============================================================================

/// One row of the append-only audit log.
///
/// `id`, `prev_hash` and `entry_hash` are assigned on write; an entry built
/// with [`AuditEntry::new`] leaves them zero/empty.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: OffsetDateTime,
    pub node_id: String,
    pub operation_id: String,
    pub job_id: Option<String>,
    pub role_used: String,
    pub action: String,
    pub table_name: String,
    pub rows_affected: i64,
    pub duration_ms: i64,
    pub source_component: String,
    pub actor: String,
    pub query_hash: Option<String>,
    pub metadata: Json<serde_json::Value>,
    pub prev_hash: String,
    pub entry_hash: String,
    pub break_glass: bool,
    pub rate_limited: bool,
    pub suspicious: bool,
    pub alert_triggered: bool,
}

impl AuditEntry {
    /// Build an unsealed entry attributed to `op`.
    pub fn new(
        node_id: impl Into<String>,
        op: &OperationContext,
        action: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        let metadata = op
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        Self {
            id: 0,
            timestamp: OffsetDateTime::now_utc(),
            node_id: node_id.into(),
            operation_id: op.operation_id.to_string(),
            job_id: op.job_id.map(|id| id.to_string()),
            role_used: op.role.as_str().to_string(),
            action: action.into(),
            table_name: table_name.into(),
            rows_affected: 0,
            duration_ms: 0,
            source_component: op.source.clone(),
            actor: op.actor.clone(),
            query_hash: None,
            metadata: Json(serde_json::Value::Object(metadata)),
            prev_hash: String::new(),
            entry_hash: String::new(),
            break_glass: false,
            rate_limited: false,
            suspicious: false,
            alert_triggered: false,
        }
    }

    /// Record the role actually granted, which may differ from the context's.
    pub fn with_role(mut self, role: DbRole) -> Self {
        self.role_used = role.as_str().to_string();
        self
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = i64::try_from(rows).unwrap_or(i64::MAX);
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn with_query_hash(mut self, query_hash: impl Into<String>) -> Self {
        self.query_hash = Some(query_hash.into());
        self
    }

    /// Add a key to the metadata object.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        if let serde_json::Value::Object(map) = &mut self.metadata.0 {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Whether the write path still has to compute the chain hashes.
    pub fn is_sealed(&self) -> bool {
        !self.entry_hash.is_empty()
    }
}

// =============================================================================
// Schema migrations
// =============================================================================

/// Applied migration record.
#[derive(Debug, Clone, FromRow)]
pub struct AppliedMigrationRow {
    pub version: i64,
    pub description: String,
    pub applied_at: OffsetDateTime,
}

/// Recorded checksum of a migration file.
#[derive(Debug, Clone, FromRow)]
pub struct MigrationChecksumRow {
    pub version: i64,
    pub filename: String,
    pub checksum: String,
}

/// Status of one known migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub applied: bool,
    pub applied_at: Option<OffsetDateTime>,
    /// Checksum of the embedded `up` file.
    pub checksum: String,
}
