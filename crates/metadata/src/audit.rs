//! Audit hash chain.
//!
//! Every entry commits to its predecessor by embedding the predecessor's
//! `entry_hash` as its own `prev_hash`, and to itself through `entry_hash`,
//! a SHA-256 over a fixed, pipe-joined rendering of its identifying fields:
//!
//! ```text
//! timestamp|node_id|operation_id|role|action|table|source|rows|duration_ms|prev_hash|job_id|query_hash
//! ```
//!
//! The timestamp is rendered in UTC with microsecond precision
//! (`2024-01-02T03:04:05.000006Z`); absent `job_id`/`query_hash` render as
//! empty strings. The first entry in a log has an empty `prev_hash`.
//!
//! `actor`, `metadata` and the flag columns are annotations outside the
//! digest; the append-only triggers are what protect them.

use crate::models::AuditEntry;
use time::{OffsetDateTime, UtcOffset};
use trove_core::sha256_hex;

/// `prev_hash` of the first entry in a log.
pub const GENESIS_HASH: &str = "";

/// Advisory lock key serializing chain appends on PostgreSQL ("trove:audit").
pub(crate) const AUDIT_CHAIN_LOCK_KEY: i64 = 0x7472_6f76_6561_7564;

/// Normalize a timestamp to the precision both backends persist.
pub fn truncate_timestamp(ts: OffsetDateTime) -> OffsetDateTime {
    let ts = ts.to_offset(UtcOffset::UTC);
    ts.replace_nanosecond(ts.microsecond() * 1_000).unwrap_or(ts)
}

/// Fixed-width UTC rendering with microseconds.
///
/// Used both in the canonical string and as the SQLite column value, where
/// it keeps lexical order equal to time order.
pub fn format_timestamp(ts: OffsetDateTime) -> String {
    let ts = truncate_timestamp(ts);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}Z",
        ts.year(),
        u8::from(ts.month()),
        ts.day(),
        ts.hour(),
        ts.minute(),
        ts.second(),
        ts.microsecond(),
    )
}

/// The string an entry's hash is computed over.
pub fn canonical_string(entry: &AuditEntry) -> String {
    [
        format_timestamp(entry.timestamp),
        entry.node_id.clone(),
        entry.operation_id.clone(),
        entry.role_used.clone(),
        entry.action.clone(),
        entry.table_name.clone(),
        entry.source_component.clone(),
        entry.rows_affected.to_string(),
        entry.duration_ms.to_string(),
        entry.prev_hash.clone(),
        entry.job_id.clone().unwrap_or_default(),
        entry.query_hash.clone().unwrap_or_default(),
    ]
    .join("|")
}

/// Hex SHA-256 of the entry's canonical string.
pub fn compute_entry_hash(entry: &AuditEntry) -> String {
    sha256_hex(canonical_string(entry).as_bytes())
}

/// Link `entry` after `prev_hash` and compute its hash.
pub fn seal(entry: &mut AuditEntry, prev_hash: &str) {
    entry.timestamp = truncate_timestamp(entry.timestamp);
    entry.prev_hash = prev_hash.to_string();
    entry.entry_hash = compute_entry_hash(entry);
}

/// Why verification stopped at an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakReason {
    /// `prev_hash` does not match the predecessor's `entry_hash`.
    Linkage,
    /// `entry_hash` does not match the entry's own fields.
    Digest,
}

/// First inconsistent entry found by [`find_chain_break`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainBreak {
    pub entry_id: i64,
    pub reason: BreakReason,
}

/// Walk `entries` (ascending id) and report the first one that does not
/// follow from `anchor`, the `entry_hash` of the row preceding the range.
pub fn find_chain_break(entries: &[AuditEntry], anchor: &str) -> Option<ChainBreak> {
    let mut expected_prev = anchor;
    for entry in entries {
        if entry.prev_hash != expected_prev {
            return Some(ChainBreak {
                entry_id: entry.id,
                reason: BreakReason::Linkage,
            });
        }
        if entry.entry_hash != compute_entry_hash(entry) {
            return Some(ChainBreak {
                entry_id: entry.id,
                reason: BreakReason::Digest,
            });
        }
        expected_prev = &entry.entry_hash;
    }
    None
}

/// Entries read per round trip when walking a range of the chain.
pub const VERIFY_PAGE_SIZE: i64 = 500;

/// Outcome of walking a range of the chain page by page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainWalk {
    /// Entries checked, including the broken one.
    pub entries: usize,
    /// Id of the last entry checked.
    pub last_id: Option<i64>,
    pub first_break: Option<ChainBreak>,
}

impl ChainWalk {
    pub fn is_intact(&self) -> bool {
        self.first_break.is_none()
    }
}

/// Whether `err` is the storage engine refusing to modify the audit log.
pub(crate) fn is_append_only_rejection(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.message().contains("append-only"),
        _ => false,
    }
}

/// Columns selected into [`AuditEntry`], in declaration order.
pub(crate) const AUDIT_COLUMNS: &str = "id, timestamp, node_id, operation_id, job_id, role_used, \
     action, table_name, rows_affected, duration_ms, source_component, actor, query_hash, \
     metadata, prev_hash, entry_hash, break_glass, rate_limited, suspicious, alert_triggered";
