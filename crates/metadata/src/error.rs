//! Metadata store error types.

use thiserror::Error;
use trove_core::DbRole;

/// Stable classification of [`MetadataError`] for callers to branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidInput,
    NotAuthoritative,
    PoolClosed,
    AcquireTimeout,
    InvalidRole,
    MissingOperationContext,
    RoleSwitchFailed,
    Cancelled,
    Integrity,
    Migration,
    Config,
    Database,
    Internal,
}

/// Format drifted migrations for display, capping at MAX_DISPLAYED to prevent log bloat.
fn format_drift(files: &[String]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if files.len() <= MAX_DISPLAYED {
        format!("{:?}", files)
    } else {
        let sample: Vec<_> = files.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, files.len() - MAX_DISPLAYED)
    }
}

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not authoritative: {0}")]
    NotAuthoritative(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("timed out waiting for a pooled connection")]
    AcquireTimeout,

    #[error("invalid database role: {0:?}")]
    InvalidRole(String),

    #[error("no operation context attached to request")]
    MissingOperationContext,

    #[error("failed to switch transaction to role {role}: {source}")]
    RoleSwitchFailed {
        role: DbRole,
        #[source]
        source: sqlx::Error,
    },

    #[error("transaction already committed or rolled back")]
    TransactionClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("audit write failed after operation was {outcome}: {reason}")]
    AuditWrite {
        outcome: &'static str,
        reason: String,
    },

    #[error("{0} is append-only")]
    AppendOnly(String),

    #[error("checksum mismatch in {} applied migrations: {}", .files.len(), format_drift(.files))]
    ChecksumMismatch { files: Vec<String> },

    #[error("timed out after {0:?} waiting for the migration lock")]
    MigrationLockTimeout(std::time::Duration),

    #[error("migration {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Stable kind for branching.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::NotFound(_) => ErrorKind::NotFound,
            MetadataError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            MetadataError::InvalidInput(_) => ErrorKind::InvalidInput,
            MetadataError::NotAuthoritative(_) => ErrorKind::NotAuthoritative,
            MetadataError::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            MetadataError::Database(sqlx::Error::PoolClosed) => ErrorKind::PoolClosed,
            MetadataError::Database(sqlx::Error::PoolTimedOut) => ErrorKind::AcquireTimeout,
            MetadataError::Database(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                ErrorKind::AlreadyExists
            }
            MetadataError::Database(_) | MetadataError::Io(_) => ErrorKind::Database,
            MetadataError::PoolClosed => ErrorKind::PoolClosed,
            MetadataError::AcquireTimeout => ErrorKind::AcquireTimeout,
            MetadataError::InvalidRole(_) => ErrorKind::InvalidRole,
            MetadataError::MissingOperationContext => ErrorKind::MissingOperationContext,
            MetadataError::RoleSwitchFailed { .. } => ErrorKind::RoleSwitchFailed,
            MetadataError::Cancelled | MetadataError::DeadlineExceeded => ErrorKind::Cancelled,
            MetadataError::AuditWrite { .. } | MetadataError::AppendOnly(_) => {
                ErrorKind::Integrity
            }
            MetadataError::ChecksumMismatch { .. }
            | MetadataError::MigrationLockTimeout(_)
            | MetadataError::Migration { .. } => ErrorKind::Migration,
            MetadataError::Config(_) => ErrorKind::Config,
            MetadataError::TransactionClosed | MetadataError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the failure means infrastructure is unavailable, as opposed
    /// to this particular request being wrong.
    pub fn is_resource_error(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::PoolClosed | ErrorKind::AcquireTimeout
        ) || matches!(self, MetadataError::MigrationLockTimeout(_))
    }
}

impl From<trove_core::Error> for MetadataError {
    fn from(err: trove_core::Error) -> Self {
        match err {
            trove_core::Error::InvalidRole(role) => MetadataError::InvalidRole(role),
            trove_core::Error::Cancelled => MetadataError::Cancelled,
            trove_core::Error::DeadlineExceeded => MetadataError::DeadlineExceeded,
            trove_core::Error::IncompatibleMode { .. } => {
                MetadataError::NotAuthoritative(err.to_string())
            }
            other => MetadataError::Config(other.to_string()),
        }
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
