//! Error types for the core domain.

use crate::mode::{BackendType, NodeMode};
use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid database role: {0:?}")]
    InvalidRole(String),

    #[error("invalid node mode: {0:?}")]
    InvalidMode(String),

    #[error("unknown storage backend: {0:?}")]
    UnknownBackend(String),

    #[error(
        "{requested} mode requires the authoritative postgres backend, but this node uses {backend}; \
         configure metadata.type = \"postgres\" to enable {requested} mode"
    )]
    IncompatibleMode {
        requested: NodeMode,
        backend: BackendType,
    },

    #[error("changing node mode from {from} to {to} requires a restart")]
    RestartRequired { from: NodeMode, to: NodeMode },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
