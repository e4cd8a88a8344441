//! Core domain types shared by the trove storage daemon.
//!
//! This crate is database-free and defines:
//! - The closed set of database roles
//! - Operation and request contexts threaded through every storage call
//! - Node mode / storage backend compatibility enforcement
//! - Configuration types and digests

pub mod config;
pub mod context;
pub mod error;
pub mod hash;
pub mod mode;
pub mod role;

pub use context::{OperationContext, RequestContext};
pub use error::{Error, Result};
pub use hash::{Digest, sha256_hex};
pub use mode::{
    BackendType, ModeEnforcementResult, NodeMode, PeerStorageMetadata, enforce_mode,
    enforce_mode_named, peer_storage_metadata, validate_mode_change,
};
pub use role::DbRole;
