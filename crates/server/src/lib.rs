//! The trove storage daemon.
//!
//! This crate provides:
//! - Startup bootstrap: configuration loading, mode gating, store opening
//! - Admin subcommands for migrations, audit verification and mode checks
//! - A small HTTP surface: health, storage capabilities and Prometheus metrics

pub mod bootstrap;
pub mod commands;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
