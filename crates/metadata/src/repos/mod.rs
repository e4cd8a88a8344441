//! Repository traits for metadata operations.

pub mod audit;

pub use audit::AuditRepo;
