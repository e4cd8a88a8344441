//! Database permission tiers.
//!
//! A [`DbRole`] is selected per operation and applied to a single
//! transaction. The set is closed: the database identifiers returned by
//! [`DbRole::db_role_name`] are the only role names ever interpolated into SQL.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fixed database permission tier.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DbRole {
    /// Full schema and data access. Reserved for administrative tooling.
    Admin,
    /// Ingests datasets discovered by scrapers.
    Scrape,
    /// Serves read queries for peers and clients.
    Query,
    /// Rewrites dataset records in place.
    Transform,
    /// Appends to and reads the audit log.
    Audit,
    /// Least privilege: reads dataset records only.
    #[default]
    ReadOnly,
}

impl DbRole {
    /// Every role, in declaration order.
    pub const ALL: [DbRole; 6] = [
        DbRole::Admin,
        DbRole::Scrape,
        DbRole::Query,
        DbRole::Transform,
        DbRole::Audit,
        DbRole::ReadOnly,
    ];

    /// Short name used in configuration, logs and audit entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            DbRole::Admin => "admin",
            DbRole::Scrape => "scrape",
            DbRole::Query => "query",
            DbRole::Transform => "transform",
            DbRole::Audit => "audit",
            DbRole::ReadOnly => "readonly",
        }
    }

    /// Database-side role identifier.
    pub fn db_role_name(&self) -> &'static str {
        match self {
            DbRole::Admin => "trove_admin",
            DbRole::Scrape => "trove_scrape",
            DbRole::Query => "trove_query",
            DbRole::Transform => "trove_transform",
            DbRole::Audit => "trove_audit",
            DbRole::ReadOnly => "trove_readonly",
        }
    }

    /// Position of the role in [`DbRole::ALL`].
    pub fn index(&self) -> usize {
        match self {
            DbRole::Admin => 0,
            DbRole::Scrape => 1,
            DbRole::Query => 2,
            DbRole::Transform => 3,
            DbRole::Audit => 4,
            DbRole::ReadOnly => 5,
        }
    }

    /// Whether the role may modify dataset tables.
    pub fn can_write(&self) -> bool {
        matches!(self, DbRole::Admin | DbRole::Scrape | DbRole::Transform)
    }
}

impl fmt::Display for DbRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "admin" => Ok(DbRole::Admin),
            "scrape" => Ok(DbRole::Scrape),
            "query" => Ok(DbRole::Query),
            "transform" => Ok(DbRole::Transform),
            "audit" => Ok(DbRole::Audit),
            "readonly" | "read_only" => Ok(DbRole::ReadOnly),
            _ => Err(crate::Error::InvalidRole(s.to_string())),
        }
    }
}
