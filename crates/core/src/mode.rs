//! Node mode and storage backend compatibility.
//!
//! A node's declared [`NodeMode`] is only honored when its [`BackendType`]
//! can back it. Enforcement narrows authority to match capability and never
//! the other way around.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operational role a peer plays in the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Full replica; serves as a canonical source for the datasets it holds.
    Full,
    /// Holds and serves a chosen subset of datasets.
    #[default]
    Selective,
    /// Relays requests without holding data of its own.
    Proxy,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Full => "full",
            NodeMode::Selective => "selective",
            NodeMode::Proxy => "proxy",
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(NodeMode::Full),
            "selective" => Ok(NodeMode::Selective),
            "proxy" => Ok(NodeMode::Proxy),
            _ => Err(Error::InvalidMode(s.to_string())),
        }
    }
}

/// Metadata backend kind, classified by trust level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Embedded SQLite database. Cache-only: never authoritative.
    Sqlite,
    /// PostgreSQL. Authoritative: may act as a canonical source.
    Postgres,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendType::Sqlite => "sqlite",
            BackendType::Postgres => "postgres",
        }
    }

    /// Whether data held by this backend may be distributed as canonical.
    pub fn is_authoritative(&self) -> bool {
        matches!(self, BackendType::Postgres)
    }

    /// Whether the backend can narrow privileges per transaction.
    pub fn supports_role_isolation(&self) -> bool {
        matches!(self, BackendType::Postgres)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendType::Sqlite),
            "postgres" | "postgresql" => Ok(BackendType::Postgres),
            _ => Err(Error::UnknownBackend(s.to_string())),
        }
    }
}

/// Outcome of checking a declared mode against a backend.
///
/// Recomputed on every call; nothing here is persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModeEnforcementResult {
    pub original_mode: NodeMode,
    pub effective_mode: NodeMode,
    /// `None` when the backend name could not be resolved.
    pub backend: Option<BackendType>,
    pub downgraded: bool,
    /// Operator-facing explanation. Empty when there is nothing to report.
    pub warning: String,
    /// Set when the combination is invalid; the node must not start.
    pub error: Option<String>,
    pub is_trusted_storage: bool,
    pub requires_restart: bool,
}

impl ModeEnforcementResult {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Convert an invalid result into an error.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(msg) => Err(Error::InvalidConfig(msg)),
            None => Ok(self),
        }
    }
}

fn downgrade_warning(mode: NodeMode, effective: NodeMode, backend: BackendType) -> String {
    format!(
        "{mode} mode requires the authoritative postgres backend, but this node is configured \
         with {backend}; downgrading to {effective} mode. Configure metadata.type = \"postgres\" \
         to enable {mode} mode."
    )
}

/// Check `mode` against `backend` and compute the mode the node may run in.
pub fn enforce_mode(mode: NodeMode, backend: BackendType) -> ModeEnforcementResult {
    let trusted = backend.is_authoritative();
    let mut result = ModeEnforcementResult {
        original_mode: mode,
        effective_mode: mode,
        backend: Some(backend),
        downgraded: false,
        warning: String::new(),
        error: None,
        is_trusted_storage: trusted,
        requires_restart: false,
    };

    if trusted {
        return result;
    }

    match mode {
        NodeMode::Full => {
            result.effective_mode = NodeMode::Selective;
            result.downgraded = true;
            result.warning = downgrade_warning(mode, NodeMode::Selective, backend);
        }
        NodeMode::Selective => {
            result.warning = format!(
                "selective mode on {backend} operates as a cache-only node; datasets served \
                 from this node are not authoritative. Configure metadata.type = \"postgres\" \
                 to serve as a trusted source."
            );
        }
        NodeMode::Proxy => {}
    }

    result
}

/// Like [`enforce_mode`], for a backend given by name (e.g. from configuration).
///
/// An unrecognized backend yields an invalid result rather than a guess.
pub fn enforce_mode_named(mode: NodeMode, backend: &str) -> ModeEnforcementResult {
    match backend.parse::<BackendType>() {
        Ok(backend) => enforce_mode(mode, backend),
        Err(_) => ModeEnforcementResult {
            original_mode: mode,
            effective_mode: mode,
            backend: None,
            downgraded: false,
            warning: String::new(),
            error: Some(format!(
                "unknown storage backend {backend:?}; expected \"sqlite\" or \"postgres\""
            )),
            is_trusted_storage: false,
            requires_restart: false,
        },
    }
}

/// Validate an operator-requested mode change.
///
/// An unchanged mode is a no-op, even when the declared mode was downgraded
/// at startup. Changing to full mode against a cache-only backend is rejected
/// outright. Any other change is accepted but reported as
/// [`Error::RestartRequired`], since mode is wired into long-lived state.
pub fn validate_mode_change(
    current: NodeMode,
    requested: NodeMode,
    backend: BackendType,
) -> Result<()> {
    if current == requested {
        return Ok(());
    }
    if requested == NodeMode::Full && !backend.is_authoritative() {
        return Err(Error::IncompatibleMode { requested, backend });
    }
    Err(Error::RestartRequired {
        from: current,
        to: requested,
    })
}

/// Storage capabilities a node advertises to its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerStorageMetadata {
    pub backend: BackendType,
    pub mode: NodeMode,
    pub trusted: bool,
    pub authoritative: bool,
    pub can_distribute: bool,
    pub cache_only: bool,
    pub downgraded: bool,
}

/// Derive the advertised capabilities from [`enforce_mode`].
pub fn peer_storage_metadata(backend: BackendType, mode: NodeMode) -> PeerStorageMetadata {
    let enforced = enforce_mode(mode, backend);
    let authoritative = enforced.is_trusted_storage && enforced.effective_mode == NodeMode::Full;
    PeerStorageMetadata {
        backend,
        mode: enforced.effective_mode,
        trusted: enforced.is_trusted_storage,
        authoritative,
        can_distribute: enforced.is_trusted_storage && enforced.effective_mode != NodeMode::Proxy,
        cache_only: !enforced.is_trusted_storage,
        downgraded: enforced.downgraded,
    }
}
