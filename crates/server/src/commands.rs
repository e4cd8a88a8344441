//! Admin subcommands: migrations, audit verification and mode checks.

use std::fmt::Write;
use trove_core::{ModeEnforcementResult, NodeMode, enforce_mode_named};
use trove_metadata::audit::{BreakReason, ChainBreak};
use trove_metadata::models::MigrationInfo;
use trove_metadata::{AuditRepo, MetadataResult, MetadataStore};

/// Render migrations as one line per version.
pub fn render_migrations(infos: &[MigrationInfo]) -> String {
    let mut out = String::new();
    for info in infos {
        let applied_at = info
            .applied_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_string());
        let state = if info.applied { "applied" } else { "pending" };
        let _ = writeln!(
            out,
            "{:04}  {:<8} {:<40} {}",
            info.version, state, applied_at, info.description
        );
    }
    out
}

/// Result of `troved audit verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerification {
    pub from_id: i64,
    pub to_id: i64,
    pub entries: usize,
    pub intact: bool,
    /// First inconsistent entry, when the range is broken.
    pub first_break: Option<ChainBreak>,
}

impl AuditVerification {
    pub fn summary(&self) -> String {
        match &self.first_break {
            None => format!(
                "audit chain intact: {} entries in {}..={}",
                self.entries, self.from_id, self.to_id
            ),
            Some(chain_break) => {
                let reason = match chain_break.reason {
                    BreakReason::Linkage => "prev_hash does not match its predecessor",
                    BreakReason::Digest => "entry_hash does not match its contents",
                };
                format!(
                    "audit chain broken at entry {}: {reason}",
                    chain_break.entry_id
                )
            }
        }
    }
}

/// Verify the audit chain over `from..=to` (defaults: the whole log).
pub async fn verify_audit(
    store: &dyn MetadataStore,
    from: Option<i64>,
    to: Option<i64>,
) -> MetadataResult<AuditVerification> {
    let from_id = from.unwrap_or(1);
    let to_id = to.unwrap_or(i64::MAX);
    let walk = store.walk_chain(from_id, to_id).await?;

    Ok(AuditVerification {
        from_id,
        to_id: walk.last_id.unwrap_or(to_id),
        entries: walk.entries,
        intact: walk.is_intact(),
        first_break: walk.first_break,
    })
}

/// Evaluate a declared mode against a backend name.
pub fn check_mode(mode: &str, backend: &str) -> trove_core::Result<ModeEnforcementResult> {
    let mode: NodeMode = mode.parse()?;
    enforce_mode_named(mode, backend).into_result()
}

/// Human-readable report of a mode check.
pub fn render_mode(result: &ModeEnforcementResult) -> String {
    let mut out = format!(
        "requested: {}\neffective: {}\ntrusted storage: {}\n",
        result.original_mode, result.effective_mode, result.is_trusted_storage
    );
    if result.downgraded {
        out.push_str("downgraded: yes\n");
    }
    if !result.warning.is_empty() {
        let _ = writeln!(out, "note: {}", result.warning);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_core::BackendType;

    #[test]
    fn test_check_mode_downgrade() {
        let result = check_mode("full", "sqlite").unwrap();
        assert!(result.downgraded);
        assert_eq!(result.effective_mode, NodeMode::Selective);
        let report = render_mode(&result);
        assert!(report.contains("effective: selective"));
        assert!(report.contains("downgraded: yes"));
    }

    #[test]
    fn test_check_mode_authoritative() {
        let result = check_mode("FULL", "postgresql").unwrap();
        assert!(!result.downgraded);
        assert_eq!(result.backend, Some(BackendType::Postgres));
        assert!(result.is_trusted_storage);
    }

    #[test]
    fn test_check_mode_rejects_unknown_inputs() {
        assert!(matches!(
            check_mode("turbo", "sqlite"),
            Err(trove_core::Error::InvalidMode(_))
        ));
        assert!(matches!(
            check_mode("full", "mysql"),
            Err(trove_core::Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_render_migrations() {
        let infos = vec![
            MigrationInfo {
                version: 1,
                description: "audit log".to_string(),
                applied: true,
                applied_at: Some(time::macros::datetime!(2024-01-02 03:04:05 UTC)),
                checksum: String::new(),
            },
            MigrationInfo {
                version: 2,
                description: "datasets".to_string(),
                applied: false,
                applied_at: None,
                checksum: String::new(),
            },
        ];
        let rendered = render_migrations(&infos);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0001  applied"));
        assert!(lines[0].ends_with("audit log"));
        assert!(lines[1].starts_with("0002  pending"));
    }
}
