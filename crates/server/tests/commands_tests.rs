//! Admin subcommand tests against a real SQLite store.

mod common;

use common::TestServer;
use trove_core::{DbRole, OperationContext};
use trove_metadata::audit::BreakReason;
use trove_metadata::models::AuditEntry;
use trove_metadata::{AuditRepo, MetadataError};
use trove_server::commands;

async fn log_entries(server: &TestServer, n: u64) -> Vec<AuditEntry> {
    let op = OperationContext::new(DbRole::Scrape, "commands-test");
    let mut logged = Vec::new();
    for i in 0..n {
        let entry = AuditEntry::new("test-node", &op, "insert", "datasets").with_rows_affected(i);
        logged.push(server.sqlite().log(entry).await.unwrap());
    }
    logged
}

#[tokio::test]
async fn test_verify_audit_whole_log() {
    let server = TestServer::new().await;
    let logged = log_entries(&server, 4).await;

    let verification = commands::verify_audit(server.metadata().as_ref(), None, None)
        .await
        .unwrap();

    assert!(verification.intact);
    assert_eq!(verification.entries, 4);
    assert_eq!(verification.to_id, logged[3].id);
    assert!(verification.first_break.is_none());
}

#[tokio::test]
async fn test_verify_audit_reports_first_break() {
    let server = TestServer::new().await;
    let logged = log_entries(&server, 4).await;

    let pool = server.sqlite().pool();
    sqlx::query("DROP TRIGGER audit_log_no_update")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("UPDATE audit_log SET action = 'delete' WHERE id = ?")
        .bind(logged[1].id)
        .execute(pool)
        .await
        .unwrap();

    let verification = commands::verify_audit(server.metadata().as_ref(), Some(logged[0].id), None)
        .await
        .unwrap();

    assert!(!verification.intact);
    let chain_break = verification.first_break.clone().unwrap();
    assert_eq!(chain_break.entry_id, logged[1].id);
    assert_eq!(chain_break.reason, BreakReason::Digest);
}

#[tokio::test]
async fn test_verify_audit_rejects_inverted_range() {
    let server = TestServer::new().await;
    let err = commands::verify_audit(server.metadata().as_ref(), Some(10), Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidInput(_)));
}

#[tokio::test]
async fn test_render_listed_migrations() {
    let server = TestServer::new().await;
    let infos = server.metadata().list_migrations().await.unwrap();
    assert_eq!(infos.len(), 2);

    let rendered = commands::render_migrations(&infos);
    assert!(rendered.contains("0001"));
    assert!(rendered.contains("0002"));
}
