//! Migration runner behavior on SQLite: drift, locking, rollback.

mod common;

use common::TestMetadata;
use std::time::Duration;
use time::OffsetDateTime;
use trove_core::RequestContext;
use trove_core::config::{ChecksumPolicy, MigrationConfig};
use trove_core::sha256_hex;
use trove_metadata::migrations::{Migration, MigrationManager, SQLITE_MIGRATIONS};
use trove_metadata::{MetadataError, MetadataStore, StoreOptions};

const WIDGETS_V1: &[(&str, &str)] = &[
    ("0100_widgets.up.sql", "CREATE TABLE widgets (id INTEGER PRIMARY KEY);"),
    ("0100_widgets.down.sql", "DROP TABLE widgets;"),
];

const WIDGETS_EDITED_AND_GADGETS: &[(&str, &str)] = &[
    (
        "0100_widgets.up.sql",
        "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT);",
    ),
    ("0100_widgets.down.sql", "DROP TABLE widgets;"),
    ("0101_gadgets.up.sql", "CREATE TABLE gadgets (id INTEGER PRIMARY KEY);"),
];

fn manager(
    metadata: &TestMetadata,
    files: &[(&'static str, &'static str)],
    config: MigrationConfig,
) -> MigrationManager {
    MigrationManager::new(
        metadata.store.migration_manager().driver().clone(),
        Migration::from_files(files).unwrap(),
        config,
    )
}

fn unmigrated() -> StoreOptions {
    StoreOptions {
        auto_migrate: false,
        ..StoreOptions::default()
    }
}

#[tokio::test]
async fn test_list_then_apply_embedded_migrations() {
    let metadata = TestMetadata::with_options(unmigrated()).await.unwrap();

    let before = metadata.store.list_migrations().await.unwrap();
    assert_eq!(before.len(), 2);
    assert!(before.iter().all(|m| !m.applied && m.applied_at.is_none()));
    assert!(!metadata.table_exists("audit_log").await);

    let report = metadata.store.migrate().await.unwrap();
    assert_eq!(report.applied, vec![1, 2]);
    assert!(report.drift.is_empty());

    let after = metadata.store.list_migrations().await.unwrap();
    assert!(after.iter().all(|m| m.applied && m.applied_at.is_some()));
    assert_eq!(after[1].description, "datasets");
    assert_eq!(after[0].checksum, sha256_hex(SQLITE_MIGRATIONS[0].1.as_bytes()));

    // Checksums for both directions of each applied version are recorded.
    assert_eq!(metadata.count("schema_migration_checksums").await, 4);
}

#[tokio::test]
async fn test_checksum_drift_fails_before_applying_pending() {
    let metadata = TestMetadata::new().await.unwrap();
    let ctx = RequestContext::new();

    let report = manager(&metadata, WIDGETS_V1, MigrationConfig::default())
        .up(&ctx)
        .await
        .unwrap();
    assert_eq!(report.applied, vec![100]);

    let err = manager(
        &metadata,
        WIDGETS_EDITED_AND_GADGETS,
        MigrationConfig::default(),
    )
    .up(&ctx)
    .await
    .unwrap_err();

    match err {
        MetadataError::ChecksumMismatch { files } => {
            assert_eq!(files, vec!["0100_widgets.up.sql".to_string()]);
        }
        other => panic!("expected checksum mismatch, got {other:?}"),
    }
    assert!(!metadata.table_exists("gadgets").await);
    // The failed run released its lock.
    assert_eq!(metadata.count("schema_migration_lock").await, 0);
}

#[tokio::test]
async fn test_checksum_drift_warn_proceeds_and_stays_visible() {
    let metadata = TestMetadata::new().await.unwrap();
    let ctx = RequestContext::new();
    manager(&metadata, WIDGETS_V1, MigrationConfig::default())
        .up(&ctx)
        .await
        .unwrap();

    let warn = MigrationConfig {
        checksum_policy: ChecksumPolicy::Warn,
        ..MigrationConfig::default()
    };
    let edited = manager(&metadata, WIDGETS_EDITED_AND_GADGETS, warn);

    let report = edited.up(&ctx).await.unwrap();
    assert_eq!(report.applied, vec![101]);
    assert_eq!(report.drift, vec!["0100_widgets.up.sql".to_string()]);
    assert!(metadata.table_exists("gadgets").await);

    // The originally recorded checksum is kept, so the drift is reported again.
    let again = edited.up(&ctx).await.unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(again.drift, vec!["0100_widgets.up.sql".to_string()]);
}

#[tokio::test]
async fn test_checksum_verification_disabled() {
    let metadata = TestMetadata::new().await.unwrap();
    let ctx = RequestContext::new();
    manager(&metadata, WIDGETS_V1, MigrationConfig::default())
        .up(&ctx)
        .await
        .unwrap();

    let unchecked = MigrationConfig {
        verify_checksums: false,
        ..MigrationConfig::default()
    };
    let report = manager(&metadata, WIDGETS_EDITED_AND_GADGETS, unchecked)
        .up(&ctx)
        .await
        .unwrap();
    assert_eq!(report.applied, vec![101]);
    assert!(report.drift.is_empty());
}

#[tokio::test]
async fn test_failing_migration_stops_the_run() {
    let metadata = TestMetadata::new().await.unwrap();
    let files: &[(&str, &str)] = &[
        ("0200_broken.up.sql", "CREATE TABLE broken ("),
        ("0201_after.up.sql", "CREATE TABLE after_broken (id INTEGER);"),
    ];

    let err = manager(&metadata, files, MigrationConfig::default())
        .up(&RequestContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, MetadataError::Migration { version: 200, .. }));
    assert!(!metadata.table_exists("broken").await);
    assert!(!metadata.table_exists("after_broken").await);
    assert_eq!(metadata.count("schema_migration_lock").await, 0);

    let versions: Vec<i64> = metadata
        .store
        .list_migrations()
        .await
        .unwrap()
        .iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_down_reverts_latest_version() {
    let metadata = TestMetadata::new().await.unwrap();
    assert!(metadata.table_exists("datasets").await);

    assert_eq!(metadata.store.migrate_down().await.unwrap(), Some(2));
    assert!(!metadata.table_exists("datasets").await);
    assert!(metadata.table_exists("audit_log").await);

    let listed = metadata.store.list_migrations().await.unwrap();
    assert!(listed[0].applied);
    assert!(!listed[1].applied);

    assert_eq!(metadata.store.migrate().await.unwrap().applied, vec![2]);
    assert!(metadata.table_exists("datasets").await);
}

#[tokio::test]
async fn test_down_with_nothing_applied() {
    let metadata = TestMetadata::with_options(unmigrated()).await.unwrap();
    assert_eq!(metadata.store.migrate_down().await.unwrap(), None);
}

#[tokio::test]
async fn test_down_without_down_file_fails() {
    let metadata = TestMetadata::new().await.unwrap();
    let files: &[(&str, &str)] = &[("0300_one_way.up.sql", "CREATE TABLE one_way (id INTEGER);")];
    let one_way = manager(&metadata, files, MigrationConfig::default());
    let ctx = RequestContext::new();
    one_way.up(&ctx).await.unwrap();

    let err = one_way.down(&ctx).await.unwrap_err();
    assert!(matches!(err, MetadataError::Migration { version: 300, .. }));
    assert!(metadata.table_exists("one_way").await);
}

#[tokio::test]
async fn test_list_includes_versions_unknown_to_this_build() {
    let metadata = TestMetadata::new().await.unwrap();
    manager(&metadata, WIDGETS_V1, MigrationConfig::default())
        .up(&RequestContext::new())
        .await
        .unwrap();

    let listed = metadata.store.list_migrations().await.unwrap();
    let versions: Vec<i64> = listed.iter().map(|m| m.version).collect();
    assert_eq!(versions, vec![1, 2, 100]);
    assert!(listed[2].applied);
    assert!(listed[2].checksum.is_empty());
}

async fn plant_lock(metadata: &TestMetadata, acquired_at: i64) {
    sqlx::query("INSERT INTO schema_migration_lock (id, owner, acquired_at) VALUES (1, 'other-node', ?)")
        .bind(acquired_at)
        .execute(metadata.pool())
        .await
        .unwrap();
}

fn short_lock_options() -> StoreOptions {
    StoreOptions {
        migrations: MigrationConfig {
            lock_timeout_secs: 1,
            ..MigrationConfig::default()
        },
        ..StoreOptions::default()
    }
}

#[tokio::test]
async fn test_held_lock_times_out() {
    let metadata = TestMetadata::with_options(short_lock_options())
        .await
        .unwrap();
    plant_lock(&metadata, OffsetDateTime::now_utc().unix_timestamp()).await;

    let err = metadata.store.migrate().await.unwrap_err();
    assert!(
        matches!(err, MetadataError::MigrationLockTimeout(timeout) if timeout == Duration::from_secs(1))
    );
    // The foreign lock is left alone.
    assert_eq!(metadata.count("schema_migration_lock").await, 1);
}

#[tokio::test]
async fn test_stale_lock_is_taken_over() {
    let metadata = TestMetadata::with_options(short_lock_options())
        .await
        .unwrap();
    plant_lock(&metadata, OffsetDateTime::now_utc().unix_timestamp() - 3600).await;

    let report = metadata.store.migrate().await.unwrap();
    assert!(report.applied.is_empty());
    assert_eq!(metadata.count("schema_migration_lock").await, 0);
}

#[tokio::test]
async fn test_cancelled_context_skips_run() {
    let metadata = TestMetadata::new().await.unwrap();
    let ctx = RequestContext::new();
    ctx.cancel();

    let err = manager(&metadata, WIDGETS_V1, MigrationConfig::default())
        .up(&ctx)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Cancelled));
    assert!(!metadata.table_exists("widgets").await);
}
