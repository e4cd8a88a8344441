//! Versioned, checksum-verified schema migrations.
//!
//! Migration files are embedded at build time and named
//! `<version>_<description>.(up|down).sql`. The numeric prefix is the
//! migration's identity; each file's checksum is the SHA-256 of its bytes.
//! Runs are serialized per database by an explicit lock held for the whole
//! check-then-apply sequence.

pub mod postgres;
pub mod sqlite;

use crate::error::{MetadataError, MetadataResult};
use crate::models::{AppliedMigrationRow, MigrationChecksumRow, MigrationInfo};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use trove_core::RequestContext;
use trove_core::config::{ChecksumPolicy, MigrationConfig};
use trove_core::sha256_hex;

macro_rules! embed {
    ($backend:literal, $name:literal) => {
        (
            $name,
            include_str!(concat!("../../migrations/", $backend, "/", $name)),
        )
    };
}

/// Embedded PostgreSQL migration files.
pub const POSTGRES_MIGRATIONS: &[(&str, &str)] = &[
    embed!("postgres", "0001_audit_log.up.sql"),
    embed!("postgres", "0001_audit_log.down.sql"),
    embed!("postgres", "0002_datasets.up.sql"),
    embed!("postgres", "0002_datasets.down.sql"),
    embed!("postgres", "0003_roles.up.sql"),
    embed!("postgres", "0003_roles.down.sql"),
];

/// Embedded SQLite migration files.
pub const SQLITE_MIGRATIONS: &[(&str, &str)] = &[
    embed!("sqlite", "0001_audit_log.up.sql"),
    embed!("sqlite", "0001_audit_log.down.sql"),
    embed!("sqlite", "0002_datasets.up.sql"),
    embed!("sqlite", "0002_datasets.down.sql"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

/// One embedded migration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    pub version: i64,
    pub filename: &'static str,
    pub direction: Direction,
    pub sql: &'static str,
    pub checksum: String,
}

/// A version with its `up` file and optional `down` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub up: MigrationFile,
    pub down: Option<MigrationFile>,
}

impl Migration {
    /// Group `(filename, contents)` pairs into migrations sorted by version.
    pub fn from_files(files: &[(&'static str, &'static str)]) -> MetadataResult<Vec<Migration>> {
        let mut ups: BTreeMap<i64, (String, MigrationFile)> = BTreeMap::new();
        let mut downs: BTreeMap<i64, MigrationFile> = BTreeMap::new();

        for &(filename, sql) in files {
            let (version, description, direction) = parse_filename(filename)?;
            let file = MigrationFile {
                version,
                filename,
                direction,
                sql,
                checksum: sha256_hex(sql.as_bytes()),
            };
            let duplicate = match direction {
                Direction::Up => ups.insert(version, (description, file)).is_some(),
                Direction::Down => downs.insert(version, file).is_some(),
            };
            if duplicate {
                return Err(MetadataError::Config(format!(
                    "duplicate migration version {version} ({filename})"
                )));
            }
        }

        if let Some(orphan) = downs.keys().find(|v| !ups.contains_key(v)) {
            return Err(MetadataError::Config(format!(
                "migration {orphan} has a down file but no up file"
            )));
        }

        Ok(ups
            .into_iter()
            .map(|(version, (description, up))| Migration {
                version,
                description,
                up,
                down: downs.remove(&version),
            })
            .collect())
    }

    fn files(&self) -> impl Iterator<Item = &MigrationFile> {
        std::iter::once(&self.up).chain(self.down.as_ref())
    }
}

/// Split `0003_add_index.up.sql` into `(3, "add index", Up)`.
pub fn parse_filename(filename: &str) -> MetadataResult<(i64, String, Direction)> {
    let invalid = || MetadataError::Config(format!("invalid migration filename: {filename}"));

    let stem = filename.strip_suffix(".sql").ok_or_else(invalid)?;
    let (stem, direction) = if let Some(stem) = stem.strip_suffix(".up") {
        (stem, Direction::Up)
    } else if let Some(stem) = stem.strip_suffix(".down") {
        (stem, Direction::Down)
    } else {
        return Err(invalid());
    };
    let (version, description) = stem.split_once('_').ok_or_else(invalid)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let version: i64 = version.parse().map_err(|_| invalid())?;
    if description.is_empty() {
        return Err(invalid());
    }
    Ok((version, description.replace('_', " "), direction))
}

/// Files of applied versions whose recorded checksum differs from the
/// embedded contents.
pub fn detect_drift(
    migrations: &[Migration],
    applied: &BTreeSet<i64>,
    recorded: &[MigrationChecksumRow],
) -> Vec<String> {
    let embedded: BTreeMap<(i64, &str), &str> = migrations
        .iter()
        .flat_map(Migration::files)
        .map(|f| ((f.version, f.filename), f.checksum.as_str()))
        .collect();

    recorded
        .iter()
        .filter(|row| applied.contains(&row.version))
        .filter(|row| {
            embedded
                .get(&(row.version, row.filename.as_str()))
                .is_some_and(|checksum| *checksum != row.checksum)
        })
        .map(|row| row.filename.clone())
        .collect()
}

/// Result of a successful [`MigrationManager::up`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<i64>,
    /// Applied files whose checksum changed (only when the policy let the run proceed).
    pub drift: Vec<String>,
}

/// Opens backend-specific migration sessions.
#[async_trait]
pub trait MigrationDriver: Send + Sync {
    async fn session(&self) -> MetadataResult<Box<dyn MigrationSession>>;
}

/// A single connection used for one locked migration run.
#[async_trait]
pub trait MigrationSession: Send {
    /// Wait until the global migration lock is held by this session.
    async fn lock(&mut self) -> MetadataResult<()>;

    async fn unlock(&mut self) -> MetadataResult<()>;

    /// Create the bookkeeping tables if missing.
    async fn ensure_schema(&mut self) -> MetadataResult<()>;

    async fn applied(&mut self) -> MetadataResult<Vec<AppliedMigrationRow>>;

    async fn recorded_checksums(&mut self) -> MetadataResult<Vec<MigrationChecksumRow>>;

    /// Run the up file and record the version in one transaction.
    async fn apply(&mut self, migration: &Migration) -> MetadataResult<()>;

    /// Run the down file, forget the version and its checksums in one transaction.
    async fn revert(&mut self, migration: &Migration, down: &MigrationFile) -> MetadataResult<()>;

    /// Record checksums for files not recorded yet.
    async fn store_checksums(&mut self, files: &[&MigrationFile]) -> MetadataResult<()>;
}

/// Applies embedded migrations through a [`MigrationDriver`].
#[derive(Clone)]
pub struct MigrationManager {
    driver: Arc<dyn MigrationDriver>,
    migrations: Arc<Vec<Migration>>,
    config: MigrationConfig,
}

impl MigrationManager {
    pub fn new(
        driver: Arc<dyn MigrationDriver>,
        migrations: Vec<Migration>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            driver,
            migrations: Arc::new(migrations),
            config,
        }
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn driver(&self) -> &Arc<dyn MigrationDriver> {
        &self.driver
    }

    /// Open a session and take the lock, bounded by the configured lock
    /// timeout and by `ctx`.
    async fn locked_session(
        &self,
        ctx: &RequestContext,
    ) -> MetadataResult<Box<dyn MigrationSession>> {
        let timeout = self.config.lock_timeout();
        let acquire = async {
            let mut session = self.driver.session().await?;
            session.lock().await?;
            Ok::<_, MetadataError>(session)
        };
        match ctx.run(tokio::time::timeout(timeout, acquire)).await? {
            Ok(Ok(session)) => {
                tracing::debug!("Migration lock acquired");
                Ok(session)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(MetadataError::MigrationLockTimeout(timeout)),
        }
    }

    async fn unlock(mut session: Box<dyn MigrationSession>) {
        match session.unlock().await {
            Ok(()) => tracing::debug!("Migration lock released"),
            Err(err) => tracing::warn!(error = %err, "Failed to release migration lock"),
        }
    }

    /// Verify checksums, then apply every pending migration in version order.
    pub async fn up(&self, ctx: &RequestContext) -> MetadataResult<MigrationReport> {
        let mut session = self.locked_session(ctx).await?;
        let result = self.up_locked(session.as_mut()).await;
        Self::unlock(session).await;
        result
    }

    async fn up_locked(&self, session: &mut dyn MigrationSession) -> MetadataResult<MigrationReport> {
        session.ensure_schema().await?;
        let applied: BTreeSet<i64> = session.applied().await?.iter().map(|m| m.version).collect();

        let mut report = MigrationReport::default();
        if self.config.verify_checksums {
            let recorded = session.recorded_checksums().await?;
            let drift = detect_drift(&self.migrations, &applied, &recorded);
            if !drift.is_empty() {
                match self.config.checksum_policy {
                    ChecksumPolicy::Fail => {
                        tracing::error!(
                            files = ?drift,
                            "Applied migrations were modified; refusing to migrate"
                        );
                        return Err(MetadataError::ChecksumMismatch { files: drift });
                    }
                    ChecksumPolicy::Warn => {
                        tracing::warn!(files = ?drift, "Applied migrations were modified");
                    }
                    ChecksumPolicy::Ignore => {}
                }
                report.drift = drift;
            }
        }

        for migration in self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.version))
        {
            session.apply(migration).await?;
            tracing::info!(
                version = migration.version,
                description = %migration.description,
                "Applied migration"
            );
            report.applied.push(migration.version);
        }

        let files: Vec<&MigrationFile> = self.migrations.iter().flat_map(Migration::files).collect();
        session.store_checksums(&files).await?;

        Ok(report)
    }

    /// Revert the most recently applied migration. Returns its version, or
    /// `None` when nothing is applied.
    pub async fn down(&self, ctx: &RequestContext) -> MetadataResult<Option<i64>> {
        let mut session = self.locked_session(ctx).await?;
        let result = self.down_locked(session.as_mut()).await;
        Self::unlock(session).await;
        result
    }

    async fn down_locked(&self, session: &mut dyn MigrationSession) -> MetadataResult<Option<i64>> {
        session.ensure_schema().await?;
        let Some(latest) = session.applied().await?.iter().map(|m| m.version).max() else {
            return Ok(None);
        };
        let migration = self
            .migrations
            .iter()
            .find(|m| m.version == latest)
            .ok_or_else(|| MetadataError::Migration {
                version: latest,
                reason: "applied migration is not embedded in this build".to_string(),
            })?;
        let down = migration.down.as_ref().ok_or_else(|| MetadataError::Migration {
            version: latest,
            reason: "no down migration".to_string(),
        })?;

        session.revert(migration, down).await?;
        tracing::info!(
            version = migration.version,
            description = %migration.description,
            "Reverted migration"
        );
        Ok(Some(latest))
    }

    /// Every embedded migration plus any applied version this build lacks.
    pub async fn list(&self) -> MetadataResult<Vec<MigrationInfo>> {
        let mut session = self.driver.session().await?;
        session.ensure_schema().await?;
        let mut applied: BTreeMap<i64, AppliedMigrationRow> = session
            .applied()
            .await?
            .into_iter()
            .map(|row| (row.version, row))
            .collect();

        let mut infos: Vec<MigrationInfo> = self
            .migrations
            .iter()
            .map(|m| {
                let row = applied.remove(&m.version);
                MigrationInfo {
                    version: m.version,
                    description: m.description.clone(),
                    applied: row.is_some(),
                    applied_at: row.map(|r| r.applied_at),
                    checksum: m.up.checksum.clone(),
                }
            })
            .collect();
        infos.extend(applied.into_values().map(|row| MigrationInfo {
            version: row.version,
            description: row.description,
            applied: true,
            applied_at: Some(row.applied_at),
            checksum: String::new(),
        }));
        infos.sort_by_key(|info| info.version);
        Ok(infos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filename() {
        assert_eq!(
            parse_filename("0003_add_dataset_index.up.sql").unwrap(),
            (3, "add dataset index".to_string(), Direction::Up)
        );
        assert_eq!(
            parse_filename("0012_roles.down.sql").unwrap(),
            (12, "roles".to_string(), Direction::Down)
        );
        for bad in [
            "0001_x.sql",
            "0001.up.sql",
            "abc_x.up.sql",
            "0001_.up.sql",
            "0001_x.up.txt",
            "_x.up.sql",
        ] {
            assert!(parse_filename(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_from_files_groups_and_sorts() {
        let migrations = Migration::from_files(&[
            ("0002_b.up.sql", "CREATE TABLE b (x INTEGER);"),
            ("0001_a.up.sql", "CREATE TABLE a (x INTEGER);"),
            ("0001_a.down.sql", "DROP TABLE a;"),
        ])
        .unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[0].description, "a");
        assert_eq!(
            migrations[0].down.as_ref().map(|d| d.filename),
            Some("0001_a.down.sql")
        );
        assert!(migrations[1].down.is_none());
    }

    #[test]
    fn test_from_files_rejects_inconsistencies() {
        assert!(Migration::from_files(&[("0001_a.up.sql", "x"), ("0001_b.up.sql", "y")]).is_err());
        assert!(Migration::from_files(&[("0001_a.down.sql", "x")]).is_err());
    }

    #[test]
    fn test_checksum_is_reproducible() {
        let first = Migration::from_files(&[("0001_a.up.sql", "CREATE TABLE a (x INTEGER);")])
            .unwrap();
        let second = Migration::from_files(&[("0001_a.up.sql", "CREATE TABLE a (x INTEGER);")])
            .unwrap();
        assert_eq!(first[0].up.checksum, second[0].up.checksum);
        assert_eq!(
            first[0].up.checksum,
            sha256_hex(b"CREATE TABLE a (x INTEGER);")
        );
    }

    #[test]
    fn test_embedded_sets_parse() {
        let pg = Migration::from_files(POSTGRES_MIGRATIONS).unwrap();
        let lite = Migration::from_files(SQLITE_MIGRATIONS).unwrap();
        assert_eq!(pg.iter().map(|m| m.version).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(lite.iter().map(|m| m.version).collect::<Vec<_>>(), [1, 2]);
        assert!(pg.iter().chain(&lite).all(|m| m.down.is_some()));
    }

    #[test]
    fn test_detect_drift() {
        let migrations = Migration::from_files(&[
            ("0001_a.up.sql", "CREATE TABLE a (x INTEGER);"),
            ("0002_b.up.sql", "CREATE TABLE b (x INTEGER);"),
        ])
        .unwrap();
        let row = |version: i64, filename: &str, checksum: &str| MigrationChecksumRow {
            version,
            filename: filename.to_string(),
            checksum: checksum.to_string(),
        };
        let applied: BTreeSet<i64> = [1, 2].into();

        let recorded = vec![
            row(1, "0001_a.up.sql", &migrations[0].up.checksum),
            row(2, "0002_b.up.sql", &migrations[1].up.checksum),
        ];
        assert!(detect_drift(&migrations, &applied, &recorded).is_empty());

        let recorded = vec![
            row(1, "0001_a.up.sql", &migrations[0].up.checksum),
            row(2, "0002_b.up.sql", "stale"),
            row(9, "0009_gone.up.sql", "whatever"),
        ];
        assert_eq!(
            detect_drift(&migrations, &applied, &recorded),
            vec!["0002_b.up.sql".to_string()]
        );

        let only_first: BTreeSet<i64> = [1].into();
        assert!(detect_drift(&migrations, &only_first, &recorded).is_empty());
    }
}
