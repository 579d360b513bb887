use std::path::{Path, PathBuf};
use std::sync::Arc;

use storefront_backup_core::{
    BackupError, BackupMetadata, CheckpointMode, DatabaseHandle, IoContext, ItemOutcome,
    RetentionPolicy, RotationReport, StatsReport,
};

use crate::checksum::sha256_file;
use crate::config::{absolutize, BackupConfig};
use crate::crypto::EncryptionKey;
use crate::metadata::{MetadataListing, MetadataStore};
use crate::retention;
use crate::safety::{self, SafetyCopy};

/// Backup, restore and retention over one live database.
///
/// Operations are not serialized against each other. Callers that may overlap a
/// backup with a restore (or two backups) must provide their own single-flight
/// guard.
pub struct BackupService {
    pub(crate) backup_dir: PathBuf,
    pub(crate) db_path: PathBuf,
    pub(crate) compress: bool,
    pub(crate) policy: RetentionPolicy,
    pub(crate) db: Arc<dyn DatabaseHandle>,
    pub(crate) encryption_key: Option<Arc<EncryptionKey>>,
    pub(crate) metadata: MetadataStore,
}

impl BackupService {
    /// Validate `config`, resolve its paths and derive the encryption key.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when validation fails or when `db` points at a
    /// different file than the configured database path, and `Crypto` when key
    /// derivation fails.
    pub fn new(config: &BackupConfig, db: Arc<dyn DatabaseHandle>) -> Result<Self, BackupError> {
        config.validate()?;
        let backup_dir = config.resolve_backup_dir()?;
        let db_path = config.resolve_db_path()?;

        let handle_path = absolutize(db.file_path())?;
        if handle_path != db_path {
            return Err(BackupError::InvalidConfig(format!(
                "database handle points at {} but the configured database is {}",
                handle_path.display(),
                db_path.display()
            )));
        }

        let encryption_key = config
            .encryption_key
            .as_deref()
            .map(EncryptionKey::derive)
            .transpose()?
            .map(Arc::new);

        Ok(Self {
            metadata: MetadataStore::new(&backup_dir),
            backup_dir,
            db_path,
            compress: config.compress,
            policy: config.retention_policy(),
            db,
            encryption_key,
        })
    }

    #[must_use]
    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn encrypts(&self) -> bool {
        self.encryption_key.is_some()
    }

    /// Run the integrity pragma on the live database. Errors count as a failure
    /// and are logged, never returned.
    pub async fn check_integrity(&self) -> bool {
        match self.db.integrity_check().await {
            Ok(true) => true,
            Ok(false) => {
                tracing::error!(
                    event = "integrity_check_failed",
                    path = %self.db_path.display(),
                    "database integrity check reported problems"
                );
                false
            }
            Err(err) => {
                tracing::error!(
                    event = "integrity_check_failed",
                    path = %self.db_path.display(),
                    error = %format!("{err:#}"),
                    "database integrity check could not run"
                );
                false
            }
        }
    }

    /// All readable backups, newest first, along with any skipped sidecars.
    ///
    /// # Errors
    /// Returns an error when the backup directory cannot be created or listed.
    pub async fn scan_backups(&self) -> Result<MetadataListing, BackupError> {
        self.ensure_backup_dir().await?;
        self.metadata.list().await
    }

    /// # Errors
    /// Returns an error when the backup directory cannot be created or listed.
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        Ok(self.scan_backups().await?.entries)
    }

    /// Apply the configured retention policy to the backup directory.
    ///
    /// # Errors
    /// Returns an error when the backups cannot be listed.
    pub async fn rotate(&self) -> Result<RotationReport, BackupError> {
        retention::rotate(&self.metadata, self.policy).await
    }

    /// Recompute the artifact checksum and compare it with its sidecar.
    ///
    /// # Errors
    /// Returns `ChecksumMismatch` when the artifact changed since it was written,
    /// or the metadata/read error that prevented the comparison.
    pub async fn verify_backup(
        &self,
        backup_path: impl AsRef<Path>,
    ) -> Result<BackupMetadata, BackupError> {
        let artifact = self.resolve_backup_path(backup_path.as_ref());
        let metadata = self.metadata.read(&artifact).await?;
        let actual = sha256_file(&artifact).await?;
        if actual != metadata.checksum {
            return Err(BackupError::ChecksumMismatch {
                path: artifact,
                expected: metadata.checksum,
                actual,
            });
        }
        Ok(metadata)
    }

    /// # Errors
    /// Returns an error when the database directory cannot be read.
    pub async fn list_safety_copies(&self) -> Result<Vec<SafetyCopy>, BackupError> {
        safety::list_safety_copies(&self.db_path).await
    }

    /// Delete all but the newest `keep` safety copies of the live database.
    ///
    /// # Errors
    /// Returns an error when the database directory cannot be read.
    pub async fn prune_safety_copies(&self, keep: usize) -> Result<Vec<ItemOutcome>, BackupError> {
        safety::prune_safety_copies(&self.db_path, keep).await
    }

    pub(crate) fn resolve_backup_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.backup_dir.join(path)
        }
    }

    pub(crate) async fn ensure_backup_dir(&self) -> Result<(), BackupError> {
        tokio::fs::create_dir_all(&self.backup_dir)
            .await
            .io_context(|| format!("failed to create backup directory {}", self.backup_dir.display()))
    }

    /// Count rows per user table. A table that cannot be counted is reported in
    /// the outcome list and contributes nothing to `record_count`.
    pub(crate) async fn collect_stats(&self) -> StatsReport {
        let tables = match self.db.list_user_tables().await {
            Ok(tables) => tables,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to collect table statistics");
                return StatsReport::default();
            }
        };

        let mut report = StatsReport {
            table_count: tables.len() as u64,
            ..StatsReport::default()
        };
        for table in tables {
            match self.db.count_rows(&table).await {
                Ok(count) => {
                    report.record_count += count;
                    report.tables.push(ItemOutcome::ok(table));
                }
                Err(err) => {
                    let reason = format!("{err:#}");
                    tracing::debug!(
                        event = "table_count_failed",
                        table = %table,
                        error = %reason,
                        "skipping table in record count"
                    );
                    report.tables.push(ItemOutcome::failed(table, reason));
                }
            }
        }
        report
    }

    /// Truncate the WAL and optimize before the file is copied. Best-effort.
    pub(crate) async fn flush_database(&self) {
        let flushed = async {
            self.db.checkpoint_wal(CheckpointMode::Truncate).await?;
            self.db.optimize().await
        }
        .await;
        if let Err(err) = flushed {
            tracing::warn!(
                event = "wal_flush_failed",
                error = %format!("{err:#}"),
                "failed to flush WAL before backup"
            );
        }
    }
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService")
            .field("backup_dir", &self.backup_dir)
            .field("db_path", &self.db_path)
            .field("compress", &self.compress)
            .field("policy", &self.policy)
            .field("encrypted", &self.encryption_key.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;

    use super::*;

    /// In-memory stand-in for the live database. The "file" is a real path so the
    /// pipelines have something to copy.
    pub(crate) struct FakeDatabase {
        pub path: PathBuf,
        pub healthy: AtomicBool,
        pub fail_checkpoint: bool,
        pub broken_table: Option<&'static str>,
    }

    impl FakeDatabase {
        pub fn new(path: PathBuf) -> Self {
            Self { path, healthy: AtomicBool::new(true), fail_checkpoint: false, broken_table: None }
        }
    }

    #[async_trait]
    impl DatabaseHandle for FakeDatabase {
        fn file_path(&self) -> &Path {
            &self.path
        }

        async fn integrity_check(&self) -> Result<bool> {
            Ok(self.healthy.load(Ordering::SeqCst))
        }

        async fn checkpoint_wal(&self, _mode: CheckpointMode) -> Result<()> {
            if self.fail_checkpoint {
                return Err(anyhow!("database is locked"));
            }
            Ok(())
        }

        async fn optimize(&self) -> Result<()> {
            Ok(())
        }

        async fn list_user_tables(&self) -> Result<Vec<String>> {
            Ok(vec!["customers".into(), "orders".into(), "products".into()])
        }

        async fn count_rows(&self, table: &str) -> Result<u64> {
            if self.broken_table == Some(table) {
                return Err(anyhow!("no such table: {table}"));
            }
            Ok(10)
        }
    }

    pub(crate) fn service_with(fake: FakeDatabase, backup_dir: &Path) -> Result<BackupService> {
        let config = BackupConfig::new(backup_dir, fake.path.to_string_lossy().into_owned());
        Ok(BackupService::new(&config, Arc::new(fake))?)
    }

    #[tokio::test]
    async fn stats_report_lists_failed_tables() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fake = FakeDatabase::new(dir.path().join("live.sqlite"));
        fake.broken_table = Some("orders");
        let service = service_with(fake, &dir.path().join("backups"))?;

        let stats = service.collect_stats().await;
        assert_eq!(stats.table_count, 3);
        assert_eq!(stats.record_count, 20);
        let failures: Vec<&str> = stats.failures().map(|outcome| outcome.item.as_str()).collect();
        assert_eq!(failures, vec!["orders"]);
        Ok(())
    }

    #[tokio::test]
    async fn handle_for_other_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fake = FakeDatabase::new(dir.path().join("live.sqlite"));
        let config = BackupConfig::new(dir.path().join("backups"), "/elsewhere/other.sqlite");
        let result = BackupService::new(&config, Arc::new(fake));
        assert!(matches!(result, Err(BackupError::InvalidConfig(_))));
        Ok(())
    }

    #[tokio::test]
    async fn failed_integrity_check_is_reported_not_raised() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fake = FakeDatabase::new(dir.path().join("live.sqlite"));
        fake.healthy.store(false, Ordering::SeqCst);
        let service = service_with(fake, &dir.path().join("backups"))?;
        assert!(!service.check_integrity().await);
        Ok(())
    }

    #[tokio::test]
    async fn relative_backup_paths_resolve_inside_backup_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let service =
            service_with(FakeDatabase::new(dir.path().join("live.sqlite")), &dir.path().join("b"))?;
        assert_eq!(
            service.resolve_backup_path(Path::new("x-full.sqlite")),
            dir.path().join("b").join("x-full.sqlite")
        );
        assert_eq!(service.resolve_backup_path(Path::new("/abs/x")), PathBuf::from("/abs/x"));
        Ok(())
    }

    #[tokio::test]
    async fn debug_output_hides_key_material() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let fake = FakeDatabase::new(dir.path().join("live.sqlite"));
        let mut config = BackupConfig::new(dir.path().join("b"), fake.path.to_string_lossy().into_owned());
        config.encryption_key = Some("swordfish".into());
        let service = BackupService::new(&config, Arc::new(fake))?;
        let rendered = format!("{service:?}");
        assert!(rendered.contains("encrypted: true"));
        assert!(!rendered.contains("swordfish"));
        Ok(())
    }
}
