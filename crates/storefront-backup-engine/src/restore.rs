use std::path::{Path, PathBuf};
use std::sync::Arc;

use storefront_backup_core::{BackupError, CheckpointMode, IoContext, RestoreReport};
use time::OffsetDateTime;

use crate::crypto::{parse_iv, EncryptionKey, IV_LEN};
use crate::pipeline::{run_restore_pipeline, CipherParams};
use crate::safety::safety_copy_path;
use crate::service::BackupService;

const RESTORE_SUFFIX: &str = ".restore";

impl BackupService {
    /// Replace the live database with the contents of a backup artifact.
    ///
    /// The artifact is fully decoded into `{backup_dir}/{name}.restore` before
    /// anything touches the live file. The live file is then copied to a safety
    /// copy, overwritten, and integrity-checked; a failed check copies the safety
    /// copy back and returns `RestoreRolledBack`.
    ///
    /// # Errors
    /// Missing metadata, missing key or IV, decode failures and a WAL checkpoint
    /// that cannot complete are returned before the live database is modified.
    pub async fn restore_backup(
        &self,
        backup_path: impl AsRef<Path>,
    ) -> Result<RestoreReport, BackupError> {
        let artifact = self.resolve_backup_path(backup_path.as_ref());
        let metadata = self.metadata.read(&artifact).await?;

        let cipher = if metadata.encrypted {
            let (Some(key), Some(raw_iv)) =
                (self.encryption_key.clone(), metadata.encryption_iv.as_deref())
            else {
                return Err(BackupError::MissingEncryptionMaterial { path: artifact });
            };
            Some((key, parse_iv(raw_iv)?))
        } else {
            None
        };

        let Some(file_name) = artifact.file_name() else {
            return Err(BackupError::InvalidConfig(format!(
                "backup path {} has no file name",
                artifact.display()
            )));
        };
        let mut staging_name = file_name.to_os_string();
        staging_name.push(RESTORE_SUFFIX);
        let staging = self.backup_dir.join(staging_name);
        self.ensure_backup_dir().await?;

        if let Err(err) = self.stream_restore(&artifact, &staging, metadata.compressed, cipher).await {
            remove_staging(&staging).await;
            return Err(err);
        }

        // Pending WAL frames would be missing from the safety copy and could be
        // replayed onto the restored file, so a blocked checkpoint stops here.
        if let Err(err) = self.db.checkpoint_wal(CheckpointMode::Truncate).await {
            remove_staging(&staging).await;
            tracing::warn!(
                event = "wal_flush_failed",
                error = %format!("{err:#}"),
                "failed to checkpoint WAL before restore"
            );
            return Err(BackupError::Database(format!(
                "cannot restore while the live database WAL is not checkpointed: {err:#}"
            )));
        }

        let safety_copy = safety_copy_path(&self.db_path, epoch_millis());
        if let Err(err) = tokio::fs::copy(&self.db_path, &safety_copy)
            .await
            .io_context(|| format!("failed to create safety copy {}", safety_copy.display()))
        {
            remove_staging(&staging).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::copy(&staging, &self.db_path)
            .await
            .io_context(|| format!("failed to copy restored database over {}", self.db_path.display()))
        {
            remove_staging(&staging).await;
            self.roll_back(&safety_copy).await?;
            return Err(err);
        }
        remove_staging(&staging).await;

        if !self.check_integrity().await {
            self.roll_back(&safety_copy).await?;
            return Err(BackupError::RestoreRolledBack { path: artifact, safety_copy });
        }

        tracing::info!(
            event = "backup_restored",
            from = %artifact.display(),
            safety_copy = %safety_copy.display(),
            "database restored from backup"
        );
        Ok(RestoreReport { restored_from: artifact, safety_copy })
    }

    async fn stream_restore(
        &self,
        artifact: &Path,
        staging: &Path,
        compressed: bool,
        cipher: Option<(Arc<EncryptionKey>, [u8; IV_LEN])>,
    ) -> Result<u64, BackupError> {
        let source = artifact.to_path_buf();
        let destination: PathBuf = staging.to_path_buf();

        tokio::task::spawn_blocking(move || {
            let params = cipher.as_ref().map(|(key, iv)| CipherParams { key, iv: *iv });
            run_restore_pipeline(&source, &destination, compressed, params)
        })
        .await
        .map_err(|err| BackupError::Task(format!("restore pipeline worker failed: {err}")))?
    }

    async fn roll_back(&self, safety_copy: &Path) -> Result<(), BackupError> {
        tracing::error!(
            event = "backup_restore_rollback",
            path = %self.db_path.display(),
            safety_copy = %safety_copy.display(),
            "restore failed; putting the original database back"
        );
        tokio::fs::copy(safety_copy, &self.db_path)
            .await
            .io_context(|| {
                format!(
                    "rollback failed: could not copy {} back over {}",
                    safety_copy.display(),
                    self.db_path.display()
                )
            })
            .map(|_| ())
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(err) = tokio::fs::remove_file(staging).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %staging.display(), error = %err, "failed to remove restore temp file");
        }
    }
}

fn epoch_millis() -> u64 {
    u64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or_default()
}
