use std::path::{Path, PathBuf};
use std::time::Instant;

use storefront_backup_core::{
    artifact_file_name, iso_timestamp, sanitize_timestamp, BackupError, BackupMetadata,
    BackupResult, BackupType, IntegrityStatus, IoContext, ENCRYPTION_ALGORITHM,
};
use time::OffsetDateTime;

use crate::checksum::sha256_file;
use crate::crypto::{generate_iv, IV_LEN};
use crate::pipeline::{run_backup_pipeline, CipherParams};
use crate::service::BackupService;

impl BackupService {
    /// Snapshot the live database into a new artifact, record its sidecar and
    /// apply retention.
    ///
    /// A failed integrity pre-check is recorded in the metadata and does not
    /// stop the backup. `Incremental` only tags the artifact; the snapshot is
    /// always a full copy.
    ///
    /// # Errors
    /// Returns an error when the backup directory, the pipeline, the checksum or
    /// the sidecar cannot be produced. A partial artifact is removed first.
    pub async fn create_backup(&self, backup_type: BackupType) -> Result<BackupResult, BackupError> {
        let started = Instant::now();
        self.ensure_backup_dir().await?;

        if backup_type == BackupType::Incremental {
            tracing::info!(
                event = "incremental_placeholder",
                "incremental backups are not implemented; taking a full snapshot"
            );
        }

        let integrity_passed = self.check_integrity().await;
        let stats = self.collect_stats().await;
        self.flush_database().await;

        let timestamp = iso_timestamp(OffsetDateTime::now_utc())?;
        let encrypted = self.encryption_key.is_some();
        let file_name =
            artifact_file_name(&sanitize_timestamp(&timestamp), backup_type, self.compress, encrypted);
        let artifact = self.backup_dir.join(file_name);
        let iv = encrypted.then(generate_iv);

        self.stream_backup(&artifact, iv).await?;

        let checksum = sha256_file(&artifact).await?;
        let size = tokio::fs::metadata(&artifact)
            .await
            .io_context(|| format!("failed to stat {}", artifact.display()))?
            .len();

        let metadata = BackupMetadata {
            timestamp,
            backup_type,
            size,
            checksum,
            encrypted,
            compressed: self.compress,
            integrity_check: IntegrityStatus::from(integrity_passed),
            duration: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            table_count: stats.table_count,
            record_count: stats.record_count,
            path: artifact.to_string_lossy().into_owned(),
            encryption_iv: iv.map(hex::encode),
            encryption_algorithm: encrypted.then(|| ENCRYPTION_ALGORITHM.to_string()),
        };

        self.metadata.write(&artifact, &metadata).await?;
        let rotation = self.rotate().await?;

        tracing::info!(
            event = "backup_created",
            path = %artifact.display(),
            duration = metadata.duration,
            size = metadata.size,
            "backup created"
        );

        Ok(BackupResult { success: true, backup_path: artifact, metadata, stats, rotation })
    }

    async fn stream_backup(
        &self,
        artifact: &Path,
        iv: Option<[u8; IV_LEN]>,
    ) -> Result<u64, BackupError> {
        let source = self.db_path.clone();
        let destination: PathBuf = artifact.to_path_buf();
        let compress = self.compress;
        let key = self.encryption_key.clone();

        let result = tokio::task::spawn_blocking(move || {
            let cipher = key.as_deref().zip(iv).map(|(key, iv)| CipherParams { key, iv });
            run_backup_pipeline(&source, &destination, compress, cipher)
        })
        .await
        .map_err(|err| BackupError::Task(format!("backup pipeline worker failed: {err}")))?;

        if let Err(err) = &result {
            if !is_existing_artifact(err) {
                discard_partial_artifact(artifact).await;
            }
        }
        result
    }
}

/// The artifact path was taken before this backup started; the file belongs to
/// someone else and must be left alone.
fn is_existing_artifact(err: &BackupError) -> bool {
    matches!(err, BackupError::Io { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists)
}

async fn discard_partial_artifact(artifact: &Path) {
    match tokio::fs::remove_file(artifact).await {
        Ok(()) => tracing::warn!(
            event = "partial_artifact_removed",
            path = %artifact.display(),
            "removed incomplete backup artifact"
        ),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(
            path = %artifact.display(),
            error = %err,
            "failed to remove incomplete backup artifact"
        ),
    }
}
