use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;

use storefront_backup_core::{BackupError, ItemOutcome, RetentionPolicy, RotationReport};

use crate::metadata::{MetadataStore, StoredFiles};

/// Apply `policy` to everything currently listed in `store`.
///
/// Deletion targets the sidecar that was listed and the artifact next to it,
/// never the `path` recorded inside the sidecar. Each pair is unlinked
/// concurrently. A failed pair is recorded in the report and logged; it never
/// stops the remaining deletions.
///
/// # Errors
/// Returns an error only when the metadata listing itself fails.
pub async fn rotate(
    store: &MetadataStore,
    policy: RetentionPolicy,
) -> Result<RotationReport, BackupError> {
    let listing = store.list().await?;
    let plan = policy.plan(&listing.entries);
    let pruned: BTreeSet<&str> = plan.prune.iter().map(String::as_str).collect();

    let mut report = RotationReport::default();
    for (entry, files) in listing.located() {
        let artifact = files.artifact.to_string_lossy().into_owned();
        if !pruned.contains(entry.path.as_str()) {
            report.kept.push(artifact);
            continue;
        }

        let outcome = match delete_pair(files).await {
            Ok(()) => {
                tracing::info!(
                    event = "backup_pruned",
                    path = %artifact,
                    "backup removed by retention policy"
                );
                ItemOutcome::ok(artifact)
            }
            Err(err) => {
                tracing::warn!(
                    event = "backup_prune_failed",
                    path = %artifact,
                    error = %err,
                    "failed to remove backup during rotation"
                );
                ItemOutcome::failed(artifact, err.to_string())
            }
        };
        report.removed.push(outcome);
    }
    Ok(report)
}

async fn delete_pair(files: &StoredFiles) -> Result<(), BackupError> {
    let (artifact_result, sidecar_result) =
        tokio::join!(remove_if_present(&files.artifact), remove_if_present(&files.sidecar));
    artifact_result?;
    sidecar_result
}

async fn remove_if_present(path: &Path) -> Result<(), BackupError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(BackupError::Io {
            context: format!("failed to remove {}", path.display()),
            source,
        }),
    }
}
