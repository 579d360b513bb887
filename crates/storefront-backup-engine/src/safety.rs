//! Pre-restore copies of the live database (`{db}.{epochMillis}.bak`).
//!
//! A restore always leaves one behind. Nothing here runs automatically; pruning
//! is an explicit operator action.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use storefront_backup_core::{BackupError, IoContext, ItemOutcome};

const SAFETY_COPY_SUFFIX: &str = ".bak";

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyCopy {
    pub path: PathBuf,
    pub created_at_millis: u64,
}

#[must_use]
pub fn safety_copy_path(db_path: &Path, epoch_millis: u64) -> PathBuf {
    let mut raw = db_path.as_os_str().to_owned();
    raw.push(format!(".{epoch_millis}{SAFETY_COPY_SUFFIX}"));
    PathBuf::from(raw)
}

fn parse_safety_copy(db_file_name: &str, candidate: &str) -> Option<u64> {
    let millis = candidate
        .strip_prefix(db_file_name)?
        .strip_prefix('.')?
        .strip_suffix(SAFETY_COPY_SUFFIX)?;
    if millis.is_empty() || !millis.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    millis.parse().ok()
}

/// Safety copies next to `db_path`, newest first.
///
/// # Errors
/// Returns an error when the database directory cannot be read.
pub async fn list_safety_copies(db_path: &Path) -> Result<Vec<SafetyCopy>, BackupError> {
    let Some(db_file_name) = db_path.file_name().map(|name| name.to_string_lossy().into_owned())
    else {
        return Err(BackupError::InvalidConfig(format!(
            "database path {} has no file name",
            db_path.display()
        )));
    };
    let parent = match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut dir = match tokio::fs::read_dir(&parent).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(BackupError::Io {
                context: format!("failed to list {}", parent.display()),
                source,
            });
        }
    };

    let mut copies = Vec::new();
    while let Some(entry) =
        dir.next_entry().await.io_context(|| format!("failed to list {}", parent.display()))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(created_at_millis) = parse_safety_copy(&db_file_name, &name) {
            copies.push(SafetyCopy { path: entry.path(), created_at_millis });
        }
    }
    copies.sort_by(|a, b| {
        b.created_at_millis.cmp(&a.created_at_millis).then_with(|| b.path.cmp(&a.path))
    });
    Ok(copies)
}

/// Delete all but the newest `keep` safety copies.
///
/// # Errors
/// Returns an error when the copies cannot be listed. Individual deletion
/// failures are reported per item.
pub async fn prune_safety_copies(
    db_path: &Path,
    keep: usize,
) -> Result<Vec<ItemOutcome>, BackupError> {
    let copies = list_safety_copies(db_path).await?;
    let mut outcomes = Vec::new();
    for copy in copies.into_iter().skip(keep) {
        let item = copy.path.to_string_lossy().into_owned();
        match tokio::fs::remove_file(&copy.path).await {
            Ok(()) => {
                tracing::info!(path = %copy.path.display(), "safety copy removed");
                outcomes.push(ItemOutcome::ok(item));
            }
            Err(err) => {
                tracing::warn!(path = %copy.path.display(), error = %err, "failed to remove safety copy");
                outcomes.push(ItemOutcome::failed(item, err.to_string()));
            }
        }
    }
    Ok(outcomes)
}
