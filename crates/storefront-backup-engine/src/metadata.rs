//! JSON sidecars stored next to each artifact as `{artifact}.meta.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use storefront_backup_core::{
    metadata_path, newest_first, BackupError, BackupMetadata, IoContext, ItemOutcome,
    METADATA_SUFFIX,
};

/// The files a listed record was actually read from.
///
/// `artifact` is `sidecar` without its `.meta.json` suffix. It can differ from
/// the recorded `path` when the backup directory was moved or copied.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct StoredFiles {
    pub sidecar: PathBuf,
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataListing {
    /// Parsed records, newest first.
    pub entries: Vec<BackupMetadata>,
    /// On-disk location of `entries[i]`.
    pub files: Vec<StoredFiles>,
    /// Sidecars that could not be read or parsed, by file name.
    pub skipped: Vec<ItemOutcome>,
}

impl MetadataListing {
    pub fn located(&self) -> impl Iterator<Item = (&BackupMetadata, &StoredFiles)> {
        self.entries.iter().zip(&self.files)
    }
}

#[derive(Debug, Clone)]
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist the sidecar for `artifact`, replacing any existing one.
    ///
    /// The JSON is written to a temporary file first and renamed into place so a
    /// concurrent listing never observes a half-written record.
    ///
    /// # Errors
    /// Returns an error when serialization or any filesystem step fails.
    pub async fn write(
        &self,
        artifact: &Path,
        metadata: &BackupMetadata,
    ) -> Result<PathBuf, BackupError> {
        let target = metadata_path(artifact);
        let mut staging = target.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        let body = serde_json::to_string_pretty(metadata).map_err(|source| BackupError::Json {
            context: format!("failed to serialize metadata for {}", artifact.display()),
            source,
        })?;
        tokio::fs::write(&staging, body)
            .await
            .io_context(|| format!("failed to write {}", staging.display()))?;
        tokio::fs::rename(&staging, &target)
            .await
            .io_context(|| format!("failed to move metadata into {}", target.display()))?;
        Ok(target)
    }

    /// # Errors
    /// Returns `MetadataNotFound` when there is no sidecar and `InvalidMetadata`
    /// when it is not a valid record.
    pub async fn read(&self, artifact: &Path) -> Result<BackupMetadata, BackupError> {
        let path = metadata_path(artifact);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BackupError::MetadataNotFound { path: artifact.to_path_buf() });
            }
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to read {}", path.display()),
                    source,
                });
            }
        };
        serde_json::from_str(&raw)
            .map_err(|err| BackupError::InvalidMetadata { path, reason: err.to_string() })
    }

    /// Parse every sidecar in the directory. A missing directory lists as empty.
    ///
    /// # Errors
    /// Returns an error only when the directory itself cannot be read.
    pub async fn list(&self) -> Result<MetadataListing, BackupError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(MetadataListing::default()),
            Err(source) => {
                return Err(BackupError::Io {
                    context: format!("failed to list {}", self.dir.display()),
                    source,
                });
            }
        };

        let mut candidates = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .io_context(|| format!("failed to list {}", self.dir.display()))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(stem) = name.strip_suffix(METADATA_SUFFIX).filter(|stem| !stem.is_empty())
            else {
                continue;
            };
            let files = StoredFiles { sidecar: entry.path(), artifact: self.dir.join(stem) };
            candidates.push((name, files));
        }
        candidates.sort_by(|left, right| left.0.cmp(&right.0));

        let mut located = Vec::with_capacity(candidates.len());
        let mut listing = MetadataListing::default();
        for (name, files) in candidates {
            match parse_sidecar(&files.sidecar).await {
                Ok(metadata) => located.push((metadata, files)),
                Err(reason) => {
                    tracing::warn!(
                        event = "metadata_parse_failed",
                        file = %files.sidecar.display(),
                        error = %reason,
                        "skipping unreadable backup metadata"
                    );
                    listing.skipped.push(ItemOutcome::failed(name, reason));
                }
            }
        }

        located.sort_by(|left, right| {
            newest_first(&left.0, &right.0).then_with(|| right.1.sidecar.cmp(&left.1.sidecar))
        });
        let (entries, files): (Vec<_>, Vec<_>) = located.into_iter().unzip();
        listing.entries = entries;
        listing.files = files;
        Ok(listing)
    }
}

async fn parse_sidecar(path: &Path) -> Result<BackupMetadata, String> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|err| err.to_string())?;
    serde_json::from_str(&raw).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use storefront_backup_core::{BackupType, IntegrityStatus};

    use super::*;

    fn sample(dir: &Path, timestamp: &str, name: &str) -> BackupMetadata {
        BackupMetadata {
            timestamp: timestamp.to_string(),
            backup_type: BackupType::Full,
            size: 1024,
            checksum: "ab".repeat(32),
            encrypted: false,
            compressed: true,
            integrity_check: IntegrityStatus::Passed,
            duration: 7,
            table_count: 2,
            record_count: 9,
            path: dir.join(name).to_string_lossy().into_owned(),
            encryption_iv: None,
            encryption_algorithm: None,
        }
    }

    #[tokio::test]
    async fn write_then_read_returns_same_record() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(dir.path());
        let record = sample(dir.path(), "2024-05-01T00:00:00.000Z", "a-full.sqlite.gz");

        let written = store.write(record.artifact_path(), &record).await?;
        assert!(written.to_string_lossy().ends_with(".sqlite.gz.meta.json"));
        assert_eq!(store.read(record.artifact_path()).await?, record);

        let raw = std::fs::read_to_string(&written).io_context(|| "read sidecar".into())?;
        assert!(raw.contains("\n  \"timestamp\""), "sidecar should be pretty-printed: {raw}");
        Ok(())
    }

    #[tokio::test]
    async fn write_overwrites_existing_sidecar() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(dir.path());
        let mut record = sample(dir.path(), "2024-05-01T00:00:00.000Z", "a-full.sqlite");
        store.write(record.artifact_path(), &record).await?;

        record.size = 2048;
        store.write(record.artifact_path(), &record).await?;
        assert_eq!(store.read(record.artifact_path()).await?.size, 2048);
        Ok(())
    }

    #[tokio::test]
    async fn read_distinguishes_missing_and_malformed() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(dir.path());
        let artifact = dir.path().join("missing-full.sqlite");
        assert!(matches!(
            store.read(&artifact).await,
            Err(BackupError::MetadataNotFound { .. })
        ));

        std::fs::write(metadata_path(&artifact), "{ not json").io_context(|| "write".into())?;
        assert!(matches!(
            store.read(&artifact).await,
            Err(BackupError::InvalidMetadata { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn list_skips_corrupt_sidecars_and_sorts_newest_first() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(dir.path());

        let older = sample(dir.path(), "2024-04-01T00:00:00.000Z", "older-full.sqlite");
        let newer = sample(dir.path(), "2024-05-01T00:00:00.000Z", "newer-full.sqlite");
        store.write(older.artifact_path(), &older).await?;
        store.write(newer.artifact_path(), &newer).await?;
        std::fs::write(dir.path().join("broken-full.sqlite.meta.json"), "[]")
            .io_context(|| "write".into())?;
        std::fs::write(dir.path().join("notes.txt"), "ignored").io_context(|| "write".into())?;

        let listing = store.list().await?;
        assert_eq!(listing.entries, vec![newer, older]);
        assert_eq!(listing.files.len(), 2);
        assert_eq!(listing.files[0].artifact, dir.path().join("newer-full.sqlite"));
        assert_eq!(
            listing.files[0].sidecar,
            dir.path().join("newer-full.sqlite.meta.json")
        );
        assert_eq!(listing.skipped.len(), 1);
        assert_eq!(listing.skipped[0].item, "broken-full.sqlite.meta.json");
        assert!(!listing.skipped[0].is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn files_come_from_the_directory_not_the_recorded_path() -> Result<(), BackupError> {
        let moved = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(moved.path());
        let record =
            sample(Path::new("/srv/old-backups"), "2024-05-01T00:00:00.000Z", "a-full.sqlite");
        store.write(&moved.path().join("a-full.sqlite"), &record).await?;

        let listing = store.list().await?;
        let Some((entry, files)) = listing.located().next() else {
            panic!("expected one listed backup");
        };
        assert_eq!(entry.path, "/srv/old-backups/a-full.sqlite");
        assert_eq!(files.artifact, moved.path().join("a-full.sqlite"));
        assert_eq!(files.sidecar, moved.path().join("a-full.sqlite.meta.json"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_lists_as_empty() -> Result<(), BackupError> {
        let dir = tempfile::tempdir().io_context(|| "tempdir".into())?;
        let store = MetadataStore::new(dir.path().join("never-created"));
        let listing = store.list().await?;
        assert!(listing.entries.is_empty());
        assert!(listing.skipped.is_empty());
        Ok(())
    }
}
