//! Constructor-time configuration for the backup service.

use std::fmt;
use std::path::{Path, PathBuf};

use storefront_backup_core::{BackupError, IoContext, RetentionPolicy};

pub const DEFAULT_BACKUP_DIR: &str = "./backups";
pub const DEFAULT_DATABASE_URL: &str = "file:./database.sqlite";
pub const DEFAULT_DB_FILENAME: &str = "database.sqlite";
pub const DEFAULT_DAILY_RETENTION: usize = 30;
pub const DEFAULT_MONTHLY_RETENTION: usize = 12;

#[derive(Clone)]
pub struct BackupConfig {
    pub backup_dir: PathBuf,
    /// Plain path or `file:` URI of the live database.
    pub db_path: String,
    /// Passphrase for artifact encryption. `None` disables encryption.
    pub encryption_key: Option<String>,
    pub daily_retention: usize,
    pub monthly_retention: usize,
    pub compress: bool,
}

impl BackupConfig {
    /// Configuration with the default retention and compression settings.
    #[must_use]
    pub fn new(backup_dir: impl Into<PathBuf>, db_path: impl Into<String>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            db_path: db_path.into(),
            encryption_key: None,
            daily_retention: DEFAULT_DAILY_RETENTION,
            monthly_retention: DEFAULT_MONTHLY_RETENTION,
            compress: true,
        }
    }

    /// # Errors
    /// Returns `BackupError::InvalidConfig` for zero retention counts or an empty passphrase.
    pub fn validate(&self) -> Result<(), BackupError> {
        if self.daily_retention == 0 {
            return Err(BackupError::InvalidConfig("daily_retention must be at least 1".into()));
        }
        if self.monthly_retention == 0 {
            return Err(BackupError::InvalidConfig(
                "monthly_retention must be at least 1".into(),
            ));
        }
        if self.encryption_key.as_deref().is_some_and(str::is_empty) {
            return Err(BackupError::InvalidConfig("encryption_key must not be empty".into()));
        }
        if self.db_path.trim().is_empty() {
            return Err(BackupError::InvalidConfig("db_path must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            daily_retention: self.daily_retention,
            monthly_retention: self.monthly_retention,
        }
    }

    /// Absolute backup directory; relative paths resolve against the working directory.
    ///
    /// # Errors
    /// Returns an error when the working directory cannot be determined.
    pub fn resolve_backup_dir(&self) -> Result<PathBuf, BackupError> {
        absolutize(&self.backup_dir)
    }

    /// Absolute path of the live database file.
    ///
    /// A `file:` prefix and any URI query are stripped. A value without a file
    /// extension falls back to `database.sqlite` in the working directory.
    ///
    /// # Errors
    /// Returns an error when the working directory cannot be determined.
    pub fn resolve_db_path(&self) -> Result<PathBuf, BackupError> {
        let raw = self.db_path.trim();
        let raw = raw.strip_prefix("file:").unwrap_or(raw);
        let raw = raw.split_once('?').map_or(raw, |(path, _query)| path);

        let path = Path::new(raw);
        if path.extension().is_none() {
            return absolutize(Path::new(DEFAULT_DB_FILENAME));
        }
        absolutize(path)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BACKUP_DIR, DEFAULT_DATABASE_URL)
    }
}

impl fmt::Debug for BackupConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupConfig")
            .field("backup_dir", &self.backup_dir)
            .field("db_path", &self.db_path)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "[REDACTED]"))
            .field("daily_retention", &self.daily_retention)
            .field("monthly_retention", &self.monthly_retention)
            .field("compress", &self.compress)
            .finish()
    }
}

pub(crate) fn absolutize(path: &Path) -> Result<PathBuf, BackupError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().io_context(|| "failed to read working directory".into())?;
    Ok(cwd.join(path))
}
