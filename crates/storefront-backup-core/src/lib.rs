use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

/// Suffix of the JSON sidecar written next to every artifact.
pub const METADATA_SUFFIX: &str = ".meta.json";

/// Cipher recorded in `encryptionAlgorithm` for encrypted artifacts.
pub const ENCRYPTION_ALGORITHM: &str = "aes-256-cbc";

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid backup configuration: {0}")]
    InvalidConfig(String),
    #[error("backup {} is encrypted but the encryption key or IV is missing", .path.display())]
    MissingEncryptionMaterial { path: PathBuf },
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("backup metadata not found for {}", .path.display())]
    MetadataNotFound { path: PathBuf },
    #[error("invalid backup metadata {}: {reason}", .path.display())]
    InvalidMetadata { path: PathBuf, reason: String },
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error(
        "integrity check failed after restoring {}; original database was restored from {}",
        .path.display(),
        .safety_copy.display()
    )]
    RestoreRolledBack { path: PathBuf, safety_copy: PathBuf },
    #[error("background task failed: {0}")]
    Task(String),
}

/// Attach a human-readable context to `std::io` failures.
pub trait IoContext<T> {
    /// # Errors
    /// Returns `BackupError::Io` carrying the original error and the context message.
    fn io_context<F>(self, context: F) -> Result<T, BackupError>
    where
        F: FnOnce() -> String;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn io_context<F>(self, context: F) -> Result<T, BackupError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| BackupError::Io { context: context(), source })
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    #[default]
    Full,
    /// Tag only: the snapshot taken is always a full copy of the database.
    Incremental,
}

impl BackupType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
        }
    }
}

impl Display for BackupType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(BackupError::InvalidConfig(format!("unknown backup type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Passed,
    Failed,
    NotRun,
}

impl From<bool> for IntegrityStatus {
    fn from(passed: bool) -> Self {
        if passed {
            Self::Passed
        } else {
            Self::Failed
        }
    }
}

/// Sidecar record describing one artifact and how to reverse its pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub size: u64,
    pub checksum: String,
    pub encrypted: bool,
    pub compressed: bool,
    pub integrity_check: IntegrityStatus,
    pub duration: u64,
    pub table_count: u64,
    pub record_count: u64,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_algorithm: Option<String>,
}

impl BackupMetadata {
    /// `YYYY-MM` prefix of the timestamp, used to bucket the monthly tier.
    #[must_use]
    pub fn month_key(&self) -> &str {
        self.timestamp.get(0..7).unwrap_or(&self.timestamp)
    }

    #[must_use]
    pub fn artifact_path(&self) -> &Path {
        Path::new(&self.path)
    }

    fn parsed_timestamp(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::parse(&self.timestamp, &Rfc3339).ok()
    }
}

/// Order entries newest first. Unparseable timestamps sort last; ties fall back to
/// the artifact path so that repeated listings come out identical.
pub fn sort_newest_first(entries: &mut [BackupMetadata]) {
    entries.sort_by(newest_first);
}

/// Comparator behind [`sort_newest_first`].
#[must_use]
pub fn newest_first(left: &BackupMetadata, right: &BackupMetadata) -> Ordering {
    let by_time = match (left.parsed_timestamp(), right.parsed_timestamp()) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| right.path.cmp(&left.path))
}

/// Result of one item in a best-effort batch (a table count, a deletion, a parsed file).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ItemOutcome {
    pub item: String,
    pub error: Option<String>,
}

impl ItemOutcome {
    #[must_use]
    pub fn ok(item: impl Into<String>) -> Self {
        Self { item: item.into(), error: None }
    }

    #[must_use]
    pub fn failed(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self { item: item.into(), error: Some(error.into()) }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub table_count: u64,
    pub record_count: u64,
    pub tables: Vec<ItemOutcome>,
}

impl StatsReport {
    pub fn failures(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.tables.iter().filter(|outcome| !outcome.is_ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub kept: Vec<String>,
    pub removed: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupResult {
    pub success: bool,
    pub backup_path: PathBuf,
    pub metadata: BackupMetadata,
    pub stats: StatsReport,
    pub rotation: RotationReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub restored_from: PathBuf,
    pub safety_copy: PathBuf,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RetentionPolicy {
    pub daily_retention: usize,
    pub monthly_retention: usize,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct RetentionPlan {
    pub keep: Vec<String>,
    pub prune: Vec<String>,
}

impl RetentionPolicy {
    /// Split `entries` (sorted newest first) into artifact paths to keep and to prune.
    ///
    /// The newest `daily_retention` entries are always kept. Older entries are scanned
    /// in the same order and the first one seen for each month is kept, until
    /// `monthly_retention` months have been added. Months already present in the
    /// daily tier are covered and never kept a second time.
    #[must_use]
    pub fn plan(&self, entries: &[BackupMetadata]) -> RetentionPlan {
        let daily_len = self.daily_retention.min(entries.len());
        let (daily, older) = entries.split_at(daily_len);

        let mut keep: BTreeSet<&str> = daily.iter().map(|entry| entry.path.as_str()).collect();
        let covered: BTreeSet<&str> = daily.iter().map(BackupMetadata::month_key).collect();
        let mut months: BTreeSet<&str> = BTreeSet::new();

        for entry in older {
            if months.len() >= self.monthly_retention {
                break;
            }
            let month = entry.month_key();
            if covered.contains(month) || months.contains(month) {
                continue;
            }
            months.insert(month);
            keep.insert(entry.path.as_str());
        }

        let mut plan = RetentionPlan::default();
        for entry in entries {
            if keep.contains(entry.path.as_str()) {
                plan.keep.push(entry.path.clone());
            } else {
                plan.prune.push(entry.path.clone());
            }
        }
        plan
    }
}

/// Format an instant as UTC ISO-8601 with millisecond precision (`2024-05-01T12:34:56.789Z`).
///
/// # Errors
/// Returns an error when the instant cannot be formatted.
pub fn iso_timestamp(value: OffsetDateTime) -> Result<String, BackupError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        ))
        .map_err(|err| BackupError::Timestamp(format!("failed to format timestamp: {err}")))
}

/// Make an ISO timestamp safe for file names.
#[must_use]
pub fn sanitize_timestamp(iso: &str) -> String {
    iso.replace([':', '.'], "-")
}

#[must_use]
pub fn artifact_file_name(
    sanitized_timestamp: &str,
    backup_type: BackupType,
    compressed: bool,
    encrypted: bool,
) -> String {
    let mut name = format!("{sanitized_timestamp}-{backup_type}.sqlite");
    if compressed {
        name.push_str(".gz");
    }
    if encrypted {
        name.push_str(".enc");
    }
    name
}

#[must_use]
pub fn metadata_path(artifact: &Path) -> PathBuf {
    let mut raw = OsString::from(artifact.as_os_str());
    raw.push(METADATA_SUFFIX);
    PathBuf::from(raw)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CheckpointMode {
    Passive,
    Full,
    Restart,
    Truncate,
}

impl CheckpointMode {
    #[must_use]
    pub fn as_pragma_arg(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Full => "FULL",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

/// The live database as seen by the backup engine.
///
/// Maintenance calls (`checkpoint_wal`, `optimize`) are best-effort from the
/// engine's point of view; `count_rows` may fail per table.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    fn file_path(&self) -> &Path;

    async fn integrity_check(&self) -> anyhow::Result<bool>;

    async fn checkpoint_wal(&self, mode: CheckpointMode) -> anyhow::Result<()>;

    async fn optimize(&self) -> anyhow::Result<()>;

    async fn list_user_tables(&self) -> anyhow::Result<Vec<String>>;

    async fn count_rows(&self, table: &str) -> anyhow::Result<u64>;
}
