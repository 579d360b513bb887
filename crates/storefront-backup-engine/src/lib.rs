//! Backup and restore engine for the storefront's embedded database.
//!
//! [`BackupService`] snapshots the live database through optional gzip and
//! AES-256-CBC stages, records a JSON sidecar per artifact, applies tiered
//! daily/monthly retention, and restores artifacts behind a safety copy with
//! automatic rollback on a failed integrity check.

mod backup;
pub mod checksum;
pub mod config;
pub mod crypto;
pub mod metadata;
mod pipeline;
pub mod retention;
mod restore;
pub mod safety;
mod service;

pub use checksum::sha256_file;
pub use config::BackupConfig;
pub use crypto::EncryptionKey;
pub use metadata::{MetadataListing, MetadataStore, StoredFiles};
pub use safety::SafetyCopy;
pub use service::BackupService;
pub use storefront_backup_core::{
    BackupError, BackupMetadata, BackupResult, BackupType, IntegrityStatus, ItemOutcome,
    RestoreReport, RotationReport, StatsReport,
};
