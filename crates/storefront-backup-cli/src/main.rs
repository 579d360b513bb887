use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use storefront_backup_core::BackupType;
use storefront_backup_engine::config::{
    DEFAULT_BACKUP_DIR, DEFAULT_DAILY_RETENTION, DEFAULT_DATABASE_URL, DEFAULT_MONTHLY_RETENTION,
};
use storefront_backup_engine::{BackupConfig, BackupService};
use storefront_backup_store_sqlite::SqliteDatabase;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "sbk.v1";

#[derive(Debug, Parser)]
#[command(name = "sbk")]
#[command(about = "Storefront database backup CLI")]
struct Cli {
    #[arg(long, env = "BACKUP_DIR", default_value = DEFAULT_BACKUP_DIR)]
    backup_dir: PathBuf,

    /// Live database path or `file:` URI.
    #[arg(long, env = "DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database_url: String,

    /// Passphrase for artifact encryption; unset or empty disables encryption.
    #[arg(long, env = "BACKUP_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    #[arg(
        long,
        env = "BACKUP_DAILY_RETENTION",
        default_value_t = DEFAULT_DAILY_RETENTION,
        value_parser = parse_retention
    )]
    daily_retention: usize,

    #[arg(
        long,
        env = "BACKUP_MONTHLY_RETENTION",
        default_value_t = DEFAULT_MONTHLY_RETENTION,
        value_parser = parse_retention
    )]
    monthly_retention: usize,

    #[arg(
        long,
        env = "BACKUP_COMPRESS",
        default_value_t = true,
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    compress: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Snapshot the live database and apply retention.
    Create(CreateArgs),
    /// List backups, newest first.
    List,
    /// Replace the live database with a backup (relative paths resolve in the backup dir).
    Restore(PathArgs),
    /// Recompute an artifact checksum and compare it with its metadata.
    Verify(PathArgs),
    IntegrityCheck,
    /// Apply retention without creating a backup.
    Rotate,
    SafetyCopies {
        #[command(subcommand)]
        command: SafetyCopiesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SafetyCopiesCommand {
    List,
    Prune(PruneArgs),
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(long = "type", value_enum, default_value_t = BackupKind::Full)]
    kind: BackupKind,
}

#[derive(Debug, Args)]
struct PathArgs {
    path: PathBuf,
}

#[derive(Debug, Args)]
struct PruneArgs {
    /// Number of newest safety copies to keep.
    #[arg(long)]
    keep: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackupKind {
    Full,
    Incremental,
}

impl From<BackupKind> for BackupType {
    fn from(kind: BackupKind) -> Self {
        match kind {
            BackupKind::Full => Self::Full,
            BackupKind::Incremental => Self::Incremental,
        }
    }
}

fn parse_retention(raw: &str) -> Result<usize, String> {
    let value: usize = raw.parse().map_err(|err| format!("invalid retention count `{raw}`: {err}"))?;
    if value == 0 {
        return Err("retention count must be at least 1".to_string());
    }
    Ok(value)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr so stdout stays machine-readable.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

impl Cli {
    fn backup_config(&self) -> BackupConfig {
        BackupConfig {
            backup_dir: self.backup_dir.clone(),
            db_path: self.database_url.clone(),
            encryption_key: self.encryption_key.clone().filter(|key| !key.is_empty()),
            daily_retention: self.daily_retention,
            monthly_retention: self.monthly_retention,
            compress: self.compress,
        }
    }
}

fn build_service(config: &BackupConfig) -> Result<BackupService> {
    let db_path = config.resolve_db_path()?;
    let db = Arc::new(SqliteDatabase::new(db_path));
    BackupService::new(config, db).context("failed to initialize backup service")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let service = build_service(&cli.backup_config())?;

    match cli.command {
        Command::Create(args) => run_create(&service, args.kind.into()).await,
        Command::List => run_list(&service).await,
        Command::Restore(args) => run_restore(&service, args.path).await,
        Command::Verify(args) => run_verify(&service, args.path).await,
        Command::IntegrityCheck => run_integrity_check(&service).await,
        Command::Rotate => run_rotate(&service).await,
        Command::SafetyCopies { command } => run_safety_copies(&service, command).await,
    }
}

async fn run_create(service: &BackupService, backup_type: BackupType) -> Result<()> {
    let result = service.create_backup(backup_type).await.context("backup failed")?;
    emit_json(serde_json::to_value(&result).context("failed to serialize backup result")?)
}

async fn run_list(service: &BackupService) -> Result<()> {
    let listing = service.scan_backups().await.context("failed to list backups")?;
    emit_json(serde_json::json!({
        "backup_dir": service.backup_dir(),
        "backups": listing.entries,
        "skipped": listing.skipped,
    }))
}

async fn run_restore(service: &BackupService, path: PathBuf) -> Result<()> {
    let report = service
        .restore_backup(&path)
        .await
        .with_context(|| format!("restore from {} failed", path.display()))?;
    emit_json(serde_json::to_value(&report).context("failed to serialize restore report")?)
}

async fn run_verify(service: &BackupService, path: PathBuf) -> Result<()> {
    let metadata = service
        .verify_backup(&path)
        .await
        .with_context(|| format!("verification of {} failed", path.display()))?;
    emit_json(serde_json::json!({
        "verified": true,
        "path": metadata.path,
        "checksum": metadata.checksum,
    }))
}

async fn run_integrity_check(service: &BackupService) -> Result<()> {
    let ok = service.check_integrity().await;
    emit_json(serde_json::json!({
        "db_path": service.db_path(),
        "integrity_ok": ok,
    }))?;
    if !ok {
        bail!("integrity check failed for {}", service.db_path().display());
    }
    Ok(())
}

async fn run_rotate(service: &BackupService) -> Result<()> {
    let report = service.rotate().await.context("rotation failed")?;
    emit_json(serde_json::to_value(&report).context("failed to serialize rotation report")?)
}

async fn run_safety_copies(service: &BackupService, command: SafetyCopiesCommand) -> Result<()> {
    match command {
        SafetyCopiesCommand::List => {
            let copies = service.list_safety_copies().await.context("failed to list safety copies")?;
            emit_json(serde_json::json!({ "safety_copies": copies }))
        }
        SafetyCopiesCommand::Prune(args) => {
            let removed = service
                .prune_safety_copies(args.keep)
                .await
                .context("failed to prune safety copies")?;
            emit_json(serde_json::json!({ "keep": args.keep, "removed": removed }))
        }
    }
}
