use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use storefront_backup_core::{CheckpointMode, DatabaseHandle};

const LIST_USER_TABLES_SQL: &str = r"
SELECT name FROM sqlite_master
WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
ORDER BY name
";

/// Live storefront database addressed by file path.
///
/// Every call opens a short-lived connection on a blocking thread, so the handle
/// always sees whatever file currently sits at `path` (including one swapped in by
/// a restore).
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Run every row of `PRAGMA integrity_check` and return the messages.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or the pragma fails.
    pub async fn integrity_messages(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("PRAGMA integrity_check")
                .context("failed to prepare PRAGMA integrity_check")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut messages = Vec::new();
            for row in rows {
                messages.push(row.context("failed to read PRAGMA integrity_check row")?);
            }
            Ok(messages)
        })
        .await
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path)?;
            f(&conn)
        })
        .await
        .context("sqlite worker task failed")?
    }
}

fn open_connection(path: &Path) -> Result<Connection> {
    // No SQLITE_OPEN_CREATE: probing a missing database must not create an empty one.
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch("PRAGMA busy_timeout = 5000;")
        .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[async_trait]
impl DatabaseHandle for SqliteDatabase {
    fn file_path(&self) -> &Path {
        &self.path
    }

    async fn integrity_check(&self) -> Result<bool> {
        let messages = self.integrity_messages().await?;
        let ok = messages.len() == 1 && messages[0] == "ok";
        if !ok {
            tracing::debug!(
                path = %self.path.display(),
                problems = messages.len(),
                first = messages.first().map_or("", String::as_str),
                "integrity_check reported problems"
            );
        }
        Ok(ok)
    }

    async fn checkpoint_wal(&self, mode: CheckpointMode) -> Result<()> {
        self.with_connection(move |conn| {
            let sql = format!("PRAGMA wal_checkpoint({})", mode.as_pragma_arg());
            let (busy, log_frames, checkpointed) = conn
                .query_row(&sql, [], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
                })
                .with_context(|| format!("failed to run {sql}"))?;

            if busy != 0 {
                return Err(anyhow!(
                    "wal checkpoint was blocked: {checkpointed} of {log_frames} frames checkpointed"
                ));
            }
            Ok(())
        })
        .await
    }

    async fn optimize(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch("PRAGMA optimize;").context("failed to run PRAGMA optimize")
        })
        .await
    }

    async fn list_user_tables(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt =
                conn.prepare(LIST_USER_TABLES_SQL).context("failed to prepare table listing")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut tables = Vec::new();
            for row in rows {
                tables.push(row.context("failed to read table name")?);
            }
            Ok(tables)
        })
        .await
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.with_connection(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(&table));
            let count = conn
                .query_row(&sql, [], |row| row.get::<_, i64>(0))
                .with_context(|| format!("failed to count rows in {table}"))?;
            u64::try_from(count).with_context(|| format!("negative row count for {table}"))
        })
        .await
    }
}
