//! Persistence layer: SQLite via sqlx.
//!
//! Connection pool management, job models, and the ledger repository.

pub mod ledger;
pub mod models;
pub mod time;

pub use ledger::{JobLedger, SqliteLedger};

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};

use crate::{Error, Result};

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Busy timeout for lock contention between workers.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite readers don't benefit much beyond ~10 connections.
const MAX_POOL_SIZE: u32 = 10;

/// Compute a sensible pool size based on available CPU cores.
fn default_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_POOL_SIZE)
}

/// Initialize the connection pool with WAL mode, creating the database file
/// (and its parent directory) as needed.
pub async fn init_pool(db_path: &Path) -> Result<DbPool> {
    if let Some(parent) = db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::io_path("creating ledger directory", parent, e))?;
    }

    let connect_options = SqliteConnectOptions::new()
        .filename(db_path)
        // WAL for concurrent reads during writes
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Wait for locks instead of failing; workers contend on writes
        .busy_timeout(BUSY_TIMEOUT)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(default_pool_size())
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await?;

    tracing::debug!(path = %db_path.display(), "ledger pool initialized");

    Ok(pool)
}

/// Run embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::debug!("ledger migrations completed");
    Ok(())
}
