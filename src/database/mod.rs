pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{LedgerError, LedgerResult};

pub use memory::MemoryStore;
pub use store::{AppendOutcome, LedgerStore};

/// SQLite-backed ledger store
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> LedgerResult<Self> {
        Self::with_max_connections(database_url, 8).await
    }

    pub async fn with_max_connections(database_url: &str, max_connections: u32) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| LedgerError::Config(format!("Invalid database URL {}: {}", database_url, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        info!("Connected to ledger database: {}", database_url);
        Ok(Database { pool })
    }

    /// Open an existing ledger for inspection only.
    ///
    /// Never creates the file and never switches its journal mode, so an
    /// auditor's copy is left untouched.
    pub async fn open_read_only(database_url: &str) -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| LedgerError::Config(format!("Invalid database URL {}: {}", database_url, e)))?
            .read_only(true)
            .create_if_missing(false);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        info!("Opened ledger database read-only: {}", database_url);
        Ok(Database { pool })
    }

    /// Private in-memory database; a single connection keeps every query on the same instance.
    pub async fn new_in_memory() -> LedgerResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| LedgerError::Config(format!("Invalid in-memory URL: {}", e)))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let database = Database { pool };
        database.run_migrations().await?;
        Ok(database)
    }

    pub async fn run_migrations(&self) -> LedgerResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite reports lock contention as SQLITE_BUSY (5) or one of its extended codes.
pub(crate) fn is_busy(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map_or(false, |code| code & 0xff == 5),
        _ => false,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}
