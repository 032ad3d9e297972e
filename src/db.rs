//! SQLite connection setup for the history store.
//!
//! File-backed databases run in WAL mode with a busy timeout, so a second
//! process reading the same history waits instead of failing. The pool holds
//! a single connection and writes serialize through it. Tables and
//! migrations live in [`crate::history`].
//!
//! ```no_run
//! use mediafetch_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(Path::new("downloads/history.sqlite")).await?;
//! db.close().await;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

const MAX_CONNECTIONS: u32 = 1;

/// How long a statement waits on a locked database before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to connect to database: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("failed to create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Pooled SQLite handle.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database file, creating it and its parent directory.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Directory`] when the parent directory cannot be
    /// created and [`DbError::Connection`] when SQLite refuses the file.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn new(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::Directory {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = Self::pool_options().connect_with(options).await?;
        debug!("history database opened");
        Ok(Self { pool })
    }

    /// Private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if SQLite cannot start.
    #[instrument]
    pub async fn new_in_memory() -> Result<Self, DbError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = Self::pool_options().connect_with(options).await?;
        Ok(Self { pool })
    }

    fn pool_options() -> SqlitePoolOptions {
        // An idle in-memory connection must never be reaped or its data is lost.
        SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .idle_timeout(None)
            .max_lifetime(None)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Current journal mode, lowercased.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma query fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_ascii_lowercase())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
