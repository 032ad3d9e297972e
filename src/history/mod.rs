//! Persistent download history.
//!
//! The history store records every attempted download in the `media` table,
//! keyed by `(domain, url_path, original_filename)`. A row is inserted with
//! `completed = 0` before any bytes are written and flipped to `1` only after
//! the partial file has been renamed into place, so `(domain, url_path)` acts
//! as a dedup key across runs.
//!
//! # Example
//!
//! ```no_run
//! use mediafetch_core::{DomainKey, HistoryStore};
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let history = HistoryStore::open(Path::new("history.sqlite")).await?;
//! let url = url::Url::parse("https://cyberdrop.me/a.jpg")?;
//! let done = history
//!     .check_complete(&DomainKey::new("cyberdrop"), &url, &url)
//!     .await?;
//! println!("already downloaded: {done}");
//! # Ok(())
//! # }
//! ```

mod error;
mod repository;
mod schema;

use std::collections::HashMap;
use std::path::Path;

use sqlx::FromRow;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::db::Database;
use crate::domain::{DomainKey, UNKNOWN_DOMAIN};
use crate::media::MediaItem;

pub use error::{HistoryDbErrorKind, HistoryError};
pub use repository::HistoryRepository;

/// One row of the `media` table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct HistoryRecord {
    pub domain: String,
    pub url_path: String,
    pub referer: Option<String>,
    pub album_id: Option<String>,
    pub download_path: Option<String>,
    pub download_filename: Option<String>,
    pub original_filename: String,
    pub completed: i64,
    pub created_at: Option<String>,
    pub completed_at: Option<String>,
}

impl HistoryRecord {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed != 0
    }
}

/// An incomplete row, as surfaced to the retry-failed mode.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, serde::Serialize)]
pub struct FailedItem {
    pub referer: Option<String>,
    pub download_path: Option<String>,
}

/// SQLite-backed history store.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Database,
}

impl HistoryStore {
    /// Opens the store, runs migrations, and reserves space if needed.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] when the file cannot be opened or a
    /// migration fails.
    pub async fn open(path: &Path) -> Result<Self, HistoryError> {
        let store = Self::open_without_preallocation(path).await?;
        schema::preallocate(
            store.db.pool(),
            schema::PREALLOCATE_FREE_PAGE_THRESHOLD,
            schema::PREALLOCATE_BYTES,
        )
        .await?;
        Ok(store)
    }

    /// Opens the store and runs migrations without reserving space.
    ///
    /// # Errors
    ///
    /// Same as [`HistoryStore::open`].
    pub async fn open_without_preallocation(path: &Path) -> Result<Self, HistoryError> {
        let db = Database::new(path).await?;
        Self::from_database(db).await
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError`] when migrations fail.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let db = Database::new_in_memory().await?;
        Self::from_database(db).await
    }

    /// Wraps an existing database, running migrations first.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Migration`] when a migration step fails.
    pub async fn from_database(db: Database) -> Result<Self, HistoryError> {
        schema::migrate(db.pool()).await?;
        Ok(Self { db })
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// True iff a completed row exists for the URL's canonical path.
    ///
    /// A completed row whose stored referer differs from `referer` has its
    /// referer updated so [`HistoryStore::check_complete_by_referer`] keeps
    /// matching.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if a query fails.
    #[instrument(skip(self), fields(domain = %domain, url = %url))]
    pub async fn check_complete(
        &self,
        domain: &DomainKey,
        url: &Url,
        referer: &Url,
    ) -> Result<bool, HistoryError> {
        let url_path = domain.url_path(url);
        let rows: Vec<(Option<String>, i64)> =
            sqlx::query_as("SELECT referer, completed FROM media WHERE domain = ? AND url_path = ?")
                .bind(domain.as_str())
                .bind(&url_path)
                .fetch_all(self.db.pool())
                .await?;

        let Some((stored_referer, _)) = rows.iter().find(|(_, completed)| *completed != 0) else {
            return Ok(false);
        };

        if stored_referer.as_deref() != Some(referer.as_str()) {
            debug!(referer = %referer, "refreshing referer on completed row");
            sqlx::query("UPDATE media SET referer = ? WHERE domain = ? AND url_path = ?")
                .bind(referer.as_str())
                .bind(domain.as_str())
                .bind(&url_path)
                .execute(self.db.pool())
                .await?;
        }
        Ok(true)
    }

    /// True iff any completed row for `domain` carries `referer`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self), fields(domain = %domain))]
    pub async fn check_complete_by_referer(
        &self,
        domain: &DomainKey,
        referer: &Url,
    ) -> Result<bool, HistoryError> {
        let (found,): (i64,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM media WHERE domain = ? AND referer = ? AND completed = 1)",
        )
        .bind(domain.as_str())
        .bind(referer.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(found != 0)
    }

    /// Maps every `url_path` recorded for an album to its completion flag.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self), fields(domain = %domain))]
    pub async fn check_album(
        &self,
        domain: &DomainKey,
        album_id: &str,
    ) -> Result<HashMap<String, bool>, HistoryError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT url_path, completed FROM media WHERE domain = ? AND album_id = ?")
                .bind(domain.as_str())
                .bind(album_id)
                .fetch_all(self.db.pool())
                .await?;
        Ok(rows
            .into_iter()
            .map(|(url_path, completed)| (url_path, completed != 0))
            .collect())
    }

    /// Backfills `album_id` on the item's existing row.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the update fails.
    #[instrument(skip(self, item), fields(domain = %domain, url = %item.source_url()))]
    pub async fn set_album_id(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        sqlx::query("UPDATE media SET album_id = ? WHERE domain = ? AND url_path = ?")
            .bind(item.album_id())
            .bind(domain.as_str())
            .bind(item.url_path())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Records an attempt with `completed = 0`.
    ///
    /// A row left under the unknown domain for the same `(url_path, referer)`
    /// is moved to `domain`; if that move conflicts with an existing row the
    /// orphan is deleted. The item's current filename is always written back
    /// as `download_filename`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if a statement fails.
    #[instrument(skip(self, item), fields(domain = %domain, url = %item.source_url()))]
    pub async fn insert_incomplete(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        let url_path = item.url_path();
        let download_path = item.download_folder().to_string_lossy().into_owned();
        let mut tx = self.db.pool().begin().await?;

        if domain.as_str() != UNKNOWN_DOMAIN {
            let upgraded = sqlx::query(
                "UPDATE media SET domain = ?, album_id = ? \
                 WHERE domain = ? AND url_path = ? AND referer = ?",
            )
            .bind(domain.as_str())
            .bind(item.album_id())
            .bind(UNKNOWN_DOMAIN)
            .bind(&url_path)
            .bind(item.referer().as_str())
            .execute(&mut *tx)
            .await
            .map_err(HistoryError::from);

            match upgraded {
                Ok(result) if result.rows_affected() > 0 => {
                    debug!(rows = result.rows_affected(), "upgraded unknown-domain rows");
                }
                Ok(_) => {}
                Err(error) if error.is_constraint_violation() => {
                    warn!(%error, "unknown-domain row conflicts, removing orphan");
                    sqlx::query("DELETE FROM media WHERE domain = ? AND url_path = ?")
                        .bind(UNKNOWN_DOMAIN)
                        .bind(&url_path)
                        .execute(&mut *tx)
                        .await?;
                }
                Err(error) => return Err(error),
            }
        }

        sqlx::query(
            "INSERT OR IGNORE INTO media (domain, url_path, referer, album_id, download_path, \
             download_filename, original_filename, completed, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, CURRENT_TIMESTAMP)",
        )
        .bind(domain.as_str())
        .bind(&url_path)
        .bind(item.referer().as_str())
        .bind(item.album_id())
        .bind(&download_path)
        .bind(item.filename())
        .bind(item.original_filename())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE media SET download_filename = ?, download_path = ? \
             WHERE domain = ? AND url_path = ? AND original_filename = ?",
        )
        .bind(item.filename())
        .bind(&download_path)
        .bind(domain.as_str())
        .bind(&url_path)
        .bind(item.original_filename())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Flips the item's row to `completed = 1` and stamps `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the update fails.
    #[instrument(skip(self, item), fields(domain = %domain, url = %item.source_url()))]
    pub async fn mark_complete(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        sqlx::query(
            "UPDATE media SET completed = 1, completed_at = CURRENT_TIMESTAMP \
             WHERE domain = ? AND url_path = ?",
        )
        .bind(domain.as_str())
        .bind(item.url_path())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Filename previously chosen for this item, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self, item), fields(domain = %domain, url = %item.source_url()))]
    pub async fn get_downloaded_filename(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<Option<String>, HistoryError> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT download_filename FROM media \
             WHERE domain = ? AND url_path = ? AND original_filename = ?",
        )
        .bind(domain.as_str())
        .bind(item.url_path())
        .bind(item.original_filename())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row
            .and_then(|(name,)| name)
            .filter(|name| !name.is_empty()))
    }

    /// True iff any row already owns `filename`.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn check_filename_exists(&self, filename: &str) -> Result<bool, HistoryError> {
        let (found,): (i64,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM media WHERE download_filename = ?)")
                .bind(filename)
                .fetch_one(self.db.pool())
                .await?;
        Ok(found != 0)
    }

    /// Every incomplete row's referer and target directory.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_failed_items(&self) -> Result<Vec<FailedItem>, HistoryError> {
        let rows = sqlx::query_as::<_, FailedItem>(
            "SELECT referer, download_path FROM media WHERE completed = 0",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Full row for one primary key.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Database`] if the query fails.
    pub async fn get_record(
        &self,
        domain: &DomainKey,
        url_path: &str,
        original_filename: &str,
    ) -> Result<Option<HistoryRecord>, HistoryError> {
        let record = sqlx::query_as::<_, HistoryRecord>(
            "SELECT domain, url_path, referer, album_id, download_path, download_filename, \
             original_filename, completed, \
             CAST(created_at AS TEXT) AS created_at, CAST(completed_at AS TEXT) AS completed_at \
             FROM media WHERE domain = ? AND url_path = ? AND original_filename = ?",
        )
        .bind(domain.as_str())
        .bind(url_path)
        .bind(original_filename)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(record)
    }

    /// Closes the underlying pool.
    pub async fn close(&self) {
        self.db.pool().close().await;
    }
}
