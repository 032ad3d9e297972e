//! Repository seam for history persistence.
//!
//! The download engine depends on this trait rather than on [`HistoryStore`]
//! directly, so tasks can share one `Arc<dyn HistoryRepository>`.

use async_trait::async_trait;
use url::Url;

use crate::domain::DomainKey;
use crate::media::MediaItem;

use super::{HistoryError, HistoryStore};

/// Data-access contract used by download tasks.
#[async_trait]
pub trait HistoryRepository: Send + Sync {
    /// True iff a completed row exists for `(domain, url_path(url))`.
    async fn check_complete(
        &self,
        domain: &DomainKey,
        url: &Url,
        referer: &Url,
    ) -> Result<bool, HistoryError>;

    /// Records an attempt with `completed = 0`.
    async fn insert_incomplete(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError>;

    /// Flips the item's row to completed.
    async fn mark_complete(&self, domain: &DomainKey, item: &MediaItem)
    -> Result<(), HistoryError>;

    /// Filename previously chosen for the item.
    async fn get_downloaded_filename(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<Option<String>, HistoryError>;

    /// True iff any row owns `filename`.
    async fn check_filename_exists(&self, filename: &str) -> Result<bool, HistoryError>;

    /// Backfills the album id on the item's row.
    async fn set_album_id(&self, domain: &DomainKey, item: &MediaItem)
    -> Result<(), HistoryError>;

    /// Releases the underlying connection.
    async fn close(&self);
}

#[async_trait]
impl HistoryRepository for HistoryStore {
    async fn check_complete(
        &self,
        domain: &DomainKey,
        url: &Url,
        referer: &Url,
    ) -> Result<bool, HistoryError> {
        HistoryStore::check_complete(self, domain, url, referer).await
    }

    async fn insert_incomplete(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        HistoryStore::insert_incomplete(self, domain, item).await
    }

    async fn mark_complete(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        HistoryStore::mark_complete(self, domain, item).await
    }

    async fn get_downloaded_filename(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<Option<String>, HistoryError> {
        HistoryStore::get_downloaded_filename(self, domain, item).await
    }

    async fn check_filename_exists(&self, filename: &str) -> Result<bool, HistoryError> {
        HistoryStore::check_filename_exists(self, filename).await
    }

    async fn set_album_id(
        &self,
        domain: &DomainKey,
        item: &MediaItem,
    ) -> Result<(), HistoryError> {
        HistoryStore::set_album_id(self, domain, item).await
    }

    async fn close(&self) {
        HistoryStore::close(self).await;
    }
}
