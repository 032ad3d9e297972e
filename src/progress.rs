//! Progress observation.
//!
//! The engine reports every task transition to a [`ProgressObserver`].
//! Observers never influence control flow; [`NoopObserver`] is the default
//! and [`DownloadStats`] keeps counters for summaries and tests.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::download::DownloadError;
use crate::media::MediaItem;

/// Why a task ended without streaming bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// History already holds a completed row.
    PreviouslyDownloaded,
    /// The item's media kind is excluded by config.
    Filtered,
    /// The target volume is below the free-space floor.
    NoSpace,
    /// A complete file was already on disk.
    AlreadyPresent,
    /// Recorded as complete without fetching (`skip_download_mark_completed`).
    MarkedComplete,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreviouslyDownloaded => "previously-downloaded",
            Self::Filtered => "filtered",
            Self::NoSpace => "no-space",
            Self::AlreadyPresent => "already-present",
            Self::MarkedComplete => "marked-complete",
        })
    }
}

/// Coarse bucket for a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureCategory {
    /// Non-retriable or exhausted HTTP status.
    Http(u16),
    /// Transport errors and timeouts.
    Network,
    /// HTML page served instead of media.
    UnexpectedContent,
    /// Short body.
    Integrity,
    /// Filesystem errors.
    Filesystem,
    /// Missing extension or no free filename.
    Naming,
    /// History store failure.
    History,
}

impl FailureCategory {
    #[must_use]
    pub fn of(error: &DownloadError) -> Self {
        match error {
            DownloadError::HttpStatus { status, .. } => Self::Http(*status),
            DownloadError::Network { .. } | DownloadError::Timeout { .. } => Self::Network,
            DownloadError::UnexpectedContent { .. } => Self::UnexpectedContent,
            DownloadError::Integrity { .. } => Self::Integrity,
            DownloadError::Io { .. } => Self::Filesystem,
            DownloadError::MissingExtension { .. } | DownloadError::UnresolvableFilename { .. } => {
                Self::Naming
            }
            DownloadError::History(_) => Self::History,
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(status) => write!(f, "HTTP {status}"),
            Self::Network => f.write_str("network"),
            Self::UnexpectedContent => f.write_str("unexpected content"),
            Self::Integrity => f.write_str("integrity"),
            Self::Filesystem => f.write_str("filesystem"),
            Self::Naming => f.write_str("naming"),
            Self::History => f.write_str("history"),
        }
    }
}

/// Receives task transitions. Every method defaults to doing nothing.
pub trait ProgressObserver: Send + Sync {
    /// Streaming is about to start; `expected_bytes` is the full size if known.
    fn task_added(&self, _item: &MediaItem, _expected_bytes: Option<u64>) {}

    /// `bytes` more bytes landed in the item's `.part` file.
    fn bytes_advanced(&self, _item: &MediaItem, _bytes: u64) {}

    fn task_completed(&self, _item: &MediaItem) {}

    fn task_skipped(&self, _item: &MediaItem, _reason: SkipReason) {}

    fn task_failed(&self, _item: &MediaItem, _category: FailureCategory) {}

    /// Attempt `attempt` (1-indexed) failed and another one is scheduled.
    fn task_retrying(&self, _item: &MediaItem, _attempt: u32) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Counters over one engine run.
///
/// Uses atomic counters so concurrent workers can update it without locking.
#[derive(Debug, Default)]
pub struct DownloadStats {
    added: AtomicUsize,
    completed: AtomicUsize,
    skipped: AtomicUsize,
    skipped_previously_downloaded: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    bytes: AtomicU64,
}

impl DownloadStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks that started streaming.
    #[must_use]
    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Skipped tasks, any reason.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn previously_downloaded(&self) -> usize {
        self.skipped_previously_downloaded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Retries scheduled across all tasks.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Bytes written across all tasks.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Tasks that reached a terminal state.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.skipped() + self.failed()
    }
}

impl ProgressObserver for DownloadStats {
    fn task_added(&self, _item: &MediaItem, _expected_bytes: Option<u64>) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_advanced(&self, _item: &MediaItem, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn task_completed(&self, _item: &MediaItem) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn task_skipped(&self, _item: &MediaItem, reason: SkipReason) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        if reason == SkipReason::PreviouslyDownloaded {
            self.skipped_previously_downloaded
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task_failed(&self, _item: &MediaItem, _category: FailureCategory) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn task_retrying(&self, _item: &MediaItem, _attempt: u32) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }
}

/// Forwards every call to each wrapped observer in order.
#[derive(Default)]
pub struct FanoutObserver {
    observers: Vec<std::sync::Arc<dyn ProgressObserver>>,
}

impl fmt::Debug for FanoutObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl FanoutObserver {
    #[must_use]
    pub fn new(observers: Vec<std::sync::Arc<dyn ProgressObserver>>) -> Self {
        Self { observers }
    }
}

impl ProgressObserver for FanoutObserver {
    fn task_added(&self, item: &MediaItem, expected_bytes: Option<u64>) {
        for observer in &self.observers {
            observer.task_added(item, expected_bytes);
        }
    }

    fn bytes_advanced(&self, item: &MediaItem, bytes: u64) {
        for observer in &self.observers {
            observer.bytes_advanced(item, bytes);
        }
    }

    fn task_completed(&self, item: &MediaItem) {
        for observer in &self.observers {
            observer.task_completed(item);
        }
    }

    fn task_skipped(&self, item: &MediaItem, reason: SkipReason) {
        for observer in &self.observers {
            observer.task_skipped(item, reason);
        }
    }

    fn task_failed(&self, item: &MediaItem, category: FailureCategory) {
        for observer in &self.observers {
            observer.task_failed(item, category);
        }
    }

    fn task_retrying(&self, item: &MediaItem, attempt: u32) {
        for observer in &self.observers {
            observer.task_retrying(item, attempt);
        }
    }
}
