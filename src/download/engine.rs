//! Download orchestrator.
//!
//! The [`DownloadEngine`] accepts [`MediaItem`]s on one ingestion channel,
//! routes each to the worker pool of its domain (started lazily on the
//! first item), and reports completion through [`DownloadEngine::wait_all`].
//!
//! # Concurrency Model
//!
//! - One bounded queue and `workers_for_host` workers per domain
//! - A per-host semaphore and a global semaphore gate every task, retries included
//! - A [`CancellationToken`] stops every worker at its next suspension point
//! - A history store failure records a fatal error and cancels the engine
//!
//! # Example
//!
//! ```no_run
//! use mediafetch_core::{DownloadEngine, EngineConfig, MediaItem};
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let engine = DownloadEngine::builder(config).build().await?;
//! let item = MediaItem::new(Url::parse("https://cyberdrop.me/f/a.jpg")?, "downloads/album")?;
//! engine.submit(item).await?;
//! engine.wait_all().await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod persistence;
mod task;
mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

pub use persistence::ErrorLog;

use self::task::TaskContext;
use self::worker::{HostPool, spawn_host_pool};
use super::client::ClientPool;
use super::file_lock::FileLockRegistry;
use super::retry::RetryPolicy;
use crate::config::{ConfigError, EngineConfig};
use crate::domain::DomainKey;
use crate::history::{HistoryError, HistoryRepository, HistoryStore};
use crate::media::MediaItem;
use crate::progress::{NoopObserver, ProgressObserver};

/// Capacity of the ingestion channel.
const INGEST_CAPACITY: usize = 1024;

/// Default error log file name under `download_root`.
const DEFAULT_ERROR_LOG_NAME: &str = "download_errors.csv";

/// Error type for download engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The history store could not be opened or migrated.
    #[error("history store error: {0}")]
    History(#[from] HistoryError),

    /// The shared HTTP client could not be built.
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),

    /// A task hit a history store failure and the engine stopped.
    #[error("engine stopped after history store failure: {0}")]
    Fatal(HistoryError),

    /// The engine no longer accepts items.
    #[error("engine is shut down")]
    Closed,
}

/// State shared between the engine handle and its workers.
#[derive(Debug)]
pub(crate) struct EngineShared {
    /// Items accepted but not yet terminal.
    pending: watch::Sender<usize>,
    fatal: Mutex<Option<HistoryError>>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            pending: watch::Sender::new(0),
            fatal: Mutex::new(None),
        }
    }

    fn add_one(&self) {
        self.pending.send_modify(|pending| *pending += 1);
    }

    pub(crate) fn finish_one(&self) {
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    pub(crate) fn record_fatal(&self, cause: HistoryError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(cause);
        }
    }

    fn fatal(&self) -> Option<HistoryError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Cloneable handle for feeding items into a running engine.
#[derive(Debug, Clone)]
pub struct ItemSender {
    tx: mpsc::Sender<MediaItem>,
    shared: Arc<EngineShared>,
}

impl ItemSender {
    /// Enqueues `item`, waiting while the ingestion channel is full.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the engine has shut down.
    pub async fn send(&self, item: MediaItem) -> Result<(), EngineError> {
        self.shared.add_one();
        if self.tx.send(item).await.is_err() {
            self.shared.finish_one();
            return Err(EngineError::Closed);
        }
        Ok(())
    }
}

/// Configures and starts a [`DownloadEngine`].
pub struct EngineBuilder {
    config: EngineConfig,
    observer: Option<Arc<dyn ProgressObserver>>,
    history: Option<Arc<dyn HistoryRepository>>,
    retry_policy: Option<RetryPolicy>,
    locks: Option<FileLockRegistry>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("custom_observer", &self.observer.is_some())
            .field("custom_history", &self.history.is_some())
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Receives task transitions; defaults to [`NoopObserver`].
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Uses an already-open history store instead of opening
    /// [`EngineConfig::history_db_path`].
    #[must_use]
    pub fn history(mut self, history: Arc<dyn HistoryRepository>) -> Self {
        self.history = Some(history);
        self
    }

    /// Overrides the policy derived from `attempts`/`disable_attempt_limit`.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Uses a custom file lock registry.
    #[must_use]
    pub fn file_locks(mut self, locks: FileLockRegistry) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Validates config, opens shared services and starts the router.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] when the configuration is invalid, the
    /// history store cannot be opened, or the HTTP client cannot be built.
    #[instrument(skip(self), fields(download_root = %self.config.download_root.display()))]
    pub async fn build(self) -> Result<DownloadEngine, EngineError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let history: Arc<dyn HistoryRepository> = match self.history {
            Some(history) => history,
            None => {
                let path = config.history_db_path();
                info!(path = %path.display(), "opening history store");
                Arc::new(HistoryStore::open(&path).await?)
            }
        };
        let clients = Arc::new(ClientPool::new(&config)?);
        let error_log_path = config
            .error_log
            .clone()
            .unwrap_or_else(|| config.download_root.join(DEFAULT_ERROR_LOG_NAME));
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| RetryPolicy::from_config(&config));

        debug!(
            max_workers_global = config.max_workers_global,
            max_workers_per_host = config.max_workers_per_host,
            max_attempts = retry_policy.max_attempts(),
            unlimited_attempts = retry_policy.is_unlimited(),
            "creating download engine"
        );

        let attempts = Arc::new(DashMap::new());
        let ctx = Arc::new(TaskContext {
            config: Arc::clone(&config),
            history: Arc::clone(&history),
            clients,
            locks: self.locks.unwrap_or_default(),
            retry_policy,
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            error_log: Some(Arc::new(ErrorLog::new(error_log_path))),
            attempts: Arc::clone(&attempts),
        });

        let shared = Arc::new(EngineShared::new());
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (tx, rx) = mpsc::channel(INGEST_CAPACITY);

        let router = Router {
            rx,
            pools: HashMap::new(),
            ctx,
            shared: Arc::clone(&shared),
            global: Arc::new(Semaphore::new(config.max_workers_global)),
            tracker: tracker.clone(),
            cancel: cancel.clone(),
            configured_workers: config.max_workers_per_host,
        };
        tracker.spawn(router.run());

        Ok(DownloadEngine {
            sender: ItemSender {
                tx,
                shared: Arc::clone(&shared),
            },
            shared,
            history,
            attempts,
            cancel,
            tracker,
        })
    }
}

/// Running download engine.
pub struct DownloadEngine {
    sender: ItemSender,
    shared: Arc<EngineShared>,
    history: Arc<dyn HistoryRepository>,
    attempts: Arc<DashMap<String, u32>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for DownloadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("pending", &self.pending())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl DownloadEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            observer: None,
            history: None,
            retry_policy: None,
            locks: None,
        }
    }

    /// A handle extractors can clone to feed items concurrently.
    #[must_use]
    pub fn sender(&self) -> ItemSender {
        self.sender.clone()
    }

    /// Enqueues one item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Closed`] once the engine has shut down.
    pub async fn submit(&self, item: MediaItem) -> Result<(), EngineError> {
        self.sender.send(item).await
    }

    /// Items accepted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        *self.shared.pending.borrow()
    }

    /// Attempts made so far for a canonical `url_path`.
    #[must_use]
    pub fn attempts(&self, url_path: &str) -> u32 {
        self.attempts.get(url_path).map_or(0, |entry| *entry)
    }

    /// Token that stops every worker when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels in-flight and queued work. Partial files stay on disk.
    pub fn cancel(&self) {
        info!("cancelling download engine");
        self.cancel.cancel();
    }

    /// Waits until every accepted item reached a terminal state or the
    /// engine was cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fatal`] when a task hit a history store failure.
    pub async fn wait_all(&self) -> Result<(), EngineError> {
        let mut pending = self.shared.pending.subscribe();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => debug!("wait interrupted by cancellation"),
            result = pending.wait_for(|count| *count == 0) => {
                if result.is_err() {
                    warn!("pending counter closed");
                }
            }
        }
        match self.shared.fatal() {
            Some(cause) => Err(EngineError::Fatal(cause)),
            None => Ok(()),
        }
    }

    /// Stops workers, then closes the history store.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.history.close().await;
        info!("download engine shut down");
    }
}

/// Moves items from the ingestion channel to their host queues.
struct Router {
    rx: mpsc::Receiver<MediaItem>,
    pools: HashMap<DomainKey, HostPool>,
    ctx: Arc<TaskContext>,
    shared: Arc<EngineShared>,
    global: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    configured_workers: usize,
}

impl Router {
    async fn run(mut self) {
        loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                item = self.rx.recv() => item,
            };
            let Some(item) = item else {
                break;
            };
            let domain = item.domain().clone();
            let pool = self.pools.entry(domain.clone()).or_insert_with(|| {
                spawn_host_pool(
                    &domain,
                    self.configured_workers,
                    &self.ctx,
                    &self.shared,
                    &self.global,
                    &self.tracker,
                    &self.cancel,
                )
            });
            debug!(%domain, workers = pool.workers, url = %item.source_url(), "routing item");

            let queue = pool.queue.clone();
            let sent = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                sent = queue.send(item) => sent,
            };
            if sent.is_err() {
                warn!(%domain, "host queue closed, dropping item");
                self.shared.finish_one();
            }
        }
        debug!(hosts = self.pools.len(), "router stopped");
    }
}
