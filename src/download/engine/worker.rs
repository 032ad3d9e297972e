//! Per-host worker pools.
//!
//! Each domain gets one bounded FIFO queue and `workers_for_host` workers.
//! A worker holds one host permit and one global permit for the whole task,
//! including its retries.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use super::EngineShared;
use super::task::{self, TaskContext};
use crate::domain::DomainKey;
use crate::media::MediaItem;

/// Capacity of one host queue.
pub(super) const HOST_QUEUE_CAPACITY: usize = 512;

/// Queue handle for one domain.
#[derive(Debug, Clone)]
pub(super) struct HostPool {
    pub queue: mpsc::Sender<MediaItem>,
    pub workers: usize,
}

/// Starts the workers for `domain` and returns its queue.
pub(super) fn spawn_host_pool(
    domain: &DomainKey,
    configured_workers: usize,
    ctx: &Arc<TaskContext>,
    shared: &Arc<EngineShared>,
    global: &Arc<Semaphore>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) -> HostPool {
    let workers = domain.workers_for_host(configured_workers);
    let (tx, rx) = mpsc::channel(HOST_QUEUE_CAPACITY);
    let rx = Arc::new(Mutex::new(rx));
    let host_permits = Arc::new(Semaphore::new(workers));
    info!(%domain, workers, "starting host worker pool");

    for worker_id in 0..workers {
        let worker = Worker {
            id: worker_id,
            domain: domain.clone(),
            queue: Arc::clone(&rx),
            host_permits: Arc::clone(&host_permits),
            global_permits: Arc::clone(global),
            ctx: Arc::clone(ctx),
            shared: Arc::clone(shared),
            cancel: cancel.clone(),
        };
        tracker.spawn(worker.run());
    }

    HostPool { queue: tx, workers }
}

struct Worker {
    id: usize,
    domain: DomainKey,
    queue: Arc<Mutex<mpsc::Receiver<MediaItem>>>,
    host_permits: Arc<Semaphore>,
    global_permits: Arc<Semaphore>,
    ctx: Arc<TaskContext>,
    shared: Arc<EngineShared>,
    cancel: CancellationToken,
}

impl Worker {
    #[instrument(skip_all, fields(domain = %self.domain, worker = self.id))]
    async fn run(self) {
        loop {
            let Some(item) = self.next_item().await else {
                break;
            };

            let permits = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permits = acquire_both(&self.host_permits, &self.global_permits) => permits,
            };
            let Some(_permits) = permits else {
                break;
            };

            let url = item.source_url().clone();
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!(url = %url, "download cancelled, partial kept for resume");
                    None
                }
                outcome = task::run(&self.ctx, item) => Some(outcome),
            };
            let Some(outcome) = outcome else {
                break;
            };

            if let Some(cause) = outcome.fatal_cause() {
                error!(error = %cause, "history store failed, stopping engine");
                self.shared.record_fatal(cause.clone());
                self.cancel.cancel();
            }
            self.shared.finish_one();
        }
        debug!("worker stopped");
    }

    async fn next_item(&self) -> Option<MediaItem> {
        let mut queue = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return None,
            queue = self.queue.lock() => queue,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            item = queue.recv() => item,
        }
    }
}

async fn acquire_both(
    host: &Arc<Semaphore>,
    global: &Arc<Semaphore>,
) -> Option<(tokio::sync::OwnedSemaphorePermit, tokio::sync::OwnedSemaphorePermit)> {
    let host = Arc::clone(host).acquire_owned().await.ok()?;
    let global = Arc::clone(global).acquire_owned().await.ok()?;
    Some((host, global))
}
