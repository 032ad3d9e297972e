//! Single-item download state machine.
//!
//! ```text
//! CHECK_HISTORY -> CHECK_FILE_TYPE -> CHECK_FREE_SPACE -> ACQUIRE_FILE_LOCK
//!   -> RESOLVE_FILENAME -> INSERT_INCOMPLETE -> COMPUTE_RESUME -> STREAM
//!   -> RENAME -> MARK_COMPLETE
//! ```
//!
//! Every exit path drops the [`FileLockGuard`](crate::download::file_lock::FileLockGuard),
//! including cancellation, which drops the whole future. A cancelled task
//! leaves its `.part` file in place and its history row incomplete.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::persistence::ErrorLog;
use crate::config::EngineConfig;
use crate::download::client::{ClientPool, HostClient};
use crate::download::error::DownloadError;
use crate::download::file_lock::FileLockRegistry;
use crate::download::filename::{collision_candidate, part_path};
use crate::download::rate_limiter::parse_retry_after;
use crate::download::retry::{RetryDecision, RetryPolicy, classify_error};
use crate::history::{HistoryError, HistoryRepository};
use crate::media::MediaItem;
use crate::progress::{FailureCategory, ProgressObserver, SkipReason};

/// Highest `" (i)"` suffix tried before giving up on a name.
const MAX_COLLISION_INDEX: u32 = 9_999;

/// Shared services handed to every task.
pub(crate) struct TaskContext {
    pub config: Arc<EngineConfig>,
    pub history: Arc<dyn HistoryRepository>,
    pub clients: Arc<ClientPool>,
    pub locks: FileLockRegistry,
    pub retry_policy: RetryPolicy,
    pub observer: Arc<dyn ProgressObserver>,
    pub error_log: Option<Arc<ErrorLog>>,
    /// Attempts made so far, keyed by canonical `url_path`.
    pub attempts: Arc<DashMap<String, u32>>,
}

impl TaskContext {
    fn next_attempt(&self, url_path: &str) -> u32 {
        let mut entry = self.attempts.entry(url_path.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        *entry
    }

    /// Sleeps before the next attempt, or hands the error back when the
    /// policy gives up.
    async fn backoff(
        &self,
        item: &MediaItem,
        error: DownloadError,
        attempt: u32,
    ) -> Result<(), DownloadError> {
        let failure = classify_error(&error);
        match self.retry_policy.should_retry(failure, attempt) {
            RetryDecision::Retry { delay, attempt: next } => {
                let server_delay = match &error {
                    DownloadError::HttpStatus {
                        retry_after: Some(value),
                        ..
                    } => parse_retry_after(value),
                    _ => None,
                };
                let delay = server_delay.map_or(delay, |server| server.max(delay));
                info!(
                    url = %item.source_url(),
                    attempt = next,
                    delay_ms = delay.as_millis(),
                    using_retry_after = server_delay.is_some(),
                    error = %error,
                    "retrying download"
                );
                self.observer.task_retrying(item, attempt);
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(url = %item.source_url(), %reason, attempt, "not retrying download");
                Err(error)
            }
        }
    }
}

/// Terminal state of one task.
#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Completed(PathBuf),
    Skipped(SkipReason),
    Failed(DownloadError),
}

impl TaskOutcome {
    /// The history failure that must stop the engine, if any.
    pub fn fatal_cause(&self) -> Option<&HistoryError> {
        match self {
            Self::Failed(DownloadError::History(cause)) => Some(cause),
            _ => None,
        }
    }
}

enum Resolution {
    /// Stream into the item's current name.
    Proceed,
    /// A complete file is already on disk and recorded.
    AlreadyPresent,
}

/// Runs `item` to a terminal state and reports it to the observer.
#[instrument(skip_all, fields(url = %item.source_url(), domain = %item.domain()))]
pub(crate) async fn run(ctx: &TaskContext, item: MediaItem) -> TaskOutcome {
    let (item, outcome) = drive(ctx, item).await;
    match &outcome {
        TaskOutcome::Completed(path) => {
            info!(path = %path.display(), "download complete");
            ctx.observer.task_completed(&item);
        }
        TaskOutcome::Skipped(reason) => {
            debug!(%reason, "download skipped");
            ctx.observer.task_skipped(&item, *reason);
        }
        TaskOutcome::Failed(error) => {
            warn!(error = %error, "download failed");
            if let Some(log) = &ctx.error_log {
                log.record(&item, &error.to_string()).await;
            }
            ctx.observer.task_failed(&item, FailureCategory::of(error));
        }
    }
    outcome
}

async fn drive(ctx: &TaskContext, item: MediaItem) -> (MediaItem, TaskOutcome) {
    let mut item = item.with_name_limits(
        ctx.config.max_filename_length,
        ctx.config.max_folder_name_length,
    );
    let outcome = match steps(ctx, &mut item).await {
        Ok(outcome) => outcome,
        Err(error) => TaskOutcome::Failed(error),
    };
    (item, outcome)
}

async fn steps(ctx: &TaskContext, item: &mut MediaItem) -> Result<TaskOutcome, DownloadError> {
    let domain = item.domain().clone();

    if ctx
        .history
        .check_complete(&domain, item.source_url(), item.referer())
        .await?
    {
        if item.album_id().is_some() {
            ctx.history.set_album_id(&domain, item).await?;
        }
        return Ok(TaskOutcome::Skipped(SkipReason::PreviouslyDownloaded));
    }

    if ctx.config.is_excluded(item.kind()) {
        return Ok(TaskOutcome::Skipped(SkipReason::Filtered));
    }

    let folder = item.download_folder().to_path_buf();
    tokio::fs::create_dir_all(&folder)
        .await
        .map_err(|e| DownloadError::io(&folder, e))?;
    if !has_free_space(&folder, ctx.config.required_free_space_bytes()).await {
        return Ok(TaskOutcome::Skipped(SkipReason::NoSpace));
    }

    let _lock = ctx.locks.acquire(item.original_filename()).await;
    let host = ctx.clients.host(&domain);

    let mut expected: Option<Option<u64>> = None;
    let resolution = resolve_filename(ctx, &host, item, &mut expected).await?;
    if matches!(resolution, Resolution::AlreadyPresent) {
        return Ok(TaskOutcome::Skipped(SkipReason::AlreadyPresent));
    }

    ctx.history.insert_incomplete(&domain, item).await?;

    if ctx.config.skip_download_mark_completed {
        ctx.history.mark_complete(&domain, item).await?;
        return Ok(TaskOutcome::Skipped(SkipReason::MarkedComplete));
    }

    if item.ext().is_empty() {
        return Err(DownloadError::MissingExtension {
            url: item.source_url().to_string(),
        });
    }

    let final_path = item.final_path();
    let part = part_path(&final_path);
    let url_path = item.url_path();
    let mut announced = false;
    loop {
        let attempt = ctx.next_attempt(&url_path);
        match stream_once(ctx, &host, item, &part, expected.flatten(), &mut announced).await {
            Ok(()) => break,
            Err(error) => ctx.backoff(item, error, attempt).await?,
        }
    }

    finalize(item, &part, &final_path).await?;
    ctx.history.mark_complete(&domain, item).await?;
    Ok(TaskOutcome::Completed(final_path))
}

/// Picks the final name, rebinding `item.filename` when needed.
///
/// `expected` caches the size probe so it runs at most once per task.
async fn resolve_filename(
    ctx: &TaskContext,
    host: &HostClient,
    item: &mut MediaItem,
    expected: &mut Option<Option<u64>>,
) -> Result<Resolution, DownloadError> {
    let domain = item.domain().clone();
    let mut rebound = false;

    loop {
        let final_path = item.final_path();
        let part = part_path(&final_path);
        let final_len = file_len(&final_path).await;
        let part_len = file_len(&part).await;

        if final_len.is_none() && part_len.is_none() {
            return Ok(Resolution::Proceed);
        }

        let expected_size = match *expected {
            Some(size) => size,
            None => {
                let size = probe_with_retry(ctx, host, item).await?;
                *expected = Some(size);
                size
            }
        };

        if final_len.is_some() && final_len == expected_size {
            debug!(path = %final_path.display(), "complete file already on disk");
            ctx.history.insert_incomplete(&domain, item).await?;
            ctx.history.mark_complete(&domain, item).await?;
            return Ok(Resolution::AlreadyPresent);
        }

        match ctx.history.get_downloaded_filename(&domain, item).await? {
            Some(stored) if stored == item.filename() => {
                if part_len.is_some() && part_len == expected_size {
                    finalize(item, &part, &final_path).await?;
                    ctx.history.insert_incomplete(&domain, item).await?;
                    ctx.history.mark_complete(&domain, item).await?;
                    return Ok(Resolution::AlreadyPresent);
                }
                if final_len.is_none() {
                    debug!(part = %part.display(), ?part_len, "resuming recorded partial");
                    return Ok(Resolution::Proceed);
                }
            }
            Some(stored) if !rebound => {
                debug!(from = item.filename(), to = %stored, "rebinding to recorded filename");
                item.rebind_filename(stored);
                rebound = true;
                continue;
            }
            _ => {}
        }

        let name = free_collision_name(ctx, item).await?;
        info!(from = item.filename(), to = %name, "filename collision resolved");
        item.rebind_filename(name);
        return Ok(Resolution::Proceed);
    }
}

async fn free_collision_name(ctx: &TaskContext, item: &MediaItem) -> Result<String, DownloadError> {
    for index in 1..=MAX_COLLISION_INDEX {
        let candidate = collision_candidate(item.filename(), index, ctx.config.max_filename_length);
        let path = item.download_folder().join(&candidate);
        if file_len(&path).await.is_some() || file_len(&part_path(&path)).await.is_some() {
            continue;
        }
        if ctx.history.check_filename_exists(&candidate).await? {
            continue;
        }
        return Ok(candidate);
    }
    Err(DownloadError::UnresolvableFilename {
        folder: item.download_folder().to_path_buf(),
        filename: item.filename().to_string(),
    })
}

async fn probe_with_retry(
    ctx: &TaskContext,
    host: &HostClient,
    item: &MediaItem,
) -> Result<Option<u64>, DownloadError> {
    let url_path = item.url_path();
    loop {
        let attempt = ctx.next_attempt(&url_path);
        match host.probe_size(item).await {
            Ok(size) => return Ok(size),
            Err(error) => ctx.backoff(item, error, attempt).await?,
        }
    }
}

/// One attempt at filling `part` from the server.
///
/// Appends to an existing partial when the server honours the range and
/// restarts from zero when it answers with the full body.
async fn stream_once(
    ctx: &TaskContext,
    host: &HostClient,
    item: &MediaItem,
    part: &Path,
    expected: Option<u64>,
    announced: &mut bool,
) -> Result<(), DownloadError> {
    let mut offset = file_len(part).await.unwrap_or(0);
    if let Some(total) = expected {
        if offset > 0 && offset == total {
            debug!(part = %part.display(), "partial already complete");
            return Ok(());
        }
        if offset > total {
            warn!(part = %part.display(), offset, total, "partial larger than resource, restarting");
            offset = 0;
        }
    }

    let opened = host.open_stream(item, offset).await?;
    let start = if opened.resumed { offset } else { 0 };
    let total = opened.total_bytes.or(expected);
    if !*announced {
        ctx.observer.task_added(item, total);
        *announced = true;
    }

    let mut options = tokio::fs::OpenOptions::new();
    if opened.resumed {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let mut file = options
        .create(true)
        .open(part)
        .await
        .map_err(|e| DownloadError::io(part, e))?;

    if opened.resumed {
        info!(offset, "resuming partial download");
    }

    let url = item.source_url().as_str();
    let mut written = start;
    let mut body = opened.response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
        let len = chunk.len() as u64;
        written += len;
        ctx.observer.bytes_advanced(item, len);
    }
    file.flush().await.map_err(|e| DownloadError::io(part, e))?;
    drop(file);

    if let Some(total) = total
        && written != total
    {
        return Err(DownloadError::integrity(part, total, written));
    }
    Ok(())
}

/// Moves `part` into place and stamps the modification time.
async fn finalize(item: &MediaItem, part: &Path, final_path: &Path) -> Result<(), DownloadError> {
    if file_len(final_path).await.is_some() {
        warn!(path = %final_path.display(), "final file appeared meanwhile, discarding partial");
        match tokio::fs::remove_file(part).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::io(part, e)),
        }
    } else {
        tokio::fs::rename(part, final_path)
            .await
            .map_err(|e| DownloadError::io(final_path, e))?;
    }

    if let Some(timestamp) = item.expected_datetime() {
        stamp_mtime(final_path, timestamp).await;
    }
    Ok(())
}

async fn stamp_mtime(path: &Path, unix_seconds: i64) {
    let Ok(seconds) = u64::try_from(unix_seconds) else {
        debug!(unix_seconds, "pre-epoch timestamp, not stamping");
        return;
    };
    let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(seconds);
    let path_buf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path_buf)?
            .set_modified(modified)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(path = %path.display(), %error, "failed to set modification time"),
        Err(error) => warn!(path = %path.display(), %error, "mtime task failed"),
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|meta| meta.len())
}

async fn has_free_space(folder: &Path, required: u64) -> bool {
    let path = folder.to_path_buf();
    let available = match tokio::task::spawn_blocking(move || fs2::available_space(&path)).await {
        Ok(result) => result,
        Err(error) => {
            debug!(folder = %folder.display(), %error, "free space check task failed, continuing");
            return true;
        }
    };
    match available {
        Ok(available) if available < required => {
            warn!(
                folder = %folder.display(),
                available,
                required,
                "not enough free space"
            );
            false
        }
        Ok(_) => true,
        Err(error) => {
            debug!(folder = %folder.display(), %error, "free space unknown, continuing");
            true
        }
    }
}
