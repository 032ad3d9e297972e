//! Download engine: per-host client pool, task state machine, retries.
//!
//! # Features
//!
//! - Per-host token bucket and minimum inter-request delay
//! - Range-based resume from `.part` files
//! - Collision-free final names under a per-filename lock
//! - Bounded exponential backoff with failure classification
//! - Lazily started per-host worker pools with a global ceiling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediafetch_core::{DownloadEngine, DownloadStats, EngineConfig, MediaItem};
//! use url::Url;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stats = Arc::new(DownloadStats::new());
//! let engine = DownloadEngine::builder(EngineConfig::default())
//!     .observer(stats.clone())
//!     .build()
//!     .await?;
//! let url = Url::parse("https://cyberdrop.me/f/a.jpg")?;
//! engine.submit(MediaItem::new(url, "downloads/album")?).await?;
//! engine.wait_all().await?;
//! println!("completed: {}", stats.completed());
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod client;
mod engine;
mod error;
mod file_lock;
pub(crate) mod filename;
pub mod rate_limiter;
mod retry;

pub use client::{ClientPool, HostClient, MediaResponse};
pub use engine::{DownloadEngine, EngineBuilder, EngineError, ErrorLog, ItemSender};
pub use error::DownloadError;
pub use file_lock::{FileLockGuard, FileLockRegistry};
pub use filename::{PART_SUFFIX, part_path};
pub use rate_limiter::{RateLimiter, Throttle, parse_retry_after};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
