//! In-process exclusive claims on `original_filename`.
//!
//! Two items from different albums can share an original filename. Holding
//! a [`FileLockGuard`] while resolving the final name keeps two tasks from
//! both picking the same collision-resolved name.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace};

/// Mean of the backoff between acquire attempts (1 second).
const DEFAULT_BACKOFF_MEAN: Duration = Duration::from_secs(1);

/// Standard deviation of the backoff between acquire attempts (1.5 seconds).
const DEFAULT_BACKOFF_STD_DEV: Duration = Duration::from_millis(1500);

/// Shortest backoff; negative gaussian samples clamp here.
const MIN_BACKOFF: Duration = Duration::from_millis(10);

/// Process-wide set of held filenames.
#[derive(Debug, Clone)]
pub struct FileLockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
    backoff_mean: Duration,
    backoff_std_dev: Duration,
}

impl Default for FileLockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FileLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_backoff(DEFAULT_BACKOFF_MEAN, DEFAULT_BACKOFF_STD_DEV)
    }

    /// Registry with a custom backoff distribution.
    #[must_use]
    pub fn with_backoff(mean: Duration, std_dev: Duration) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            backoff_mean: mean,
            backoff_std_dev: std_dev,
        }
    }

    /// Waits until `name` is free and claims it.
    ///
    /// The claim lasts until the returned guard is dropped, which also
    /// happens when the owning future is cancelled.
    pub async fn acquire(&self, name: &str) -> FileLockGuard {
        let mut waited = 0_u32;
        loop {
            if let Some(guard) = self.try_acquire(name) {
                if waited > 0 {
                    debug!(name, waited, "file lock acquired after waiting");
                }
                return guard;
            }
            waited = waited.saturating_add(1);
            let backoff = self.sample_backoff();
            trace!(name, backoff_ms = backoff.as_millis(), "file lock busy");
            tokio::time::sleep(backoff).await;
        }
    }

    /// Claims `name` if nobody holds it.
    #[must_use]
    pub fn try_acquire(&self, name: &str) -> Option<FileLockGuard> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(name.to_string()) {
            return None;
        }
        Some(FileLockGuard {
            held: Arc::clone(&self.held),
            name: name.to_string(),
        })
    }

    /// True while some task holds `name`.
    #[must_use]
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Number of names currently held.
    #[must_use]
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Draws from `gauss(mean, std_dev)` via Box-Muller.
    fn sample_backoff(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.r#gen();
        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
        let secs = self.backoff_mean.as_secs_f64() + z * self.backoff_std_dev.as_secs_f64();
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MIN_BACKOFF)
            .max(MIN_BACKOFF)
    }
}

/// Held claim on one filename; released on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl FileLockGuard {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
        trace!(name = %self.name, "file lock released");
    }
}
