//! Per-host request pacing.
//!
//! Every host client owns a [`RateLimiter`] (at most `max_calls` requests in
//! any sliding `period`) and a [`Throttle`] (a fixed gap between download
//! requests). Hosts never wait on one another.
//!
//! ```
//! use std::time::Duration;
//! use mediafetch_core::download::{RateLimiter, Throttle};
//!
//! # async fn example() {
//! let bucket = RateLimiter::new(10, Duration::from_secs(1));
//! let throttle = Throttle::new("cyberdrop", Duration::from_millis(500));
//!
//! bucket.acquire().await;
//! throttle.wait().await;
//! // ... send request
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Total time spent throttled before a host is reported as slow.
const SLOW_HOST_WARNING: Duration = Duration::from_secs(30);

const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Sliding-window token bucket for one host.
///
/// Waiters queue on a fair mutex, so acquisition order is FIFO.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    period: Duration,
    /// Acquire timestamps inside the current window, oldest first.
    window: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Creates a bucket allowing `max_calls` per `period`.
    ///
    /// A `max_calls` of zero is treated as one.
    #[must_use]
    pub fn new(max_calls: u32, period: Duration) -> Self {
        let max_calls = usize::try_from(max_calls.max(1)).unwrap_or(usize::MAX);
        Self {
            max_calls,
            period,
            window: Mutex::new(VecDeque::with_capacity(max_calls.min(1024))),
        }
    }

    #[must_use]
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits until a token is free, then records the acquisition.
    pub async fn acquire(&self) {
        let mut window = self.window.lock().await;
        loop {
            let now = Instant::now();
            while window
                .front()
                .is_some_and(|oldest| now.duration_since(*oldest) >= self.period)
            {
                window.pop_front();
            }

            if window.len() < self.max_calls {
                window.push_back(now);
                return;
            }

            let Some(oldest) = window.front().copied() else {
                continue;
            };
            let wait = self.period.saturating_sub(now.duration_since(oldest));
            debug!(wait_ms = wait.as_millis(), "rate limit bucket saturated");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Spacing between consecutive download requests to one host.
///
/// A 429 with `Retry-After` moves the next slot further out via
/// [`Throttle::record_rate_limit`].
#[derive(Debug)]
pub struct Throttle {
    host: String,
    delay: Duration,
    /// Next permitted start; `None` until the first request.
    next_slot: Mutex<Option<Instant>>,
    waited_ms: AtomicU64,
}

impl Throttle {
    #[must_use]
    pub fn new(host: impl Into<String>, delay: Duration) -> Self {
        Self {
            host: host.into(),
            delay,
            next_slot: Mutex::new(None),
            waited_ms: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Waits for this host's next slot and books the one after it.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn wait(&self) {
        let mut next_slot = self.next_slot.lock().await;
        let now = Instant::now();
        if let Some(slot) = (*next_slot).filter(|slot| *slot > now) {
            let pause = slot - now;
            self.account(pause, "throttling download request");
            tokio::time::sleep(pause).await;
        }
        *next_slot = Some(Instant::now() + self.delay);
    }

    /// Keeps the host quiet for at least `delay` from now.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn record_rate_limit(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut next_slot = self.next_slot.lock().await;
        *next_slot = Some((*next_slot).map_or(until, |slot| slot.max(until)));
        self.account(delay, "server asked to back off");
    }

    fn account(&self, pause: Duration, what: &str) {
        let pause_ms = u64::try_from(pause.as_millis()).unwrap_or(u64::MAX);
        let total_ms = self
            .waited_ms
            .fetch_add(pause_ms, Ordering::Relaxed)
            .saturating_add(pause_ms);
        let total = Duration::from_millis(total_ms);
        debug!(pause_ms, total_ms, "{what}");
        if total >= SLOW_HOST_WARNING {
            warn!(
                host = %self.host,
                waited_secs = total.as_secs(),
                "host is heavily throttled"
            );
        }
    }
}

/// Delay requested by a `Retry-After` header.
///
/// Accepts delta-seconds or an HTTP-date. Negative or unparseable values
/// yield `None`; a date in the past yields zero; anything above one hour is
/// clamped to one hour.
///
/// ```
/// use std::time::Duration;
/// use mediafetch_core::download::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("later"), None);
/// ```
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    let requested = match value.parse::<i64>() {
        Ok(seconds) => Duration::from_secs(u64::try_from(seconds).ok()?),
        Err(_) => {
            let date = httpdate::parse_http_date(value).ok()?;
            date.duration_since(std::time::SystemTime::now())
                .unwrap_or(Duration::ZERO)
        }
    };
    if requested > MAX_RETRY_AFTER {
        debug!(value, "clamping Retry-After to one hour");
    }
    Some(requested.min(MAX_RETRY_AFTER))
}
