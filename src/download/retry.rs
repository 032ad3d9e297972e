//! Deciding whether a failed item gets another attempt.
//!
//! [`classify_error`] sorts a [`DownloadError`] into a [`FailureType`] and
//! [`RetryPolicy::should_retry`] turns that plus the attempt count into a
//! [`RetryDecision`]. Transient and rate-limited failures are retried with a
//! capped exponential delay; permanent ones fail the item immediately and a
//! fatal one stops the engine.
//!
//! ```
//! use mediafetch_core::download::{
//!     DownloadError, RetryPolicy, FailureType, RetryDecision, classify_error
//! };
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://cyberdrop.me/f/a.jpg", 503);
//! assert_eq!(classify_error(&error), FailureType::Transient);
//!
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => assert!(attempt == 2 && delay.as_secs() >= 1),
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::io::ErrorKind;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::filename::PART_SUFFIX;
use crate::config::EngineConfig;
use crate::domain::is_retry_whitelisted_cdn;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(16);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;
const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Dropped connection, stall, 5xx, short body.
    Transient,
    /// 429, or an HTML page where media was expected.
    RateLimited,
    /// Other 4xx, unusable names, non-partial filesystem errors.
    Permanent,
    /// History store failure.
    Fatal,
}

impl FailureType {
    #[must_use]
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep `delay`, then make attempt number `attempt`.
    Retry { delay: Duration, attempt: u32 },
    DoNotRetry { reason: String },
}

/// Attempt cap and backoff curve.
///
/// The wait after failed attempt `n` is
/// `min(base_delay * multiplier^(n-1), max_delay)` plus up to `max_jitter`.
/// Defaults: 10 attempts, 1 s base, 16 s cap, doubling, 500 ms jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    unlimited: bool,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_ATTEMPTS,
            unlimited: false,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try and is raised to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Reads `attempts` and `disable_attempt_limit`.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            unlimited: config.disable_attempt_limit,
            ..Self::with_max_attempts(config.attempts)
        }
    }

    /// Zero-delay retries.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 1.0).without_jitter()
    }

    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.max_jitter = Duration::ZERO;
        self
    }

    #[must_use]
    pub fn unlimited(mut self) -> Self {
        self.unlimited = true;
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    /// Decision after attempt number `attempt` (1-based) failed with `failure_type`.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts, unlimited = self.unlimited))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if !failure_type.is_retriable() {
            return RetryDecision::DoNotRetry {
                reason: format!("{failure_type:?} failure").to_lowercase(),
            };
        }
        if !self.unlimited && attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("all {} attempts used", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            ?failure_type,
            attempt,
            delay_ms = delay.as_millis(),
            "scheduling retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt.saturating_add(1),
        }
    }

    #[must_use]
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1).min(30)).unwrap_or(30);
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let scaled = self.base_delay.as_secs_f64() * f64::from(factor);
        let capped = Duration::try_from_secs_f64(scaled)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay));

        let jitter_bound = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_bound == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_bound))
    }
}

/// Failure class for `error`.
///
/// A 4xx is permanent unless it is a 429 or comes from a `media-files*`
/// bunkr CDN host, which answers 4xx while a file is still propagating.
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::Network { .. }
        | DownloadError::Timeout { .. }
        | DownloadError::Integrity { .. } => FailureType::Transient,
        DownloadError::UnexpectedContent { .. } => FailureType::RateLimited,
        DownloadError::HttpStatus { url, status, .. } => classify_http_status(url, *status),
        DownloadError::Io { path, source } => {
            let is_part = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(PART_SUFFIX));
            // Another process (often an antivirus scan) holding the partial.
            if is_part && source.kind() == ErrorKind::PermissionDenied {
                FailureType::Transient
            } else {
                FailureType::Permanent
            }
        }
        DownloadError::MissingExtension { .. } | DownloadError::UnresolvableFilename { .. } => {
            FailureType::Permanent
        }
        DownloadError::History(_) => FailureType::Fatal,
    }
}

fn classify_http_status(url: &str, status: u16) -> FailureType {
    match status {
        429 => FailureType::RateLimited,
        500..=599 => FailureType::Transient,
        400..=499 if served_by_whitelisted_cdn(url) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn served_by_whitelisted_cdn(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(is_retry_whitelisted_cdn))
        .unwrap_or(false)
}
