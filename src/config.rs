//! Engine configuration.
//!
//! [`EngineConfig`] is the single typed source for every tunable the engine
//! reads. It deserializes from TOML with defaults for missing keys and rejects
//! unknown keys so that typos surface at startup instead of being ignored.
//!
//! # Example
//!
//! ```
//! use mediafetch_core::EngineConfig;
//!
//! let config = EngineConfig::from_toml_str(
//!     r#"
//!     download_root = "/tmp/media"
//!     max_workers_per_host = 3
//!     excluded_types = ["videos"]
//!     "#,
//! ).unwrap();
//! assert_eq!(config.max_workers_per_host, 3);
//! assert_eq!(config.attempts, 10);
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::media::MediaKind;

/// Default global ceiling on concurrently running download tasks.
pub const DEFAULT_MAX_WORKERS_GLOBAL: usize = 15;

/// Default per-host worker count.
pub const DEFAULT_MAX_WORKERS_PER_HOST: usize = 5;

/// Default number of attempts per item.
pub const DEFAULT_ATTEMPTS: u32 = 10;

/// Default connect timeout in seconds.
pub const DEFAULT_CONNECTION_TIMEOUT_S: u64 = 15;

/// Default read (stall) timeout in seconds.
pub const DEFAULT_READ_TIMEOUT_S: u64 = 300;

/// Default token-bucket size per one second period.
pub const DEFAULT_RATE_LIMIT_PER_S: u32 = 10;

/// Default per-host minimum delay between download requests.
pub const DEFAULT_DOWNLOAD_DELAY_S: f64 = 0.5;

/// Default free-space floor in GiB.
pub const DEFAULT_REQUIRED_FREE_SPACE_GB: u64 = 5;

const DEFAULT_MAX_FILENAME_LENGTH: usize = 95;
const DEFAULT_MAX_FOLDER_NAME_LENGTH: usize = 60;

/// `mediafetch/<version>`, sent when no `user_agent` is configured.
fn default_download_user_agent() -> String {
    format!("mediafetch/{}", env!("CARGO_PKG_VERSION"))
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Config contents are not valid TOML or contain unknown keys.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its accepted range.
    #[error("invalid value for `{key}`: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Human readable reason.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Typed engine configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Ceiling on download tasks running at once across all hosts.
    pub max_workers_global: usize,
    /// Workers per host before the fragile-host cap is applied.
    pub max_workers_per_host: usize,
    /// Attempts per item, including the first.
    pub attempts: u32,
    /// Retry retriable failures forever.
    pub disable_attempt_limit: bool,
    /// TCP/TLS connect timeout in seconds.
    pub connection_timeout_s: u64,
    /// Maximum stall between body reads in seconds.
    pub read_timeout_s: u64,
    /// Requests allowed per host per second.
    pub rate_limit_per_s: u32,
    /// Minimum delay between download requests to one host.
    pub download_delay_s: f64,
    /// Proxy URL, empty for none.
    pub proxy: String,
    /// Skip TLS certificate verification.
    pub allow_insecure_tls: bool,
    /// Items are skipped when the target volume has less free space than this.
    pub required_free_space_gb: u64,
    /// Media kinds that are never fetched.
    pub excluded_types: BTreeSet<MediaKind>,
    /// Longest filename written to disk, extension included.
    pub max_filename_length: usize,
    /// Longest folder name created for an album.
    pub max_folder_name_length: usize,
    /// Root under which album folders are created.
    pub download_root: PathBuf,
    /// Record items as complete without fetching them.
    pub skip_download_mark_completed: bool,
    /// User-Agent sent on every request.
    pub user_agent: String,
    /// CSV log of failed items. `None` disables the log.
    pub error_log: Option<PathBuf>,
    /// History database path. Defaults to `history.sqlite` under `download_root`.
    pub history_db: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers_global: DEFAULT_MAX_WORKERS_GLOBAL,
            max_workers_per_host: DEFAULT_MAX_WORKERS_PER_HOST,
            attempts: DEFAULT_ATTEMPTS,
            disable_attempt_limit: false,
            connection_timeout_s: DEFAULT_CONNECTION_TIMEOUT_S,
            read_timeout_s: DEFAULT_READ_TIMEOUT_S,
            rate_limit_per_s: DEFAULT_RATE_LIMIT_PER_S,
            download_delay_s: DEFAULT_DOWNLOAD_DELAY_S,
            proxy: String::new(),
            allow_insecure_tls: false,
            required_free_space_gb: DEFAULT_REQUIRED_FREE_SPACE_GB,
            excluded_types: BTreeSet::new(),
            max_filename_length: DEFAULT_MAX_FILENAME_LENGTH,
            max_folder_name_length: DEFAULT_MAX_FOLDER_NAME_LENGTH,
            download_root: PathBuf::from("downloads"),
            skip_download_mark_completed: false,
            user_agent: default_download_user_agent(),
            error_log: None,
            history_db: None,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or unknown keys and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read, otherwise
    /// the same errors as [`EngineConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = %path.display(), "loading engine config");
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers_global == 0 {
            return Err(ConfigError::invalid("max_workers_global", "must be at least 1"));
        }
        if self.max_workers_per_host == 0 {
            return Err(ConfigError::invalid(
                "max_workers_per_host",
                "must be at least 1",
            ));
        }
        if self.attempts == 0 {
            return Err(ConfigError::invalid("attempts", "must be at least 1"));
        }
        if self.connection_timeout_s == 0 || self.read_timeout_s == 0 {
            return Err(ConfigError::invalid(
                "connection_timeout_s",
                "timeouts must be at least 1 second",
            ));
        }
        if self.rate_limit_per_s == 0 {
            return Err(ConfigError::invalid("rate_limit_per_s", "must be at least 1"));
        }
        if !self.download_delay_s.is_finite() || self.download_delay_s < 0.0 {
            return Err(ConfigError::invalid(
                "download_delay_s",
                "must be a non-negative number of seconds",
            ));
        }
        if !self.proxy.is_empty() && url::Url::parse(&self.proxy).is_err() {
            return Err(ConfigError::invalid(
                "proxy",
                format!("`{}` is not a URL", self.proxy),
            ));
        }
        if self.max_filename_length < 8 {
            return Err(ConfigError::invalid(
                "max_filename_length",
                "must be at least 8",
            ));
        }
        if self.max_folder_name_length == 0 {
            return Err(ConfigError::invalid(
                "max_folder_name_length",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_s)
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_s)
    }

    /// Default per-host throttle, used for hosts without a known override.
    #[must_use]
    pub fn download_delay(&self) -> Duration {
        Duration::from_secs_f64(self.download_delay_s)
    }

    /// Free-space floor in bytes.
    #[must_use]
    pub fn required_free_space_bytes(&self) -> u64 {
        self.required_free_space_gb.saturating_mul(1024 * 1024 * 1024)
    }

    /// Resolved location of the history database.
    #[must_use]
    pub fn history_db_path(&self) -> PathBuf {
        self.history_db
            .clone()
            .unwrap_or_else(|| self.download_root.join("history.sqlite"))
    }

    /// Returns whether items of `kind` should be skipped.
    #[must_use]
    pub fn is_excluded(&self, kind: MediaKind) -> bool {
        self.excluded_types.contains(&kind)
    }

    /// `None` when the proxy option is empty.
    #[must_use]
    pub fn proxy_url(&self) -> Option<&str> {
        let trimmed = self.proxy.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}
