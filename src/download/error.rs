//! Failure reasons for a single media item.
//!
//! Every variant renders as a one-line message; that text is what lands in
//! the error log next to the item's URL.

use std::path::PathBuf;

use thiserror::Error;

use crate::history::HistoryError;

#[derive(Debug, Error)]
pub enum DownloadError {
    /// DNS, connect, TLS, or a body that broke off mid-stream.
    #[error("network error fetching {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timed out fetching {url}")]
    Timeout { url: String },

    /// Non-2xx answer. `retry_after` keeps the raw header for the backoff.
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        url: String,
        status: u16,
        retry_after: Option<String>,
    },

    /// A text or HTML page where media was expected, usually a soft block.
    #[error("server sent {content_type} instead of media for {url}")]
    UnexpectedContent { url: String, content_type: String },

    #[error("filesystem error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{url} has no file extension")]
    MissingExtension { url: String },

    #[error("no free name for {filename} in {folder}")]
    UnresolvableFilename { folder: PathBuf, filename: String },

    /// Bytes on disk disagree with the size the server announced.
    #[error("size mismatch on {path}: expected {expected_bytes} bytes, have {actual_bytes}")]
    Integrity {
        path: PathBuf,
        expected_bytes: u64,
        actual_bytes: u64,
    },

    /// Unrecoverable; the engine stops when a task reports this.
    #[error("history store failure: {0}")]
    History(#[from] HistoryError),
}

impl DownloadError {
    /// Wraps a transport error, folding reqwest timeouts into [`Self::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::http_status_with_retry_after(url, status, None)
    }

    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}
