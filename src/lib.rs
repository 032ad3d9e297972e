//! Mediafetch Core Library
//!
//! Concurrent, resumable bulk media downloads. Extractors produce
//! [`MediaItem`]s; the [`DownloadEngine`] routes them to per-host worker
//! pools, resumes partial files, resolves filename collisions, and records
//! every attempt in a SQLite history so completed files are never fetched
//! twice.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Typed engine configuration loaded from TOML
//! - [`domain`] - Host family canonicalization and per-host policy tables
//! - [`media`] - The unit of work and its JSON line form
//! - [`db`] - SQLite connection setup
//! - [`history`] - Persistent per-URL download state and migrations
//! - [`download`] - Client pool, file locks, retries, task state machine, orchestrator
//! - [`progress`] - Observer interface and counters

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod domain;
pub mod download;
pub mod history;
pub mod media;
pub mod progress;
#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use db::{Database, DbError};
pub use domain::DomainKey;
pub use download::{
    DownloadEngine, DownloadError, EngineBuilder, EngineError, FailureType, FileLockRegistry,
    ItemSender, RateLimiter, RetryDecision, RetryPolicy, classify_error,
};
pub use history::{FailedItem, HistoryError, HistoryRecord, HistoryRepository, HistoryStore};
pub use media::{MediaItem, MediaItemError, MediaItemRecord, MediaKind};
pub use progress::{
    DownloadStats, FailureCategory, FanoutObserver, NoopObserver, ProgressObserver, SkipReason,
};
