//! Error types for history store operations.

use std::fmt;

use thiserror::Error;

use crate::db::DbError;

/// Structured classification for history database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (primary key, unique, not-null).
    ConstraintViolation,
    /// The database file is malformed or not a database.
    Corrupt,
    /// Connection pool is closed.
    PoolClosed,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl HistoryDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for HistoryDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Corrupt => "corrupt",
            Self::PoolClosed => "pool_closed",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> HistoryDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return HistoryDbErrorKind::BusyOrLocked;
    }

    if matches!(code.as_deref(), Some("11" | "26" | "SQLITE_CORRUPT" | "SQLITE_NOTADB")) {
        return HistoryDbErrorKind::Corrupt;
    }

    if database_error.is_unique_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT") || value == "19")
    {
        return HistoryDbErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked") || message.contains("database is busy") {
        return HistoryDbErrorKind::BusyOrLocked;
    }
    if message.contains("malformed") {
        return HistoryDbErrorKind::Corrupt;
    }

    HistoryDbErrorKind::Other
}

/// Errors that can occur during history operations.
#[derive(Debug, Clone, Error)]
pub enum HistoryError {
    /// The store could not be opened.
    #[error("failed to open history store: {0}")]
    Open(String),

    /// A query failed.
    #[error("history database error ({kind}): {message}")]
    Database {
        /// Typed classification used by callers that react to conflicts.
        kind: HistoryDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// A startup migration failed.
    #[error("history migration `{step}` failed: {message}")]
    Migration {
        /// Name of the failing migration step.
        step: &'static str,
        /// Human-readable database error text.
        message: String,
    },
}

impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: HistoryDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<DbError> for HistoryError {
    fn from(err: DbError) -> Self {
        Self::Open(err.to_string())
    }
}

impl HistoryError {
    pub(crate) fn migration(step: &'static str, err: &sqlx::Error) -> Self {
        Self::Migration {
            step,
            message: err.to_string(),
        }
    }

    /// Returns whether this error is an integrity conflict.
    #[must_use]
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: HistoryDbErrorKind::ConstraintViolation,
                ..
            }
        )
    }
}
