//! Error types for the persistence layer.

use courier_core::errors::ErrorKind;
use thiserror::Error;

/// Errors that can occur during presence or device-token operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error (exhausted or timed out).
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Describes which migration failed and why.
        message: String,
    },

    /// Operation did not finish within its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation name.
        operation: &'static str,
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A blocking worker panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Classification of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ErrorKind::Transient
            }
            Self::Pool(_) | Self::Timeout { .. } => ErrorKind::Transient,
            Self::Sqlite(_) | Self::Migration { .. } | Self::Join(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_database_is_transient() {
        let err = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn other_sqlite_errors_are_internal() {
        let err = StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.to_string().contains("sqlite error"));
    }

    #[test]
    fn timeout_display() {
        let err = StoreError::Timeout {
            operation: "presence.delete",
            timeout_ms: 3000,
        };
        assert_eq!(err.to_string(), "presence.delete timed out after 3000ms");
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
