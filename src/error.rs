//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation canceled")]
    Canceled,

    #[error("Completer is not running")]
    NotRunning,

    #[error("Completer already started")]
    AlreadyStarted,

    #[error("Subscribe channel can only be replaced while the completer is stopped")]
    SubscribeChanInUse,

    #[error("Completer has no subscribe channel; set one before starting")]
    SubscribeChanMissing,

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Whether this error is fatal for the current operation and must not be
    /// retried: the ambient cancellation fired, or the connection pool is
    /// gone and no amount of waiting will bring it back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::DatabaseSqlx(sqlx::Error::PoolClosed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        assert!(Error::Canceled.is_terminal());
        assert!(Error::DatabaseSqlx(sqlx::Error::PoolClosed).is_terminal());
        assert!(!Error::DatabaseSqlx(sqlx::Error::PoolTimedOut).is_terminal());
        assert!(!Error::Database("disk I/O error".to_string()).is_terminal());
        assert!(!Error::Other("anything else".to_string()).is_terminal());
    }
}
