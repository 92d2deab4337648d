//! Error types for vitrine.

use thiserror::Error;

/// Result type alias using vitrine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for vitrine operations.
///
/// The variants follow the engine's failure taxonomy: transient I/O
/// ([`Error::Transient`], [`Error::Request`], [`Error::Transfer`]) is retried
/// with backoff, capacity failures ([`Error::QuotaExceeded`]) are surfaced
/// verbatim and never retried, and everything else is reported on the item it
/// happened to.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Local storage rejected a write because it is out of space
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Local storage backend failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Network or timeout failure that may succeed on retry
    #[error("Transient error: {0}")]
    Transient(String),

    /// Object storage transfer failed
    #[error("Transfer error: {0}")]
    Transfer(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Request(_) | Error::Transfer(_) => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Whether this is a capacity failure the user must act on.
    pub fn is_quota_exceeded(&self) -> bool {
        match self {
            Error::QuotaExceeded(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::StorageFull,
            _ => false,
        }
    }

    /// Map an I/O error, promoting out-of-space conditions to [`Error::QuotaExceeded`].
    pub fn from_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::StorageFull {
            Error::QuotaExceeded(e.to_string())
        } else {
            Error::Io(e)
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Error::Transient(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_quota() {
        let err = Error::QuotaExceeded("library record is 9MB".to_string());
        assert_eq!(err.to_string(), "Storage quota exceeded: library record is 9MB");
    }

    #[test]
    fn test_error_display_transfer() {
        let err = Error::Transfer("503 from storage".to_string());
        assert_eq!(err.to_string(), "Transfer error: 503 from storage");
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::Transient("timeout".into()).is_retryable());
        assert!(Error::Request("reset".into()).is_retryable());
        assert!(Error::Transfer("502".into()).is_retryable());
    }

    #[test]
    fn test_quota_is_never_retryable() {
        let err = Error::QuotaExceeded("full".into());
        assert!(!err.is_retryable());
        assert!(err.is_quota_exceeded());
    }

    #[test]
    fn test_programming_errors_are_not_retryable() {
        assert!(!Error::Internal("bug".into()).is_retryable());
        assert!(!Error::InvalidInput("bad".into()).is_retryable());
        assert!(!Error::NotFound("gone".into()).is_retryable());
    }

    #[test]
    fn test_from_io_promotes_storage_full() {
        let io_err = std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full");
        let err = Error::from_io(io_err);
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[test]
    fn test_from_io_keeps_other_kinds() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::from_io(io_err);
        match err {
            Error::Io(_) => {}
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_io_timeout_is_retryable() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(err.to_string().contains("Serialization error:"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
