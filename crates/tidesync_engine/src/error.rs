//! Error types for the sync engine.

use thiserror::Error;
use tidesync_protocol::ProtocolError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Protocol error (invalid message format).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Server rejected the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// The local row store failed.
    #[error("local store error: {0}")]
    Store(String),

    /// The operation executor rejected a mutation.
    #[error("executor error: {0}")]
    Executor(String),

    /// A table's catch-up reported an error.
    #[error("catch-up of table {table} failed: {message}")]
    CatchUp {
        /// Table whose catch-up failed.
        table: String,
        /// Error reported by the server.
        message: String,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The server is unreachable.
    #[error("server unreachable")]
    Offline,

    /// The client was built with missing or invalid settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::ServerError(_) => true,
            SyncError::Executor(_) => true,
            SyncError::CatchUp { .. } => true,
            SyncError::Offline => true,
            _ => false,
        }
    }

    /// Returns true if the error means the credentials were rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::AuthenticationFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::ServerError("internal error".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::AuthenticationFailed("expired".into()).is_retryable());
    }

    #[test]
    fn auth_classification() {
        assert!(SyncError::AuthenticationFailed("expired".into()).is_auth());
        assert!(!SyncError::Store("disk full".into()).is_auth());
    }

    #[test]
    fn error_display() {
        let err = SyncError::CatchUp {
            table: "todos".into(),
            message: "connection reset".into(),
        };
        assert_eq!(
            err.to_string(),
            "catch-up of table todos failed: connection reset"
        );

        let err: SyncError = ProtocolError::Decode("truncated".into()).into();
        assert!(err.to_string().starts_with("protocol error"));
    }
}
