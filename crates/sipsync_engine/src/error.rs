//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The server answered with a non-success status.
    #[error("http error {status}: {status_text}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Reason phrase.
        status_text: String,
    },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The response body was not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// The JSON did not match any known collection layout.
    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),

    /// Local cache error.
    #[error("database error: {0}")]
    Database(#[from] sipsync_core::CoreError),

    /// No endpoint is configured for a collection.
    #[error("no endpoint configured for collection '{0}'")]
    MissingEndpoint(String),

    /// The name does not match a tracked collection.
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    /// Background work was cancelled by a shutdown.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates an HTTP error.
    pub fn http(status: u16, status_text: impl Into<String>) -> Self {
        Self::Http {
            status,
            status_text: status_text.into(),
        }
    }

    /// Returns true if this error can be retried.
    ///
    /// HTTP and network errors are transient. Parse and shape errors will
    /// not change on retry, and local errors are never retried here.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Http { .. } | SyncError::Network(_))
    }

    /// Returns true for failures caused by missing connectivity.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}
