//! Error types for sipsync core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in sipsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Embedded SQLite engine error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding of a stored payload failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The lock was not granted before the acquisition deadline.
    #[error("lock acquisition for '{operation}' timed out after {timeout_ms}ms")]
    LockTimeout {
        /// Operation that was waiting.
        operation: String,
        /// Acquisition timeout that elapsed.
        timeout_ms: u64,
    },

    /// The lock manager is draining and refuses new acquisitions.
    #[error("lock manager is shutting down, rejected '{operation}'")]
    ShuttingDown {
        /// Operation that was rejected.
        operation: String,
    },

    /// The lock manager was reset while the request was queued.
    #[error("lock request for '{operation}' was cancelled by a reset")]
    LockCancelled {
        /// Operation whose request was dropped.
        operation: String,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Database initialization ended in the error state.
    #[error("database initialization failed: {message}")]
    InitializationFailed {
        /// Stored error message.
        message: String,
    },

    /// Waited too long for the database to become ready.
    #[error("database was not ready after {timeout_ms}ms")]
    ReadyTimeout {
        /// Wait timeout that elapsed.
        timeout_ms: u64,
    },

    /// The database has not been initialized yet.
    #[error("database is not ready (state: {state})")]
    NotReady {
        /// Current initialization state.
        state: String,
    },

    /// A schema migration failed.
    #[error("migration {version} failed: {message}")]
    Migration {
        /// Version of the failing migration.
        version: u32,
        /// Description of the failure.
        message: String,
    },

    /// A stored row could not be mapped to a record.
    #[error("invalid row in {table}: {message}")]
    InvalidRow {
        /// Table the row came from.
        table: String,
        /// Description of the problem.
        message: String,
    },

    /// Requested item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a migration error.
    pub fn migration(version: u32, message: impl Into<String>) -> Self {
        Self::Migration {
            version,
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid row error.
    pub fn invalid_row(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRow {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Returns true for errors raised by a violated lock or state contract.
    ///
    /// These are programming errors and are never retried.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            CoreError::ShuttingDown { .. } | CoreError::InvalidTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_message_names_duration() {
        let err = CoreError::LockTimeout {
            operation: "b".into(),
            timeout_ms: 5000,
        };
        assert!(err.to_string().contains("5000ms"));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn contract_violations() {
        assert!(CoreError::ShuttingDown {
            operation: "x".into()
        }
        .is_contract_violation());
        assert!(CoreError::InvalidTransition {
            from: "READY".into(),
            to: "INITIALIZING".into()
        }
        .is_contract_violation());
        assert!(!CoreError::LockTimeout {
            operation: "x".into(),
            timeout_ms: 1
        }
        .is_contract_violation());
    }
}
