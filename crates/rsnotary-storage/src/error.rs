//! Storage error types.

use thiserror::Error;

/// Storage-specific errors.
///
/// The engine's retry loop only cares about one distinction: transient
/// contention (worth retrying with backoff) versus everything else.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error.
    #[error("database connection error: {message}")]
    Connection { message: String },

    /// Database query error.
    #[error("database query error: {message}")]
    Query { message: String },

    /// Transaction error (begin/commit failure).
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Transient contention: serialization failure, deadlock, or a
    /// uniqueness race with a concurrent writer instance. Retrying the
    /// whole batch transaction is expected to succeed (or re-classify the
    /// race as an ordinary conflict once the other writer's rows are
    /// visible).
    #[error("transient contention: {message}")]
    Serialization { message: String },

    /// Internal error.
    #[error("internal storage error: {message}")]
    Internal { message: String },
}

impl StorageError {
    /// Whether the engine's retry loop should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Serialization { .. })
    }

    pub fn query(message: impl Into<String>) -> Self {
        StorageError::Query {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        StorageError::Transaction {
            message: message.into(),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
