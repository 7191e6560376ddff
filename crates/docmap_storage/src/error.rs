//! Error types for storage operations.

use docmap_codec::CodecError;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Errors are classified as either transient (the same operation may
/// succeed if retried, e.g. after a replica failover) or fatal.
/// See [`StorageError::is_transient`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// A document with the same `_id` already exists in the collection.
    #[error("duplicate key in '{collection}': _id {id}")]
    DuplicateKey {
        /// Collection name.
        collection: String,
        /// Rendered identifier.
        id: String,
    },

    /// An update's version precondition did not match the stored document.
    #[error("version conflict in '{collection}' for _id {id}: expected version {expected}")]
    VersionConflict {
        /// Collection name.
        collection: String,
        /// Rendered identifier.
        id: String,
        /// The version the writer expected to find.
        expected: i64,
    },

    /// A retryable failure (network hiccup, primary step-down, ...).
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// A non-retryable server failure.
    #[error("storage failure: {0}")]
    Fatal(String),

    /// An update operator could not be applied to the stored document.
    #[error("cannot apply update to '{path}': {message}")]
    InvalidUpdate {
        /// The field path the operator targeted.
        path: String,
        /// Description of the problem.
        message: String,
    },

    /// Transaction misuse (commit without start, nested start, ...).
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The backend does not support the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A document could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The backend is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a fatal error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    /// Creates a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction(message.into())
    }

    /// Creates an invalid update error.
    pub fn invalid_update(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidUpdate {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if retrying the failed operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
