//! Error types for DocMap core.

use crate::types::Oid;
use std::fmt;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in DocMap core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] docmap_storage::StorageError),

    /// Codec error.
    #[error("codec error: {0}")]
    Codec(#[from] docmap_codec::CodecError),

    /// The class is unknown, not persistable, or its metadata is invalid.
    #[error("mapping error for '{class}': {message}")]
    Mapping {
        /// The class involved.
        class: String,
        /// Description of the problem.
        message: String,
    },

    /// Two distinct instances claim the same identity.
    #[error("identity conflict: another instance of '{class}' is already managed with id {id}")]
    IdentityConflict {
        /// Root class of the identity.
        class: String,
        /// Rendered identifier.
        id: String,
    },

    /// A managed document references a NEW document through a field
    /// that does not cascade persist.
    #[error("'{class}.{field}' references a new '{target}' that was not persisted")]
    UnpersistedReference {
        /// Class of the referencing document.
        class: String,
        /// The reference field.
        field: String,
        /// Class of the unpersisted target.
        target: String,
    },

    /// A document could not be found in storage.
    #[error("document not found: '{class}' with id {id}")]
    DocumentNotFound {
        /// Class searched.
        class: String,
        /// Rendered identifier.
        id: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The session was closed.
    #[error("session is closed")]
    SessionClosed,

    /// One or more scheduled writes failed during a commit.
    ///
    /// The first entry is the first failure observed.
    #[error("commit failed: {} write(s) did not complete, first: {}", .failures.len(), FirstFailure(.failures))]
    CommitFailed {
        /// Every failed write, in execution order.
        failures: Vec<WriteFailure>,
    },
}

impl CoreError {
    /// Creates a mapping error.
    pub fn mapping(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mapping {
            class: class.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a document-not-found error.
    pub fn not_found(class: impl Into<String>, id: &docmap_codec::Value) -> Self {
        Self::DocumentNotFound {
            class: class.into(),
            id: id.to_string(),
        }
    }

    /// Returns `true` if the error comes from a retryable storage failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::CommitFailed { failures } => {
                !failures.is_empty() && failures.iter().all(|f| f.error.is_transient())
            }
            _ => false,
        }
    }

    /// Returns the failed writes of a [`CoreError::CommitFailed`], or an
    /// empty slice for any other error.
    #[must_use]
    pub fn failures(&self) -> &[WriteFailure] {
        match self {
            Self::CommitFailed { failures } => failures,
            _ => &[],
        }
    }
}

/// The kind of write a flush issues for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteOperation {
    /// Insert with a generated identifier.
    Insert,
    /// Insert-or-update with a caller-assigned identifier.
    Upsert,
    /// Incremental update from a change set.
    Update,
    /// Delete.
    Delete,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "insert",
            Self::Upsert => "upsert",
            Self::Update => "update",
            Self::Delete => "delete",
        })
    }
}

/// A single write that failed during a commit.
#[derive(Debug)]
pub struct WriteFailure {
    /// What was attempted.
    pub operation: WriteOperation,
    /// Class of the document.
    pub class: String,
    /// The document's session identity.
    pub document: Oid,
    /// Why it failed.
    pub error: Box<CoreError>,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of '{}' ({}) failed: {}",
            self.operation, self.class, self.document, self.error
        )
    }
}

struct FirstFailure<'a>(&'a [WriteFailure]);

impl fmt::Display for FirstFailure<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.first() {
            Some(first) => write!(f, "{first}"),
            None => f.write_str("none"),
        }
    }
}
