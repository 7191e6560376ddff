//! Document backend trait definition.

use crate::error::StorageResult;
use crate::update::{Filter, UpdateSpec};
use docmap_codec::Value;

/// Outcome of an update or upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateOutcome {
    /// A stored document matched the id and all preconditions.
    pub matched: bool,
    /// No document matched and a new one was created.
    pub upserted: bool,
}

/// A document store organised in named collections.
///
/// Documents are map [`Value`]s keyed by their `_id` field. Backends know
/// nothing about mapped classes, change tracking or identity; the unit of
/// work drives them through per-class persisters.
///
/// # Invariants
///
/// - `insert` never overwrites: an existing `_id` is a
///   [`StorageError::DuplicateKey`](crate::StorageError::DuplicateKey)
/// - `insert` of a document without `_id` assigns a fresh
///   [`ObjectId`](docmap_codec::ObjectId) and returns it
/// - an update whose preconditions fail reports `matched == false` and
///   changes nothing
/// - while a transaction is active, writes are invisible to other
///   readers of the committed state and are discarded by `abort_transaction`
/// - Backends must be `Send + Sync`
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing and embedded use
pub trait DocumentBackend: Send + Sync {
    /// Inserts a document, returning its `_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `_id` already exists, the document is not a
    /// map, or the backend fails.
    fn insert(&self, collection: &str, document: Value) -> StorageResult<Value>;

    /// Applies `update` to the document with the given `_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if an operator does not fit the stored document or
    /// the backend fails. A missing document is not an error.
    fn update(&self, collection: &str, id: &Value, update: &UpdateSpec)
        -> StorageResult<UpdateOutcome>;

    /// Like [`update`](Self::update), but creates `{_id: id}` with the
    /// update applied when no document has that `_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if an operator does not fit or the backend fails.
    fn upsert(&self, collection: &str, id: &Value, update: &UpdateSpec)
        -> StorageResult<UpdateOutcome>;

    /// Deletes the document with the given `_id`, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn delete(&self, collection: &str, id: &Value) -> StorageResult<bool>;

    /// Fetches the document with the given `_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn find_one(&self, collection: &str, id: &Value) -> StorageResult<Option<Value>>;

    /// Fetches every document matching `filter`, in a stable order.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn find(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<Value>>;

    /// Returns the number of documents in a collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    fn count(&self, collection: &str) -> StorageResult<usize> {
        Ok(self.find(collection, &Filter::all())?.len())
    }

    /// Returns `true` if this backend can run multi-document transactions.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Starts a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if transactions are unsupported or one is active.
    fn start_transaction(&self) -> StorageResult<()> {
        Err(crate::StorageError::Unsupported("transactions".into()))
    }

    /// Commits the active transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is active or the commit fails.
    fn commit_transaction(&self) -> StorageResult<()> {
        Err(crate::StorageError::Unsupported("transactions".into()))
    }

    /// Discards the active transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if no transaction is active.
    fn abort_transaction(&self) -> StorageResult<()> {
        Err(crate::StorageError::Unsupported("transactions".into()))
    }
}
