//! In-memory document backend.

use crate::backend::{DocumentBackend, UpdateOutcome};
use crate::error::{StorageError, StorageResult};
use crate::update::{Filter, UpdateSpec};
use docmap_codec::{from_cbor, to_canonical_cbor, ObjectId, Value};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::trace;

/// Encoded `_id` -> encoded document.
type Collection = BTreeMap<Vec<u8>, Vec<u8>>;
type Collections = BTreeMap<String, Collection>;

#[derive(Debug, Default)]
struct State {
    committed: Collections,
    /// Working copy while a transaction is active.
    staged: Option<Collections>,
    closed: bool,
}

impl State {
    fn visible(&self) -> &Collections {
        self.staged.as_ref().unwrap_or(&self.committed)
    }

    fn writable(&mut self) -> &mut Collections {
        match &mut self.staged {
            Some(staged) => staged,
            None => &mut self.committed,
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

/// An in-memory document backend.
///
/// Documents are stored in their canonical binary form, so what comes back
/// from a read is exactly what a real store would return: a fresh,
/// key-sorted copy. Transactions are supported by staging a copy of all
/// collections and swapping it in on commit.
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use docmap_codec::Value;
/// use docmap_storage::{DocumentBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// let id = backend
///     .insert("users", Value::map([("name", Value::from("alice"))]))
///     .unwrap();
/// let doc = backend.find_one("users", &id).unwrap().unwrap();
/// assert_eq!(doc.get("name"), Some(&Value::from("alice")));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: RwLock<State>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every committed document of a collection in `_id` order.
    ///
    /// Ignores any active transaction. Useful for assertions in tests.
    #[must_use]
    pub fn committed_documents(&self, collection: &str) -> Vec<Value> {
        let state = self.state.read();
        state
            .committed
            .get(collection)
            .map(|docs| docs.values().filter_map(|bytes| from_cbor(bytes).ok()).collect())
            .unwrap_or_default()
    }

    /// Returns the names of all non-empty committed collections.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .committed
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Returns `true` while a transaction is active.
    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.state.read().staged.is_some()
    }

    /// Closes the backend. Every later call fails with [`StorageError::Closed`].
    pub fn close(&self) {
        self.state.write().closed = true;
    }

    fn apply_update(
        &self,
        collection: &str,
        id: &Value,
        update: &UpdateSpec,
        upsert: bool,
    ) -> StorageResult<UpdateOutcome> {
        let key = to_canonical_cbor(id)?;
        let mut state = self.state.write();
        state.ensure_open()?;
        let docs = state.writable().entry(collection.to_string()).or_default();

        let (mut document, upserted) = match docs.get(&key) {
            Some(bytes) => {
                let stored = from_cbor(bytes)?;
                if !update.matches(&stored) {
                    return Ok(UpdateOutcome::default());
                }
                (stored, false)
            }
            None if upsert => (Value::map([("_id", id.clone())]), true),
            None => return Ok(UpdateOutcome::default()),
        };

        update.apply(&mut document)?;
        if document.get("_id") != Some(id) {
            return Err(StorageError::invalid_update("_id", "the identifier is immutable"));
        }
        docs.insert(key, to_canonical_cbor(&document)?);
        Ok(UpdateOutcome {
            matched: !upserted,
            upserted,
        })
    }
}

impl DocumentBackend for InMemoryBackend {
    fn insert(&self, collection: &str, document: Value) -> StorageResult<Value> {
        let mut pairs = match document {
            Value::Map(pairs) => pairs,
            other => {
                return Err(StorageError::fatal(format!(
                    "cannot insert {} into '{collection}'",
                    other.type_name()
                )))
            }
        };

        let id = match pairs.iter().find(|(k, _)| k == "_id") {
            Some((_, id)) if !id.is_null() => id.clone(),
            _ => {
                let id = Value::ObjectId(ObjectId::new());
                pairs.retain(|(k, _)| k != "_id");
                pairs.insert(0, ("_id".to_string(), id.clone()));
                id
            }
        };

        let key = to_canonical_cbor(&id)?;
        let bytes = to_canonical_cbor(&Value::Map(pairs))?;

        let mut state = self.state.write();
        state.ensure_open()?;
        let docs = state.writable().entry(collection.to_string()).or_default();
        if docs.contains_key(&key) {
            return Err(StorageError::DuplicateKey {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(key, bytes);
        Ok(id)
    }

    fn update(
        &self,
        collection: &str,
        id: &Value,
        update: &UpdateSpec,
    ) -> StorageResult<UpdateOutcome> {
        self.apply_update(collection, id, update, false)
    }

    fn upsert(
        &self,
        collection: &str,
        id: &Value,
        update: &UpdateSpec,
    ) -> StorageResult<UpdateOutcome> {
        self.apply_update(collection, id, update, true)
    }

    fn delete(&self, collection: &str, id: &Value) -> StorageResult<bool> {
        let key = to_canonical_cbor(id)?;
        let mut state = self.state.write();
        state.ensure_open()?;
        Ok(state
            .writable()
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(&key).is_some()))
    }

    fn find_one(&self, collection: &str, id: &Value) -> StorageResult<Option<Value>> {
        let key = to_canonical_cbor(id)?;
        let state = self.state.read();
        state.ensure_open()?;
        state
            .visible()
            .get(collection)
            .and_then(|docs| docs.get(&key))
            .map(|bytes| from_cbor(bytes).map_err(StorageError::from))
            .transpose()
    }

    fn find(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<Value>> {
        let state = self.state.read();
        state.ensure_open()?;
        let Some(docs) = state.visible().get(collection) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for bytes in docs.values() {
            let document = from_cbor(bytes)?;
            if filter.matches(&document) {
                found.push(document);
            }
        }
        Ok(found)
    }

    fn count(&self, collection: &str) -> StorageResult<usize> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.visible().get(collection).map_or(0, BTreeMap::len))
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn start_transaction(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if state.staged.is_some() {
            return Err(StorageError::transaction("a transaction is already active"));
        }
        state.staged = Some(state.committed.clone());
        trace!("transaction started");
        Ok(())
    }

    fn commit_transaction(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let staged = state
            .staged
            .take()
            .ok_or_else(|| StorageError::transaction("no active transaction"))?;
        state.committed = staged;
        trace!("transaction committed");
        Ok(())
    }

    fn abort_transaction(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        if state.staged.take().is_none() {
            return Err(StorageError::transaction("no active transaction"));
        }
        trace!("transaction aborted");
        Ok(())
    }
}
