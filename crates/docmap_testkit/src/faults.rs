//! Fault injection for backends.
//!
//! [`FaultInjectingBackend`] wraps an [`InMemoryBackend`] and fails chosen
//! calls with chosen errors, so tests can drive a unit of work through
//! partial failures, transient errors and failed transaction commits.

use docmap_codec::Value;
use docmap_storage::{
    DocumentBackend, Filter, InMemoryBackend, StorageError, StorageResult, UpdateOutcome, UpdateSpec,
};
use parking_lot::Mutex;

/// A backend call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// [`DocumentBackend::insert`].
    Insert,
    /// [`DocumentBackend::update`].
    Update,
    /// [`DocumentBackend::upsert`].
    Upsert,
    /// [`DocumentBackend::delete`].
    Delete,
    /// [`DocumentBackend::commit_transaction`].
    Commit,
}

#[derive(Debug, Clone)]
struct Fault {
    point: FaultPoint,
    collection: Option<String>,
    error: StorageError,
    remaining: usize,
}

/// An [`InMemoryBackend`] that fails on request.
///
/// Every write call is recorded, including failed ones.
#[derive(Debug, Default)]
pub struct FaultInjectingBackend {
    inner: InMemoryBackend,
    faults: Mutex<Vec<Fault>>,
    calls: Mutex<Vec<(FaultPoint, String)>>,
}

impl FaultInjectingBackend {
    /// Creates a backend with no faults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &InMemoryBackend {
        &self.inner
    }

    /// Fails the next call at `point`, in any collection.
    pub fn fail_next(&self, point: FaultPoint, error: StorageError) {
        self.fail_times(point, None, error, 1);
    }

    /// Fails the next `times` calls at `point` in `collection` (any
    /// collection if `None`).
    pub fn fail_times(&self, point: FaultPoint, collection: Option<&str>, error: StorageError, times: usize) {
        self.faults.lock().push(Fault {
            point,
            collection: collection.map(str::to_string),
            error,
            remaining: times,
        });
    }

    /// Fails every call at `point` in `collection` until faults are cleared.
    pub fn fail_always(&self, point: FaultPoint, collection: Option<&str>, error: StorageError) {
        self.fail_times(point, collection, error, usize::MAX);
    }

    /// Removes every pending fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Returns every recorded call in order.
    #[must_use]
    pub fn calls(&self) -> Vec<(FaultPoint, String)> {
        self.calls.lock().clone()
    }

    /// Returns how many calls were made at `point`.
    #[must_use]
    pub fn call_count(&self, point: FaultPoint) -> usize {
        self.calls.lock().iter().filter(|(p, _)| *p == point).count()
    }

    /// Returns the committed documents of a collection.
    #[must_use]
    pub fn committed(&self, collection: &str) -> Vec<Value> {
        self.inner.committed_documents(collection)
    }

    fn check(&self, point: FaultPoint, collection: &str) -> StorageResult<()> {
        self.calls.lock().push((point, collection.to_string()));
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|fault| {
            fault.point == point
                && fault.remaining > 0
                && fault.collection.as_deref().map_or(true, |c| c == collection)
        });
        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                tracing::debug!(?point, collection, error = %fault.error, "injecting fault");
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }
}

impl DocumentBackend for FaultInjectingBackend {
    fn insert(&self, collection: &str, document: Value) -> StorageResult<Value> {
        self.check(FaultPoint::Insert, collection)?;
        self.inner.insert(collection, document)
    }

    fn update(&self, collection: &str, id: &Value, update: &UpdateSpec) -> StorageResult<UpdateOutcome> {
        self.check(FaultPoint::Update, collection)?;
        self.inner.update(collection, id, update)
    }

    fn upsert(&self, collection: &str, id: &Value, update: &UpdateSpec) -> StorageResult<UpdateOutcome> {
        self.check(FaultPoint::Upsert, collection)?;
        self.inner.upsert(collection, id, update)
    }

    fn delete(&self, collection: &str, id: &Value) -> StorageResult<bool> {
        self.check(FaultPoint::Delete, collection)?;
        self.inner.delete(collection, id)
    }

    fn find_one(&self, collection: &str, id: &Value) -> StorageResult<Option<Value>> {
        self.inner.find_one(collection, id)
    }

    fn find(&self, collection: &str, filter: &Filter) -> StorageResult<Vec<Value>> {
        self.inner.find(collection, filter)
    }

    fn supports_transactions(&self) -> bool {
        self.inner.supports_transactions()
    }

    fn start_transaction(&self) -> StorageResult<()> {
        self.inner.start_transaction()
    }

    fn commit_transaction(&self) -> StorageResult<()> {
        self.check(FaultPoint::Commit, "")?;
        self.inner.commit_transaction()
    }

    fn abort_transaction(&self) -> StorageResult<()> {
        self.inner.abort_transaction()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faults_fire_then_expire() {
        let backend = FaultInjectingBackend::new();
        backend.fail_next(FaultPoint::Insert, StorageError::transient("flaky"));

        let doc = Value::map([("name", Value::from("a"))]);
        assert_eq!(backend.insert("users", doc.clone()), Err(StorageError::transient("flaky")));
        assert!(backend.insert("users", doc).is_ok());
        assert_eq!(backend.call_count(FaultPoint::Insert), 2);
        assert_eq!(backend.committed("users").len(), 1);
    }

    #[test]
    fn faults_can_target_a_collection() {
        let backend = FaultInjectingBackend::new();
        backend.fail_always(FaultPoint::Insert, Some("groups"), StorageError::fatal("down"));

        assert!(backend.insert("users", Value::map([("a", Value::Integer(1))])).is_ok());
        assert!(backend.insert("groups", Value::map([("a", Value::Integer(1))])).is_err());
        assert!(backend.insert("groups", Value::map([("a", Value::Integer(2))])).is_err());

        backend.clear_faults();
        assert!(backend.insert("groups", Value::map([("a", Value::Integer(3))])).is_ok());
    }
}
