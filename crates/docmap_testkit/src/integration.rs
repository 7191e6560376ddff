//! Cross-crate integration helpers.
//!
//! [`RecordingPersister`] wraps the persister of one class and records
//! every write the unit of work issues through it, so tests can assert on
//! write order and on exactly which documents were written.

use docmap_codec::Value;
use docmap_core::{
    ChangeSet, ClassMetadata, CoreError, CoreResult, DocumentManager, DocumentPersister, DocumentRef, WriteOperation,
};
use docmap_storage::{Filter, StorageError};
use parking_lot::Mutex;
use std::sync::Arc;

/// One write seen by a [`RecordingPersister`].
#[derive(Debug, Clone, PartialEq)]
pub struct PersisterCall {
    /// The write.
    pub operation: WriteOperation,
    /// Class of the persister.
    pub class: String,
    /// Identifier of the document when the call was made.
    pub id: Option<Value>,
    /// Fields in the change set, for updates.
    pub fields: Vec<String>,
}

/// A shared, ordered log of persister calls.
pub type CallLog = Arc<Mutex<Vec<PersisterCall>>>;

/// Records writes before delegating to another persister.
///
/// Calls can be made to fail by class and operation without touching the
/// backend.
pub struct RecordingPersister {
    inner: Arc<dyn DocumentPersister>,
    log: CallLog,
    failing: Mutex<Vec<WriteOperation>>,
}

impl RecordingPersister {
    /// Wraps `inner`, appending to `log`.
    pub fn new(inner: Arc<dyn DocumentPersister>, log: CallLog) -> Self {
        Self {
            inner,
            log,
            failing: Mutex::new(Vec::new()),
        }
    }

    /// Makes every later `operation` fail with a fatal storage error.
    pub fn fail(&self, operation: WriteOperation) {
        self.failing.lock().push(operation);
    }

    /// Stops failing `operation`.
    pub fn heal(&self, operation: WriteOperation) {
        self.failing.lock().retain(|op| *op != operation);
    }

    fn record(&self, operation: WriteOperation, document: &DocumentRef, change_set: Option<&ChangeSet>) -> CoreResult<()> {
        self.log.lock().push(PersisterCall {
            operation,
            class: self.inner.metadata().name().to_string(),
            id: self.inner.metadata().identifier(document),
            fields: change_set
                .map(|cs| cs.fields().map(str::to_string).collect())
                .unwrap_or_default(),
        });
        if self.failing.lock().contains(&operation) {
            return Err(CoreError::Storage(StorageError::fatal(format!("{operation} refused"))));
        }
        Ok(())
    }
}

impl DocumentPersister for RecordingPersister {
    fn metadata(&self) -> &ClassMetadata {
        self.inner.metadata()
    }

    fn insert(&self, document: &DocumentRef) -> CoreResult<Value> {
        self.record(WriteOperation::Insert, document, None)?;
        self.inner.insert(document)
    }

    fn upsert(&self, document: &DocumentRef) -> CoreResult<()> {
        self.record(WriteOperation::Upsert, document, None)?;
        self.inner.upsert(document)
    }

    fn update(&self, document: &DocumentRef, change_set: &ChangeSet) -> CoreResult<()> {
        self.record(WriteOperation::Update, document, Some(change_set))?;
        self.inner.update(document, change_set)
    }

    fn delete(&self, document: &DocumentRef) -> CoreResult<()> {
        self.record(WriteOperation::Delete, document, None)?;
        self.inner.delete(document)
    }

    fn exists(&self, document: &DocumentRef) -> CoreResult<bool> {
        self.inner.exists(document)
    }

    fn load(&self, id: &Value) -> CoreResult<Option<Value>> {
        self.inner.load(id)
    }

    fn load_all(&self, filter: &Filter) -> CoreResult<Vec<Value>> {
        self.inner.load_all(filter)
    }
}

/// Installs a [`RecordingPersister`] for each class, all sharing one log.
///
/// Returns the log and the installed persisters in `classes` order.
pub fn record_writes(dm: &mut DocumentManager, classes: &[&str]) -> (CallLog, Vec<Arc<RecordingPersister>>) {
    let log = CallLog::default();
    let mut installed = Vec::with_capacity(classes.len());
    for class in classes {
        let uow = dm.unit_of_work_mut();
        let inner = uow.persister(class).expect("class is mapped");
        let recording = Arc::new(RecordingPersister::new(inner, Arc::clone(&log)));
        uow.set_persister(class, Arc::clone(&recording) as Arc<dyn DocumentPersister>)
            .expect("class is mapped");
        installed.push(recording);
    }
    (log, installed)
}

/// Returns the classes of a call log in order, without repeats of the same
/// class in a row.
#[must_use]
pub fn class_sequence(log: &CallLog, operation: WriteOperation) -> Vec<String> {
    let mut sequence: Vec<String> = Vec::new();
    for call in log.lock().iter().filter(|call| call.operation == operation) {
        if sequence.last() != Some(&call.class) {
            sequence.push(call.class.clone());
        }
    }
    sequence
}
