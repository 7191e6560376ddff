//! Per-class persistence.
//!
//! The unit of work never talks to a backend directly. For every class it
//! asks a [`DocumentPersister`] to write documents and load their stored
//! form. [`StoragePersister`] is the default, translating through a
//! [`PersistenceBuilder`] onto a [`DocumentBackend`](docmap_storage::DocumentBackend);
//! stored documents are turned back into [`DocumentRef`]s by a [`Hydrator`].

mod builder;
mod hydrator;
mod storage;

pub use builder::PersistenceBuilder;
pub(crate) use builder::DeferredReference;
pub use hydrator::Hydrator;
pub use storage::StoragePersister;

use crate::changeset::ChangeSet;
use crate::document::DocumentRef;
use crate::error::CoreResult;
use crate::metadata::ClassMetadata;
use docmap_codec::Value;
use docmap_storage::Filter;

/// Writes and loads documents of one class.
///
/// Every call reports success or failure explicitly; the unit of work
/// decides what a failure means for its scheduling state.
pub trait DocumentPersister: Send + Sync {
    /// Metadata of the class this persister serves.
    fn metadata(&self) -> &ClassMetadata;

    /// Inserts a NEW document and returns its identifier.
    fn insert(&self, document: &DocumentRef) -> CoreResult<Value>;

    /// Inserts or replaces a document whose identifier was assigned by the
    /// caller.
    fn upsert(&self, document: &DocumentRef) -> CoreResult<()>;

    /// Writes the changes in `change_set`.
    fn update(&self, document: &DocumentRef, change_set: &ChangeSet) -> CoreResult<()>;

    /// Deletes a document.
    fn delete(&self, document: &DocumentRef) -> CoreResult<()>;

    /// Returns `true` if the document is stored.
    fn exists(&self, document: &DocumentRef) -> CoreResult<bool>;

    /// Loads the stored form of one document.
    fn load(&self, id: &Value) -> CoreResult<Option<Value>>;

    /// Loads the stored form of every matching document.
    fn load_all(&self, filter: &Filter) -> CoreResult<Vec<Value>>;

    /// Reloads the stored form of a managed document.
    fn refresh(&self, document: &DocumentRef) -> CoreResult<Option<Value>> {
        match self.metadata().identifier(document) {
            Some(id) => self.load(&id),
            None => Ok(None),
        }
    }
}
