//! The default, backend-backed persister.

use super::builder::PersistenceBuilder;
use super::DocumentPersister;
use crate::changeset::ChangeSet;
use crate::document::DocumentRef;
use crate::error::{CoreError, CoreResult};
use crate::metadata::{ClassMetadata, MetadataRegistry};
use docmap_codec::Value;
use docmap_storage::{DocumentBackend, Filter, StorageError};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Persists one class into its backend collection.
pub struct StoragePersister {
    backend: Arc<dyn DocumentBackend>,
    registry: Arc<MetadataRegistry>,
    meta: Arc<ClassMetadata>,
    collection: String,
}

impl StoragePersister {
    /// Creates a persister for `meta`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] if the class has no collection
    /// (embedded classes and mapped superclasses).
    pub fn new(
        backend: Arc<dyn DocumentBackend>,
        registry: Arc<MetadataRegistry>,
        meta: Arc<ClassMetadata>,
    ) -> CoreResult<Self> {
        let collection = meta
            .collection()
            .ok_or_else(|| CoreError::mapping(meta.name(), "class has no collection"))?
            .to_string();
        Ok(Self {
            backend,
            registry,
            meta,
            collection,
        })
    }

    /// Returns the collection this persister writes to.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn builder(&self) -> PersistenceBuilder<'_> {
        PersistenceBuilder::new(&self.registry)
    }

    fn require_id(&self, document: &DocumentRef) -> CoreResult<Value> {
        self.meta.identifier(document).ok_or_else(|| {
            CoreError::invalid_operation(format!(
                "'{}' document {} has no identifier",
                self.meta.name(),
                document.oid()
            ))
        })
    }
}

impl DocumentPersister for StoragePersister {
    fn metadata(&self) -> &ClassMetadata {
        &self.meta
    }

    fn insert(&self, document: &DocumentRef) -> CoreResult<Value> {
        let data = self.builder().insert_data(&self.meta, document)?;
        let id = self.backend.insert(&self.collection, data)?;
        debug!(collection = %self.collection, id = %id, "inserted document");
        Ok(id)
    }

    fn upsert(&self, document: &DocumentRef) -> CoreResult<()> {
        let id = self.require_id(document)?;
        let update = self.builder().upsert_data(&self.meta, document)?;
        let outcome = self.backend.upsert(&self.collection, &id, &update)?;
        debug!(collection = %self.collection, id = %id, created = outcome.upserted, "upserted document");
        Ok(())
    }

    fn update(&self, document: &DocumentRef, change_set: &ChangeSet) -> CoreResult<()> {
        let id = self.require_id(document)?;
        let update = self.builder().update_data(&self.meta, document, change_set)?;
        if update.is_empty() {
            return Ok(());
        }
        let outcome = self.backend.update(&self.collection, &id, &update)?;
        if !outcome.matched {
            if let Some(expected) = self.meta.version_of(&document.read()) {
                return Err(StorageError::VersionConflict {
                    collection: self.collection.clone(),
                    id: id.to_string(),
                    expected,
                }
                .into());
            }
            debug!(collection = %self.collection, id = %id, "update matched no document");
        }
        Ok(())
    }

    fn delete(&self, document: &DocumentRef) -> CoreResult<()> {
        let id = self.require_id(document)?;
        let deleted = self.backend.delete(&self.collection, &id)?;
        debug!(collection = %self.collection, id = %id, deleted, "deleted document");
        Ok(())
    }

    fn exists(&self, document: &DocumentRef) -> CoreResult<bool> {
        match self.meta.identifier(document) {
            Some(id) => Ok(self.backend.find_one(&self.collection, &id)?.is_some()),
            None => Ok(false),
        }
    }

    fn load(&self, id: &Value) -> CoreResult<Option<Value>> {
        Ok(self.backend.find_one(&self.collection, id)?)
    }

    fn load_all(&self, filter: &Filter) -> CoreResult<Vec<Value>> {
        Ok(self.backend.find(&self.collection, filter)?)
    }
}

impl fmt::Debug for StoragePersister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoragePersister")
            .field("class", &self.meta.name())
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeSetComputer, OriginalData};
    use crate::metadata::IdStrategy;
    use docmap_storage::InMemoryBackend;

    fn setup() -> (Arc<InMemoryBackend>, StoragePersister) {
        let registry = Arc::new(
            MetadataRegistry::builder()
                .class(
                    ClassMetadata::document("User")
                        .collection("users")
                        .id("id", IdStrategy::Auto)
                        .version("version")
                        .field("name"),
                )
                .class(ClassMetadata::embedded("Address").field("city"))
                .build()
                .unwrap(),
        );
        let backend = Arc::new(InMemoryBackend::new());
        let meta = Arc::clone(registry.get("User").unwrap());
        let persister = StoragePersister::new(backend.clone(), registry, meta).unwrap();
        (backend, persister)
    }

    fn change(persister: &StoragePersister, doc: &DocumentRef, name: &str) -> ChangeSet {
        let registry = &persister.registry;
        let original = OriginalData::capture(registry, &persister.meta, doc).unwrap();
        doc.set("name", name);
        ChangeSetComputer::new(registry)
            .compute(&persister.meta, Some(&original), doc)
            .unwrap()
    }

    #[test]
    fn insert_returns_generated_id() {
        let (backend, persister) = setup();
        let doc = DocumentRef::new("User").with("name", "alice").with("version", 1);
        let id = persister.insert(&doc).unwrap();
        assert!(id.as_object_id().is_some());
        assert_eq!(backend.count("users").unwrap(), 1);
        assert_eq!(persister.load(&id).unwrap().unwrap().get("name"), Some(&Value::from("alice")));
    }

    #[test]
    fn update_increments_version() {
        let (_backend, persister) = setup();
        let doc = DocumentRef::new("User").with("name", "alice").with("version", 1);
        let id = persister.insert(&doc).unwrap();
        doc.set("id", id.clone());

        let cs = change(&persister, &doc, "bob");
        persister.update(&doc, &cs).unwrap();
        let stored = persister.load(&id).unwrap().unwrap();
        assert_eq!(stored.get("name"), Some(&Value::from("bob")));
        assert_eq!(stored.get("version"), Some(&Value::Integer(2)));
    }

    #[test]
    fn stale_version_is_a_conflict() {
        let (_backend, persister) = setup();
        let doc = DocumentRef::new("User").with("name", "alice").with("version", 1);
        let id = persister.insert(&doc).unwrap();
        doc.set("id", id);
        doc.set("version", 5);

        let cs = change(&persister, &doc, "bob");
        let err = persister.update(&doc, &cs).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Storage(StorageError::VersionConflict { expected: 5, .. })
        ));
    }

    #[test]
    fn upsert_delete_and_exists() {
        let (_backend, persister) = setup();
        let doc = DocumentRef::new("User").with("id", "u1").with("name", "alice");
        assert!(!persister.exists(&doc).unwrap());

        persister.upsert(&doc).unwrap();
        assert!(persister.exists(&doc).unwrap());
        assert_eq!(persister.load_all(&Filter::all().eq("name", Value::from("alice"))).unwrap().len(), 1);
        assert!(persister.refresh(&doc).unwrap().is_some());

        persister.delete(&doc).unwrap();
        assert!(!persister.exists(&doc).unwrap());
    }

    #[test]
    fn classes_without_collection_are_rejected() {
        let (backend, persister) = setup();
        let meta = Arc::clone(persister.registry.get("Address").unwrap());
        let err = StoragePersister::new(backend, Arc::clone(&persister.registry), meta).unwrap_err();
        assert!(matches!(err, CoreError::Mapping { .. }));
    }
}
