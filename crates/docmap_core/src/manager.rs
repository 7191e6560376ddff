//! The session facade.

use crate::config::Configuration;
use crate::document::{DocumentRef, FieldValue, Link, Proxy};
use crate::error::{CoreError, CoreResult};
use crate::types::DocumentState;
use crate::unit_of_work::{FlushReport, UnitOfWork};
use docmap_codec::Value;
use docmap_storage::{DocumentBackend, Filter};
use std::sync::Arc;

/// Entry point for working with mapped documents.
///
/// Wraps a [`UnitOfWork`] and adds lazy reference resolution.
///
/// ```rust
/// use docmap_core::{ClassMetadata, Configuration, DocumentManager, DocumentRef, IdStrategy, MetadataRegistry};
/// use docmap_storage::InMemoryBackend;
/// use std::sync::Arc;
///
/// let registry = MetadataRegistry::builder()
///     .class(ClassMetadata::document("User").collection("users").id("id", IdStrategy::Auto).field("name"))
///     .build()
///     .unwrap();
/// let mut dm = DocumentManager::new(Configuration::new(registry), Arc::new(InMemoryBackend::new()));
///
/// let user = DocumentRef::new("User").with("name", "alice");
/// dm.persist(&user).unwrap();
/// dm.flush().unwrap();
///
/// let id = user.scalar("id").unwrap();
/// let found = dm.find("User", id).unwrap().unwrap();
/// assert!(found.ptr_eq(&user));
/// ```
#[derive(Debug)]
pub struct DocumentManager {
    uow: UnitOfWork,
}

impl DocumentManager {
    /// Opens a session on `backend`.
    pub fn new(config: impl Into<Arc<Configuration>>, backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            uow: UnitOfWork::new(config.into(), backend),
        }
    }

    /// Returns the unit of work.
    #[must_use]
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.uow
    }

    /// Returns the unit of work mutably.
    pub fn unit_of_work_mut(&mut self) -> &mut UnitOfWork {
        &mut self.uow
    }

    /// See [`UnitOfWork::persist`].
    pub fn persist(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.uow.persist(document)
    }

    /// See [`UnitOfWork::remove`].
    pub fn remove(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.uow.remove(document)
    }

    /// Writes all pending changes. See [`UnitOfWork::commit`].
    pub fn flush(&mut self) -> CoreResult<FlushReport> {
        self.uow.commit()
    }

    /// Finds a document by identifier.
    pub fn find(&mut self, class: &str, id: impl Into<Value>) -> CoreResult<Option<DocumentRef>> {
        self.uow.find(class, &id.into())
    }

    /// Finds every document of `class` matching `filter`.
    pub fn find_by(&mut self, class: &str, filter: &Filter) -> CoreResult<Vec<DocumentRef>> {
        self.uow.find_by(class, filter)
    }

    /// Returns a link to a document without loading it.
    ///
    /// The link is loaded if the document is already managed.
    pub fn reference(&self, class: &str, id: impl Into<Value>) -> CoreResult<Link> {
        let id = id.into();
        let meta = self.uow.metadata().get(class)?;
        match self.uow.identity_map().get(meta.root(), &id)? {
            Some(document) => Ok(Link::Loaded(document)),
            None => Ok(Link::Unloaded(Proxy::new(class, id))),
        }
    }

    /// Loads the unloaded targets of a reference field in place.
    ///
    /// # Errors
    ///
    /// [`CoreError::Mapping`] if `field` is not a reference field,
    /// [`CoreError::DocumentNotFound`] if a target no longer exists.
    pub fn resolve(&mut self, document: &DocumentRef, field: &str) -> CoreResult<()> {
        let class = document.class();
        let meta = self.uow.metadata().get(&class)?;
        if !meta.field(field).is_some_and(|m| m.kind.is_reference()) {
            return Err(CoreError::mapping(class, format!("'{field}' is not a reference field")));
        }

        match document.get(field) {
            Some(FieldValue::One(Link::Unloaded(proxy))) => {
                let target = self.load(&proxy)?;
                document.set(field, target);
            }
            Some(FieldValue::Many(container)) => {
                for (index, link) in container.links().into_iter().enumerate() {
                    if let Link::Unloaded(proxy) = link {
                        let target = self.load(&proxy)?;
                        container.replace(index, target);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn load(&mut self, proxy: &Proxy) -> CoreResult<DocumentRef> {
        self.uow
            .find(&proxy.class, &proxy.id)?
            .ok_or_else(|| CoreError::not_found(&proxy.class, &proxy.id))
    }

    /// See [`UnitOfWork::refresh`].
    pub fn refresh(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.uow.refresh(document)
    }

    /// See [`UnitOfWork::detach`].
    pub fn detach(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.uow.detach(document)
    }

    /// Detaches every document.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.uow.clear()
    }

    /// Returns `true` if the document is managed by this session.
    #[must_use]
    pub fn contains(&self, document: &DocumentRef) -> bool {
        self.uow.contains(document)
    }

    /// Returns the state of a document in this session.
    #[must_use]
    pub fn state_of(&self, document: &DocumentRef) -> DocumentState {
        self.uow.state_of(document)
    }

    /// Closes the session.
    pub fn close(&mut self) {
        self.uow.close();
    }

    /// Returns `true` until the session is closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.uow.is_open()
    }
}
