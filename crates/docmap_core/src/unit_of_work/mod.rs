//! The unit of work.
//!
//! A [`UnitOfWork`] tracks every document of one session:
//!
//! ```text
//!            persist              remove
//!   NEW ───────────────> MANAGED ────────> REMOVED ──(flush)──> NEW
//!                          │  ▲
//!             detach/clear │  │ load / register_managed
//!                          ▼  │
//!                       DETACHED
//! ```
//!
//! Writes are not issued when documents change. [`UnitOfWork::commit`]
//! diffs each managed document against its snapshot, orders the pending
//! work by class dependencies and runs it: upserts, inserts, updates, then
//! deletes in reverse order. A document whose write fails keeps its
//! schedule and change set, so committing again retries exactly what is
//! left.
//!
//! Embedded documents are tracked alongside their top-level owner. They
//! share its state, are never written on their own, and are scheduled for
//! deletion together with it.

mod flush;
mod queue;

pub use flush::FlushReport;

use self::queue::Schedule;
use crate::changeset::{embedded_element, embedded_meta, mismatch, ChangeSet, OriginalData};
use crate::config::Configuration;
use crate::document::{DocumentRef, FieldValue, Link, WeakDocumentRef};
use crate::error::{CoreError, CoreResult, WriteOperation};
use crate::event::LifecycleEvent;
use crate::identity_map::IdentityMap;
use crate::metadata::{Cascade, ClassMetadata, DocumentKind, FieldMapping, IdStrategy, MetadataRegistry, ID_DB_NAME};
use crate::persister::{DocumentPersister, Hydrator, StoragePersister};
use crate::stats::UnitOfWorkStats;
use crate::types::{DocumentState, Oid};
use docmap_codec::Value;
use docmap_storage::{DocumentBackend, Filter};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

type Visit = fn(&mut UnitOfWork, &DocumentRef, &mut HashSet<Oid>) -> CoreResult<()>;

/// Tracking state of one document.
#[derive(Debug, Clone)]
pub(crate) struct Tracked {
    document: DocumentRef,
    meta: Arc<ClassMetadata>,
    state: DocumentState,
    /// Last written state; `None` until the first successful write.
    original: Option<OriginalData>,
    change_set: Option<ChangeSet>,
    /// Top-level owner of an embedded document.
    parent: Option<Oid>,
}

/// A reference found while walking a document, with the field holding it.
struct ReferenceLink {
    owner: String,
    mapping: FieldMapping,
    link: Link,
}

/// Identity tracking, change computation and ordered writes for one
/// session.
///
/// A unit of work is used from one thread at a time (`&mut self`); create
/// one per concurrent task.
pub struct UnitOfWork {
    config: Arc<Configuration>,
    backend: Arc<dyn DocumentBackend>,
    persisters: HashMap<String, Arc<dyn DocumentPersister>>,
    identity_map: IdentityMap,
    tracked: HashMap<Oid, Tracked>,
    order: Vec<Oid>,
    schedule: Schedule,
    detached: HashMap<Oid, WeakDocumentRef>,
    stats: UnitOfWorkStats,
    closed: bool,
}

impl UnitOfWork {
    /// Creates a unit of work writing to `backend`.
    pub fn new(config: Arc<Configuration>, backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            config,
            backend,
            persisters: HashMap::new(),
            identity_map: IdentityMap::new(),
            tracked: HashMap::new(),
            order: Vec::new(),
            schedule: Schedule::default(),
            detached: HashMap::new(),
            stats: UnitOfWorkStats::new(),
            closed: false,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Returns the mapping metadata.
    #[must_use]
    pub fn metadata(&self) -> &MetadataRegistry {
        &self.config.metadata
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Returns the statistics.
    #[must_use]
    pub fn stats(&self) -> &UnitOfWorkStats {
        &self.stats
    }

    /// Returns the identity map.
    #[must_use]
    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    /// Returns `true` until [`close`](Self::close) is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Closes the session, discarding all tracking state.
    ///
    /// Every mutating call afterwards fails with
    /// [`CoreError::SessionClosed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!(tracked = self.tracked.len(), "closing unit of work");
        self.tracked.clear();
        self.order.clear();
        self.schedule.clear();
        self.identity_map.clear();
        self.detached.clear();
        self.persisters.clear();
        self.closed = true;
    }

    /// Replaces the persister used for `class`.
    pub fn set_persister(&mut self, class: &str, persister: Arc<dyn DocumentPersister>) -> CoreResult<()> {
        self.ensure_open()?;
        self.config.metadata.get(class)?;
        self.persisters.insert(class.to_string(), persister);
        Ok(())
    }

    /// Returns the persister for `class`, creating the default
    /// [`StoragePersister`] on first use.
    pub fn persister(&mut self, class: &str) -> CoreResult<Arc<dyn DocumentPersister>> {
        let meta = Arc::clone(self.config.metadata.get(class)?);
        self.persister_for(&meta)
    }

    // ---- state transitions ----

    /// Schedules a NEW document for insertion, or for an upsert when its
    /// identifier was assigned by the caller.
    ///
    /// Cascades to references mapped with `persist`. Persisting a managed
    /// document only cascades.
    ///
    /// # Errors
    ///
    /// - [`CoreError::Mapping`] for unknown classes, embedded classes,
    ///   mapped superclasses, and documents without an identifier under
    ///   [`IdStrategy::None`]
    /// - [`CoreError::IdentityConflict`] if another instance is managed
    ///   with the same identifier
    /// - [`CoreError::InvalidOperation`] for removed or detached documents
    pub fn persist(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.ensure_open()?;
        self.do_persist(document, &mut HashSet::new())
    }

    fn do_persist(&mut self, document: &DocumentRef, visited: &mut HashSet<Oid>) -> CoreResult<()> {
        let oid = document.oid();
        if !visited.insert(oid) {
            return Ok(());
        }
        let meta = match self.tracked.get(&oid) {
            Some(entry) if entry.parent.is_some() => {
                return Err(CoreError::invalid_operation(
                    "embedded documents are persisted with their parent",
                ))
            }
            Some(entry) if entry.state == DocumentState::Removed => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot persist removed '{}' document {oid}",
                    entry.meta.name()
                )))
            }
            Some(entry) => Arc::clone(&entry.meta),
            None if self.is_detached(document) => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot persist detached '{}' document {oid}",
                    document.class()
                )))
            }
            None => self.persist_new(document)?,
        };
        self.cascade(&meta, document, |c| c.persist, visited, Self::do_persist)
    }

    fn persist_new(&mut self, document: &DocumentRef) -> CoreResult<Arc<ClassMetadata>> {
        let registry = Arc::clone(&self.config.metadata);
        let class = document.class();
        let meta = Arc::clone(registry.get(&class)?);
        match meta.kind() {
            DocumentKind::Document => {}
            DocumentKind::Embedded => {
                return Err(CoreError::mapping(class, "embedded documents cannot be persisted directly"))
            }
            DocumentKind::MappedSuperclass => {
                return Err(CoreError::mapping(class, "mapped superclasses cannot be persisted"))
            }
        }

        self.config.events.dispatch(LifecycleEvent::PrePersist, document);

        let operation = match (meta.identifier(document), meta.id_strategy()) {
            (Some(_), _) => WriteOperation::Upsert,
            (None, IdStrategy::None) => {
                return Err(CoreError::mapping(
                    class,
                    "no identifier assigned and the identifier strategy is none",
                ))
            }
            (None, IdStrategy::Auto) => WriteOperation::Insert,
            (None, strategy) => {
                if let Some(id) = strategy.generate(&meta) {
                    meta.set_identifier(document, id);
                }
                WriteOperation::Insert
            }
        };

        let children = embedded_documents(&registry, &meta, document)?;
        if let Some(id) = meta.identifier(document) {
            self.identity_map.register(meta.root(), &id, document)?;
        }

        let oid = document.oid();
        self.track(
            oid,
            Tracked {
                document: document.clone(),
                meta: Arc::clone(&meta),
                state: DocumentState::Managed,
                original: None,
                change_set: None,
                parent: None,
            },
        );
        for (child, child_meta) in children {
            self.track(child.oid(), Tracked::embedded(child, child_meta, DocumentState::Managed, oid));
        }
        self.schedule.schedule(oid, operation);
        debug!(class = %class, document = %oid, operation = %operation, "scheduled document");
        Ok(meta)
    }

    /// Schedules a managed document for deletion.
    ///
    /// Cascades to references mapped with `remove` and to every embedded
    /// document. Removing a document that was never written simply
    /// forgets it; removing a NEW document does nothing.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidOperation`] for detached documents and for
    /// embedded documents removed on their own.
    pub fn remove(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.ensure_open()?;
        self.do_remove(document, &mut HashSet::new())
    }

    fn do_remove(&mut self, document: &DocumentRef, visited: &mut HashSet<Oid>) -> CoreResult<()> {
        let oid = document.oid();
        if !visited.insert(oid) {
            return Ok(());
        }
        let (meta, state) = match self.tracked.get(&oid) {
            Some(entry) if entry.parent.is_some() => {
                return Err(CoreError::invalid_operation(
                    "embedded documents are removed with their parent",
                ))
            }
            Some(entry) => (Some(Arc::clone(&entry.meta)), entry.state),
            None if self.is_detached(document) => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot remove detached '{}' document {oid}",
                    document.class()
                )))
            }
            None => (self.config.metadata.try_get(&document.class()).cloned(), DocumentState::New),
        };

        if let Some(meta) = &meta {
            self.cascade(meta, document, |c| c.remove, visited, Self::do_remove)?;
        }
        if state != DocumentState::Managed {
            return Ok(());
        }

        if self.schedule.is_scheduled(oid, WriteOperation::Insert) {
            debug!(document = %oid, "removed document that was never written");
            self.forget(oid);
            return Ok(());
        }

        self.config.events.dispatch(LifecycleEvent::PreRemove, document);
        self.sync_embedded(oid)?;
        for target in std::iter::once(oid).chain(self.children_of(oid)) {
            if let Some(entry) = self.tracked.get_mut(&target) {
                entry.state = DocumentState::Removed;
                entry.change_set = None;
            }
            self.schedule.schedule(target, WriteOperation::Delete);
        }
        debug!(document = %oid, "scheduled document for deletion");
        Ok(())
    }

    /// Stops tracking a document. Its pending work is discarded.
    ///
    /// Cascades to references mapped with `detach`.
    pub fn detach(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.ensure_open()?;
        self.do_detach(document, &mut HashSet::new())
    }

    fn do_detach(&mut self, document: &DocumentRef, visited: &mut HashSet<Oid>) -> CoreResult<()> {
        let oid = document.oid();
        if !visited.insert(oid) {
            return Ok(());
        }
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(());
        };
        if entry.parent.is_some() {
            return Err(CoreError::invalid_operation(
                "embedded documents are detached with their parent",
            ));
        }
        let meta = Arc::clone(&entry.meta);
        self.prune_detached();
        for child in self.children_of(oid) {
            if let Some(child_entry) = self.tracked.get(&child) {
                self.detached.insert(child, child_entry.document.downgrade());
            }
        }
        self.forget(oid);
        self.detached.insert(oid, document.downgrade());
        debug!(document = %oid, "detached document");
        self.cascade(&meta, document, |c| c.detach, visited, Self::do_detach)
    }

    /// Detaches every document.
    pub fn clear(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        self.prune_detached();
        for (oid, entry) in self.tracked.drain() {
            self.detached.insert(oid, entry.document.downgrade());
        }
        self.order.clear();
        self.schedule.clear();
        self.identity_map.clear();
        debug!("cleared unit of work");
        Ok(())
    }

    /// Reloads a managed document from storage, discarding local changes.
    ///
    /// Cascades to references mapped with `refresh`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidOperation`] if the document is not managed or
    ///   was never written
    /// - [`CoreError::DocumentNotFound`] if storage no longer has it
    pub fn refresh(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.ensure_open()?;
        self.do_refresh(document, &mut HashSet::new())
    }

    fn do_refresh(&mut self, document: &DocumentRef, visited: &mut HashSet<Oid>) -> CoreResult<()> {
        let oid = document.oid();
        if !visited.insert(oid) {
            return Ok(());
        }
        let meta = match self.tracked.get(&oid) {
            Some(entry) if entry.parent.is_none() && entry.state == DocumentState::Managed => {
                Arc::clone(&entry.meta)
            }
            _ => {
                return Err(CoreError::invalid_operation(format!(
                    "cannot refresh '{}' document {oid}: not managed",
                    document.class()
                )))
            }
        };
        let id = meta.identifier(document).ok_or_else(|| {
            CoreError::invalid_operation(format!("cannot refresh document {oid}: it was never written"))
        })?;

        let persister = self.persister_for(&meta)?;
        let data = persister
            .refresh(document)?
            .ok_or_else(|| CoreError::not_found(meta.name(), &id))?;

        let registry = Arc::clone(&self.config.metadata);
        {
            let identity_map = &self.identity_map;
            let lookup = |class: &str, id: &Value| lookup_in(&registry, identity_map, class, id);
            Hydrator::new(&registry).fill(&meta, document, &data, &lookup)?;
        }
        let original = OriginalData::capture(&registry, &meta, document)?;
        if let Some(entry) = self.tracked.get_mut(&oid) {
            entry.original = Some(original);
            entry.change_set = None;
        }
        self.schedule.remove(oid, WriteOperation::Update);
        self.sync_embedded(oid)?;
        debug!(document = %oid, "refreshed document");
        self.cascade(&meta, document, |c| c.refresh, visited, Self::do_refresh)
    }

    // ---- inspection ----

    /// Returns `true` if the document is managed and not scheduled for
    /// deletion.
    #[must_use]
    pub fn contains(&self, document: &DocumentRef) -> bool {
        self.state_of(document) == DocumentState::Managed
    }

    /// Returns the state of a document in this session.
    #[must_use]
    pub fn state_of(&self, document: &DocumentRef) -> DocumentState {
        match self.tracked.get(&document.oid()) {
            Some(entry) => entry.state,
            None if self.is_detached(document) => DocumentState::Detached,
            None => DocumentState::New,
        }
    }

    /// Returns `true` if the document waits to be inserted.
    #[must_use]
    pub fn is_scheduled_for_insert(&self, document: &DocumentRef) -> bool {
        self.schedule.is_scheduled(document.oid(), WriteOperation::Insert)
    }

    /// Returns `true` if the document waits to be upserted.
    #[must_use]
    pub fn is_scheduled_for_upsert(&self, document: &DocumentRef) -> bool {
        self.schedule.is_scheduled(document.oid(), WriteOperation::Upsert)
    }

    /// Returns `true` if the document waits to be updated.
    #[must_use]
    pub fn is_scheduled_for_update(&self, document: &DocumentRef) -> bool {
        self.schedule.is_scheduled(document.oid(), WriteOperation::Update)
    }

    /// Returns `true` if the document waits to be deleted.
    #[must_use]
    pub fn is_scheduled_for_delete(&self, document: &DocumentRef) -> bool {
        self.schedule.is_scheduled(document.oid(), WriteOperation::Delete)
    }

    /// Returns `true` if any write is pending.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.schedule.is_empty()
    }

    /// Returns the last computed change set of a top-level document.
    #[must_use]
    pub fn change_set(&self, document: &DocumentRef) -> Option<&ChangeSet> {
        self.tracked.get(&document.oid())?.change_set.as_ref()
    }

    /// Returns the snapshot a top-level document is diffed against.
    #[must_use]
    pub fn original_data(&self, document: &DocumentRef) -> Option<&OriginalData> {
        self.tracked.get(&document.oid())?.original.as_ref()
    }

    /// Returns every tracked top-level document in tracking order.
    #[must_use]
    pub fn managed_documents(&self) -> Vec<DocumentRef> {
        self.order
            .iter()
            .filter_map(|oid| self.tracked.get(oid))
            .filter(|entry| entry.parent.is_none())
            .map(|entry| entry.document.clone())
            .collect()
    }

    // ---- loading ----

    /// Starts tracking a document that already exists in storage, using
    /// its current fields as the snapshot.
    ///
    /// # Errors
    ///
    /// [`CoreError::Mapping`] if the class is not a document class or the
    /// document has no identifier, [`CoreError::IdentityConflict`] if
    /// another instance is managed with the same identifier.
    pub fn register_managed(&mut self, document: &DocumentRef) -> CoreResult<()> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.config.metadata);
        let class = document.class();
        let meta = Arc::clone(registry.get(&class)?);
        if !meta.is_document() {
            return Err(CoreError::mapping(class, "only document classes can be managed"));
        }
        let id = meta
            .identifier(document)
            .ok_or_else(|| CoreError::mapping(&class, "a managed document needs an identifier"))?;
        let original = OriginalData::capture(&registry, &meta, document)?;
        self.identity_map.register(meta.root(), &id, document)?;

        let oid = document.oid();
        self.detached.remove(&oid);
        self.schedule.unschedule(oid);
        self.track(
            oid,
            Tracked {
                document: document.clone(),
                meta,
                state: DocumentState::Managed,
                original: Some(original),
                change_set: None,
                parent: None,
            },
        );
        self.sync_embedded(oid)
    }

    /// Turns a stored document into a managed instance.
    ///
    /// If the identity map already holds the document, that instance is
    /// returned unchanged.
    pub fn hydrate(&mut self, class: &str, data: &Value) -> CoreResult<DocumentRef> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.config.metadata);
        let declared = Arc::clone(registry.get(class)?);
        let hydrator = Hydrator::new(&registry);
        let meta = hydrator.resolve_class(&declared, data)?;
        let id = data
            .get(ID_DB_NAME)
            .filter(|id| !id.is_null())
            .cloned()
            .ok_or_else(|| CoreError::mapping(class, "stored document has no _id"))?;
        if let Some(existing) = self.identity_map.get(meta.root(), &id)? {
            return Ok(existing);
        }

        let document = {
            let identity_map = &self.identity_map;
            let lookup = |class: &str, id: &Value| lookup_in(&registry, identity_map, class, id);
            hydrator.hydrate(&meta, data, &lookup)?.1
        };
        self.register_managed(&document)?;
        self.stats.record_load();
        self.config.events.dispatch(LifecycleEvent::PostLoad, &document);
        Ok(document)
    }

    /// Finds a document by identifier, consulting the identity map first.
    ///
    /// Documents scheduled for deletion are not returned.
    pub fn find(&mut self, class: &str, id: &Value) -> CoreResult<Option<DocumentRef>> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.config.metadata);
        let meta = Arc::clone(registry.get(class)?);
        let document = match self.identity_map.get(meta.root(), id)? {
            Some(document) => document,
            None => {
                let persister = self.persister_for(&meta)?;
                match persister.load(id)? {
                    Some(data) => self.hydrate(meta.root(), &data)?,
                    None => return Ok(None),
                }
            }
        };
        Ok(self.visible_as(&registry, &document, class).then_some(document))
    }

    /// Finds every stored document of `class` (and its subclasses) that
    /// matches `filter`.
    pub fn find_by(&mut self, class: &str, filter: &Filter) -> CoreResult<Vec<DocumentRef>> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.config.metadata);
        let meta = Arc::clone(registry.get(class)?);
        let persister = self.persister_for(&meta)?;
        let mut found = Vec::new();
        for data in persister.load_all(filter)? {
            let document = self.hydrate(meta.root(), &data)?;
            if self.visible_as(&registry, &document, class) {
                found.push(document);
            }
        }
        Ok(found)
    }

    fn visible_as(&self, registry: &MetadataRegistry, document: &DocumentRef, class: &str) -> bool {
        registry.is_subclass_of(&document.class(), class)
            && self.state_of(document) != DocumentState::Removed
    }

    // ---- internals ----

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed {
            return Err(CoreError::SessionClosed);
        }
        Ok(())
    }

    fn is_detached(&self, document: &DocumentRef) -> bool {
        self.detached
            .get(&document.oid())
            .is_some_and(|weak| weak.is(document))
    }

    fn persister_for(&mut self, meta: &Arc<ClassMetadata>) -> CoreResult<Arc<dyn DocumentPersister>> {
        if let Some(persister) = self.persisters.get(meta.name()) {
            return Ok(Arc::clone(persister));
        }
        let persister: Arc<dyn DocumentPersister> = Arc::new(StoragePersister::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.config.metadata),
            Arc::clone(meta),
        )?);
        self.persisters.insert(meta.name().to_string(), Arc::clone(&persister));
        Ok(persister)
    }

    fn track(&mut self, oid: Oid, entry: Tracked) {
        if self.tracked.insert(oid, entry).is_none() {
            self.order.push(oid);
        }
    }

    fn untrack(&mut self, oid: Oid) -> Option<Tracked> {
        let entry = self.tracked.remove(&oid)?;
        self.order.retain(|o| *o != oid);
        self.schedule.unschedule(oid);
        Some(entry)
    }

    fn children_of(&self, oid: Oid) -> Vec<Oid> {
        self.order
            .iter()
            .copied()
            .filter(|child| self.tracked.get(child).is_some_and(|e| e.parent == Some(oid)))
            .collect()
    }

    /// Drops a top-level document and its embedded documents from every
    /// structure. Afterwards the document counts as NEW.
    /// Drops detached entries whose document no longer exists.
    fn prune_detached(&mut self) {
        self.detached.retain(|_, weak| weak.upgrade().is_some());
    }

    fn forget(&mut self, oid: Oid) {
        for child in self.children_of(oid) {
            self.untrack(child);
        }
        if let Some(entry) = self.untrack(oid) {
            self.identity_map.remove(&entry.document);
        }
    }

    /// Brings the tracked embedded documents of `oid` in line with its
    /// current fields.
    fn sync_embedded(&mut self, oid: Oid) -> CoreResult<()> {
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(());
        };
        let (document, meta, state) = (entry.document.clone(), Arc::clone(&entry.meta), entry.state);
        let registry = Arc::clone(&self.config.metadata);
        let current = embedded_documents(&registry, &meta, &document)?;

        let keep: HashSet<Oid> = current.iter().map(|(child, _)| child.oid()).collect();
        for child in self.children_of(oid) {
            if !keep.contains(&child) {
                self.untrack(child);
            }
        }
        for (child, child_meta) in current {
            let child_oid = child.oid();
            match self.tracked.get_mut(&child_oid) {
                Some(existing) => {
                    existing.parent = Some(oid);
                    existing.state = state;
                }
                None => self.track(child_oid, Tracked::embedded(child, child_meta, state, oid)),
            }
        }
        Ok(())
    }

    fn cascade(
        &mut self,
        meta: &ClassMetadata,
        document: &DocumentRef,
        select: fn(Cascade) -> bool,
        visited: &mut HashSet<Oid>,
        visit: Visit,
    ) -> CoreResult<()> {
        let registry = Arc::clone(&self.config.metadata);
        for reference in reference_links(&registry, meta, document)? {
            if !select(reference.mapping.kind.cascade()) {
                continue;
            }
            let target = match reference.link {
                Link::Loaded(target) => target,
                Link::Unloaded(proxy) => {
                    match lookup_in(&registry, &self.identity_map, &proxy.class, &proxy.id) {
                        Some(target) => target,
                        None => continue,
                    }
                }
            };
            visit(self, &target, visited)?;
        }
        Ok(())
    }
}

impl Tracked {
    fn embedded(document: DocumentRef, meta: Arc<ClassMetadata>, state: DocumentState, parent: Oid) -> Self {
        Self {
            document,
            meta,
            state,
            original: None,
            change_set: None,
            parent: Some(parent),
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("tracked", &self.tracked.len())
            .field("identity_map", &self.identity_map.len())
            .field("pending", &self.has_pending_writes())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn lookup_in(registry: &MetadataRegistry, identity_map: &IdentityMap, class: &str, id: &Value) -> Option<DocumentRef> {
    let root = registry.try_get(class).map_or(class, |meta| meta.root());
    identity_map.get(root, id).ok().flatten()
}

/// Every embedded document below `document`, depth first.
fn embedded_documents(
    registry: &MetadataRegistry,
    meta: &ClassMetadata,
    document: &DocumentRef,
) -> CoreResult<Vec<(DocumentRef, Arc<ClassMetadata>)>> {
    let values: Vec<(FieldMapping, FieldValue)> = {
        let doc = document.read();
        meta.embedded_fields()
            .map(|m| (m.clone(), doc.get_or_null(&m.name)))
            .collect()
    };

    let mut found = Vec::new();
    for (mapping, value) in values {
        let target = mapping.kind.target().unwrap_or_default();
        let children = match value {
            FieldValue::Scalar(Value::Null) => continue,
            FieldValue::One(Link::Loaded(child)) => vec![child],
            FieldValue::Many(container) => container
                .links()
                .into_iter()
                .map(|link| embedded_element(meta, &mapping, link))
                .collect::<CoreResult<Vec<_>>>()?,
            _ => return Err(mismatch(meta, &mapping)),
        };
        for child in children {
            let child_meta = embedded_meta(registry, target, &child)?;
            let nested = embedded_documents(registry, &child_meta, &child)?;
            found.push((child, child_meta));
            found.extend(nested);
        }
    }
    Ok(found)
}

/// Every reference held by `document` or its embedded documents.
fn reference_links(
    registry: &MetadataRegistry,
    meta: &ClassMetadata,
    document: &DocumentRef,
) -> CoreResult<Vec<ReferenceLink>> {
    let values: Vec<(FieldMapping, FieldValue)> = {
        let doc = document.read();
        meta.fields()
            .iter()
            .filter(|m| m.kind.is_reference() || m.kind.is_embedded())
            .map(|m| (m.clone(), doc.get_or_null(&m.name)))
            .collect()
    };

    let mut found = Vec::new();
    for (mapping, value) in values {
        if mapping.kind.is_reference() {
            let links = match value {
                FieldValue::One(link) => vec![link],
                FieldValue::Many(container) => container.links(),
                _ => continue,
            };
            for link in links {
                found.push(ReferenceLink {
                    owner: meta.name().to_string(),
                    mapping: mapping.clone(),
                    link,
                });
            }
            continue;
        }

        let target = mapping.kind.target().unwrap_or_default();
        let children = match value {
            FieldValue::One(Link::Loaded(child)) => vec![child],
            FieldValue::Many(container) => container.documents(),
            _ => continue,
        };
        for child in children {
            let child_meta = embedded_meta(registry, target, &child)?;
            found.extend(reference_links(registry, &child_meta, &child)?);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Change;
    use crate::document::Collection;
    use docmap_storage::InMemoryBackend;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .class(
                ClassMetadata::document("User")
                    .collection("users")
                    .id("id", IdStrategy::Auto)
                    .field("name")
                    .embed_one("address", "Address")
                    .embed_many("phones", "Phone")
                    .reference_one("group", "Group", Cascade::ALL)
                    .reference_one("friend", "User", Cascade::NONE),
            )
            .class(ClassMetadata::document("Group").collection("groups").id("id", IdStrategy::Uuid).field("name"))
            .class(ClassMetadata::document("Tag").collection("tags").id("name", IdStrategy::None))
            .class(ClassMetadata::embedded("Address").field("city"))
            .class(ClassMetadata::embedded("Phone").field("number"))
            .build()
            .unwrap()
    }

    fn uow() -> UnitOfWork {
        UnitOfWork::new(
            Arc::new(Configuration::new(registry())),
            Arc::new(InMemoryBackend::new()),
        )
    }

    #[test]
    fn persist_schedules_insert_and_tracks_embedded() {
        let mut uow = uow();
        let address = DocumentRef::new("Address").with("city", "Oslo");
        let user = DocumentRef::new("User").with("name", "alice").with("address", address.clone());
        assert_eq!(uow.state_of(&user), DocumentState::New);

        uow.persist(&user).unwrap();
        assert_eq!(uow.state_of(&user), DocumentState::Managed);
        assert_eq!(uow.state_of(&address), DocumentState::Managed);
        assert!(uow.is_scheduled_for_insert(&user));
        assert!(!uow.is_scheduled_for_insert(&address));

        // persisting again is a no-op
        uow.persist(&user).unwrap();
        assert_eq!(uow.managed_documents().len(), 1);
    }

    #[test]
    fn assigned_identifier_means_upsert() {
        let mut uow = uow();
        let user = DocumentRef::new("User").with("id", "u1");
        uow.persist(&user).unwrap();
        assert!(uow.is_scheduled_for_upsert(&user));
        assert!(uow.identity_map().contains(&user));
    }

    #[test]
    fn generated_identifier_is_assigned_at_persist() {
        let mut uow = uow();
        let group = DocumentRef::new("Group").with("name", "admins");
        uow.persist(&group).unwrap();
        assert!(group.scalar("id").unwrap().as_text().is_some());
        assert!(uow.is_scheduled_for_insert(&group));
        assert!(uow.identity_map().contains(&group));
    }

    #[test]
    fn mapping_errors_are_immediate() {
        let mut uow = uow();
        let err = uow.persist(&DocumentRef::new("Tag")).unwrap_err();
        assert!(matches!(err, CoreError::Mapping { .. }));
        let err = uow.persist(&DocumentRef::new("Address")).unwrap_err();
        assert!(matches!(err, CoreError::Mapping { .. }));
        let err = uow.persist(&DocumentRef::new("Nope")).unwrap_err();
        assert!(matches!(err, CoreError::Mapping { .. }));
        assert!(!uow.has_pending_writes());
    }

    #[test]
    fn duplicate_identity_is_rejected() {
        let mut uow = uow();
        uow.persist(&DocumentRef::new("User").with("id", "u1")).unwrap();
        let err = uow.persist(&DocumentRef::new("User").with("id", "u1")).unwrap_err();
        assert!(matches!(err, CoreError::IdentityConflict { .. }));
    }

    #[test]
    fn persist_cascades_to_references() {
        let mut uow = uow();
        let group = DocumentRef::new("Group");
        let friend = DocumentRef::new("User");
        let user = DocumentRef::new("User").with("group", group.clone()).with("friend", friend.clone());
        uow.persist(&user).unwrap();
        assert!(uow.contains(&group));
        assert!(!uow.contains(&friend));

        let err = uow.compute_change_sets().unwrap_err();
        assert!(matches!(err, CoreError::UnpersistedReference { ref field, .. } if field == "friend"));
    }

    #[test]
    fn removing_unwritten_document_forgets_it() {
        let mut uow = uow();
        let user = DocumentRef::new("User");
        uow.persist(&user).unwrap();
        uow.remove(&user).unwrap();
        assert_eq!(uow.state_of(&user), DocumentState::New);
        assert!(!uow.has_pending_writes());
    }

    #[test]
    fn remove_schedules_embedded_documents() {
        let mut uow = uow();
        let phone = DocumentRef::new("Phone").with("number", "555");
        let group = DocumentRef::new("Group");
        let user = DocumentRef::new("User")
            .with("phones", Collection::of([phone.clone()]))
            .with("group", group.clone());
        uow.persist(&user).unwrap();
        uow.commit().unwrap();

        uow.remove(&user).unwrap();
        assert_eq!(uow.state_of(&user), DocumentState::Removed);
        assert!(uow.is_scheduled_for_delete(&user));
        assert!(uow.is_scheduled_for_delete(&phone));
        assert!(uow.is_scheduled_for_delete(&group));

        let err = uow.remove(&phone).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));
        let err = uow.persist(&user).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }));

        let report = uow.commit().unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(uow.state_of(&user), DocumentState::New);
        assert!(!uow.identity_map().contains(&user));
    }

    #[test]
    fn detach_and_clear() {
        let mut uow = uow();
        let group = DocumentRef::new("Group");
        let user = DocumentRef::new("User").with("group", group.clone());
        uow.persist(&user).unwrap();
        uow.detach(&user).unwrap();
        assert_eq!(uow.state_of(&user), DocumentState::Detached);
        assert_eq!(uow.state_of(&group), DocumentState::Detached);
        assert!(!uow.has_pending_writes());
        assert!(matches!(uow.persist(&user), Err(CoreError::InvalidOperation { .. })));

        let other = DocumentRef::new("User").with("id", "u2");
        uow.persist(&other).unwrap();
        uow.clear().unwrap();
        assert_eq!(uow.state_of(&other), DocumentState::Detached);
        assert!(uow.identity_map().is_empty());
    }

    #[test]
    fn detach_forgets_dropped_documents() {
        let mut uow = uow();
        for i in 0..10 {
            let user = DocumentRef::new("User").with("name", format!("u{i}"));
            uow.persist(&user).unwrap();
            uow.detach(&user).unwrap();
        }
        let kept = DocumentRef::new("User").with("name", "kept");
        uow.persist(&kept).unwrap();
        uow.detach(&kept).unwrap();

        assert_eq!(uow.detached.len(), 1);
        assert_eq!(uow.state_of(&kept), DocumentState::Detached);
    }

    #[test]
    fn loaded_document_diffs_against_snapshot() {
        let mut uow = uow();
        let data = Value::map([("_id", Value::from("b")), ("name", Value::from("x"))]);
        let doc = uow.hydrate("User", &data).unwrap();
        assert!(uow.contains(&doc));
        assert!(uow.hydrate("User", &data).unwrap().ptr_eq(&doc));

        doc.set("name", "y");
        uow.compute_change_sets().unwrap();
        let change_set = uow.change_set(&doc).unwrap();
        assert_eq!(change_set.len(), 1);
        match change_set.get("name") {
            Some(Change::Field(change)) => {
                assert_eq!(change.old, Some(FieldValue::from("x")));
                assert_eq!(change.new, FieldValue::from("y"));
            }
            other => panic!("unexpected change {other:?}"),
        }
        assert!(uow.is_scheduled_for_update(&doc));
        assert_eq!(uow.stats().documents_loaded(), 1);
    }

    #[test]
    fn refresh_discards_local_changes() {
        let mut uow = uow();
        let user = DocumentRef::new("User").with("name", "alice");
        uow.persist(&user).unwrap();
        uow.commit().unwrap();

        user.set("name", "mallory");
        uow.refresh(&user).unwrap();
        assert_eq!(user.scalar("name"), Some(Value::from("alice")));
        uow.compute_change_sets().unwrap();
        assert!(!uow.is_scheduled_for_update(&user));
    }

    #[test]
    fn find_consults_identity_map_then_storage() {
        let mut uow = uow();
        let user = DocumentRef::new("User").with("name", "alice");
        uow.persist(&user).unwrap();
        uow.commit().unwrap();
        let id = user.scalar("id").unwrap();

        assert!(uow.find("User", &id).unwrap().unwrap().ptr_eq(&user));
        uow.clear().unwrap();
        let loaded = uow.find("User", &id).unwrap().unwrap();
        assert!(!loaded.ptr_eq(&user));
        assert_eq!(loaded.scalar("name"), Some(Value::from("alice")));
        assert!(uow.find("User", &Value::from("missing")).unwrap().is_none());

        let all = uow.find_by("User", &Filter::all()).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].ptr_eq(&loaded));
    }

    #[test]
    fn closed_unit_of_work_rejects_calls() {
        let mut uow = uow();
        uow.close();
        let user = DocumentRef::new("User");
        assert!(matches!(uow.persist(&user), Err(CoreError::SessionClosed)));
        assert!(matches!(uow.commit(), Err(CoreError::SessionClosed)));
        assert!(matches!(uow.clear(), Err(CoreError::SessionClosed)));
    }
}
