//! Change computation and commit.

use super::queue::Schedule;
use super::{reference_links, Tracked, UnitOfWork};
use crate::changeset::{ChangeSetComputer, OriginalData, OriginalValue};
use crate::commit_order::CommitOrderCalculator;
use crate::config::FailurePolicy;
use crate::document::{DocumentRef, FieldValue, Link};
use crate::error::{CoreError, CoreResult, WriteFailure, WriteOperation};
use crate::event::{FlushEvent, LifecycleEvent};
use crate::metadata::{ClassMetadata, MetadataRegistry};
use crate::persister::{DeferredReference, DocumentPersister, PersistenceBuilder};
use crate::types::{DocumentState, Oid};
use docmap_codec::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info_span, warn};

/// What a successful commit wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Documents upserted.
    pub upserted: usize,
    /// Documents inserted.
    pub inserted: usize,
    /// Documents updated.
    pub updated: usize,
    /// Documents deleted.
    pub deleted: usize,
    /// Execution attempts; more than one after transactional retries, zero
    /// when there was nothing to write.
    pub attempts: u32,
}

impl FlushReport {
    /// Total number of writes.
    #[must_use]
    pub fn total(&self) -> usize {
        self.upserted + self.inserted + self.updated + self.deleted
    }

    fn record(&mut self, operation: WriteOperation) {
        match operation {
            WriteOperation::Upsert => self.upserted += 1,
            WriteOperation::Insert => self.inserted += 1,
            WriteOperation::Update => self.updated += 1,
            WriteOperation::Delete => self.deleted += 1,
        }
    }
}

enum Outcome {
    Written,
    /// Written, but some references still need a follow-up update.
    Deferred,
    Skipped,
}

/// Undo log of one transactional attempt.
#[derive(Default)]
struct Journal {
    enabled: bool,
    entries: Vec<JournalEntry>,
}

struct JournalEntry {
    document: DocumentRef,
    registered: bool,
    tracked: Vec<(Oid, Option<Tracked>, Option<WriteOperation>)>,
    fields: Vec<(String, FieldValue)>,
}

impl Journal {
    fn enabled() -> Self {
        Self {
            enabled: true,
            entries: Vec::new(),
        }
    }

    fn record(&mut self, uow: &UnitOfWork, oid: Oid) {
        if !self.enabled {
            return;
        }
        let Some(entry) = uow.tracked.get(&oid) else {
            return;
        };
        let document = entry.document.clone();
        let mut tracked = vec![(oid, Some(entry.clone()), uow.schedule.scheduled(oid))];
        for child in uow.children_of(oid) {
            tracked.push((child, uow.tracked.get(&child).cloned(), uow.schedule.scheduled(child)));
        }
        let fields = {
            let doc = document.read();
            [entry.meta.id_field(), entry.meta.version_field()]
                .into_iter()
                .flatten()
                .map(|field| (field.to_string(), doc.get_or_null(field)))
                .collect()
        };
        self.entries.push(JournalEntry {
            registered: uow.identity_map.contains(&document),
            document,
            tracked,
            fields,
        });
    }
}

impl UnitOfWork {
    /// Diffs every managed document against its snapshot and schedules
    /// updates for those that changed.
    ///
    /// NEW documents reachable through `persist`-cascading references are
    /// persisted on the way.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnpersistedReference`] if a managed document references
    /// a NEW document without cascading persist to it.
    pub fn compute_change_sets(&mut self) -> CoreResult<()> {
        self.ensure_open()?;
        let registry = Arc::clone(&self.config.metadata);
        let mut done = HashSet::new();
        loop {
            let pending: Vec<Oid> = self
                .order
                .iter()
                .copied()
                .filter(|oid| !done.contains(oid))
                .filter(|oid| {
                    self.tracked
                        .get(oid)
                        .is_some_and(|e| e.parent.is_none() && e.state == DocumentState::Managed)
                })
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for oid in pending {
                done.insert(oid);
                self.persist_reachable(&registry, oid)?;
                self.compute_one(&registry, oid)?;
            }
        }
    }

    fn persist_reachable(&mut self, registry: &MetadataRegistry, oid: Oid) -> CoreResult<()> {
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(());
        };
        let (document, meta) = (entry.document.clone(), Arc::clone(&entry.meta));
        for reference in reference_links(registry, &meta, &document)? {
            let Link::Loaded(target) = &reference.link else {
                continue;
            };
            if self.state_of(target) != DocumentState::New {
                continue;
            }
            if !reference.mapping.kind.cascade().persist {
                return Err(CoreError::UnpersistedReference {
                    class: reference.owner,
                    field: reference.mapping.name,
                    target: target.class(),
                });
            }
            self.do_persist(target, &mut HashSet::new())?;
        }
        Ok(())
    }

    fn compute_one(&mut self, registry: &MetadataRegistry, oid: Oid) -> CoreResult<()> {
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(());
        };
        let change_set = ChangeSetComputer::new(registry).compute(&entry.meta, entry.original.as_ref(), &entry.document)?;
        self.sync_embedded(oid)?;

        let scheduled = self.schedule.scheduled(oid);
        let Some(entry) = self.tracked.get_mut(&oid) else {
            return Ok(());
        };
        match scheduled {
            Some(WriteOperation::Insert | WriteOperation::Upsert) => entry.change_set = Some(change_set),
            _ if change_set.is_empty() => {
                entry.change_set = None;
                self.schedule.remove(oid, WriteOperation::Update);
            }
            _ => {
                entry.change_set = Some(change_set);
                self.schedule.schedule(oid, WriteOperation::Update);
            }
        }
        Ok(())
    }

    /// Writes every pending change.
    ///
    /// Outside a transaction each document is finalized as soon as its own
    /// write succeeds; failed documents keep their schedule and change set
    /// and are reported together in [`CoreError::CommitFailed`] (or alone,
    /// under [`FailurePolicy::StopOnFirstError`]). A transactional commit
    /// stops at the first failure, aborts, restores the session to its
    /// state before the commit, and retries transient failures.
    pub fn commit(&mut self) -> CoreResult<FlushReport> {
        self.ensure_open()?;
        let span = info_span!("commit", tracked = self.tracked.len());
        let _guard = span.enter();

        let events = self.config.events.clone();
        events.dispatch_flush(FlushEvent::PreFlush);
        self.compute_change_sets()?;
        events.dispatch_flush(FlushEvent::OnFlush);

        if self.schedule.is_empty() {
            self.stats.record_flush(true);
            events.dispatch_flush(FlushEvent::PostFlush);
            return Ok(FlushReport::default());
        }

        let result = if self.config.transactional_flush {
            self.commit_transactional()
        } else {
            let stop = self.config.failure_policy == FailurePolicy::StopOnFirstError;
            self.execute(stop, &mut Journal::default()).map(|report| FlushReport {
                attempts: 1,
                ..report
            })
        };

        self.stats.record_flush(result.is_ok());
        match &result {
            Ok(report) => {
                debug!(
                    upserted = report.upserted,
                    inserted = report.inserted,
                    updated = report.updated,
                    deleted = report.deleted,
                    "commit succeeded"
                );
                events.dispatch_flush(FlushEvent::PostFlush);
            }
            Err(error) => warn!(error = %error, "commit failed"),
        }
        result
    }

    fn commit_transactional(&mut self) -> CoreResult<FlushReport> {
        if !self.backend.supports_transactions() {
            return Err(CoreError::invalid_operation(
                "transactional flush requires a backend with transaction support",
            ));
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut journal = Journal::enabled();
            let error = match self.backend.start_transaction() {
                Err(error) => CoreError::from(error),
                Ok(()) => match self.execute(true, &mut journal) {
                    Ok(report) => match self.backend.commit_transaction() {
                        Ok(()) => {
                            return Ok(FlushReport {
                                attempts: attempt,
                                ..report
                            })
                        }
                        Err(error) => {
                            self.abort_transaction();
                            CoreError::from(error)
                        }
                    },
                    Err(error) => {
                        self.abort_transaction();
                        error
                    }
                },
            };

            self.rollback(journal);
            let transient = error.is_transient()
                || error.failures().first().is_some_and(|failure| failure.error.is_transient());
            if transient && attempt <= self.config.max_transaction_retries {
                self.stats.record_transaction_retry();
                warn!(attempt, error = %error, "retrying transactional commit");
                continue;
            }
            return Err(error);
        }
    }

    fn abort_transaction(&self) {
        if let Err(error) = self.backend.abort_transaction() {
            warn!(error = %error, "failed to abort transaction");
        }
    }

    /// Restores the tracking state recorded before each write, newest
    /// first.
    fn rollback(&mut self, journal: Journal) {
        let registry = Arc::clone(&self.config.metadata);
        for entry in journal.entries.into_iter().rev() {
            for (field, value) in entry.fields {
                entry.document.set(field, value);
            }
            self.identity_map.remove(&entry.document);
            for (oid, tracked, scheduled) in entry.tracked {
                self.schedule.unschedule(oid);
                match tracked {
                    Some(tracked) => self.track(oid, tracked),
                    None => {
                        self.untrack(oid);
                    }
                }
                if let Some(operation) = scheduled {
                    self.schedule.schedule(oid, operation);
                }
            }
            if !entry.registered {
                continue;
            }
            let Some(meta) = registry.try_get(&entry.document.class()) else {
                continue;
            };
            if let Some(id) = meta.identifier(&entry.document) {
                if let Err(error) = self.identity_map.register(meta.root(), &id, &entry.document) {
                    warn!(error = %error, "failed to restore identity map entry");
                }
            }
        }
    }

    fn execute(&mut self, stop_on_first: bool, journal: &mut Journal) -> CoreResult<FlushReport> {
        let order = self.commit_order();
        let mut report = FlushReport::default();
        let mut failures = Vec::new();
        let mut deferred = Vec::new();

        for operation in Schedule::PHASES {
            if operation == WriteOperation::Update {
                self.schedule_deferred(&deferred)?;
            }
            let classes: Vec<&String> = if operation == WriteOperation::Delete {
                order.iter().rev().collect()
            } else {
                order.iter().collect()
            };
            for class in classes {
                for oid in self.pending(operation, class) {
                    match self.run(operation, oid, journal) {
                        Ok(Outcome::Skipped) => {}
                        Ok(outcome) => {
                            report.record(operation);
                            if matches!(outcome, Outcome::Deferred) {
                                deferred.push(oid);
                            }
                        }
                        Err(error) => {
                            self.stats.record_failed_write();
                            warn!(operation = %operation, class = %class, document = %oid, error = %error, "write failed");
                            failures.push(WriteFailure {
                                operation,
                                class: class.clone(),
                                document: oid,
                                error: Box::new(error),
                            });
                            if stop_on_first {
                                return Err(CoreError::CommitFailed { failures });
                            }
                        }
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(CoreError::CommitFailed { failures })
        }
    }

    /// Classes with pending work, ordered so that referenced classes come
    /// before the classes referencing them.
    fn commit_order(&self) -> Vec<String> {
        let registry = Arc::clone(&self.config.metadata);
        let mut calculator = CommitOrderCalculator::new();
        let mut classes: Vec<Arc<ClassMetadata>> = Vec::new();
        for operation in Schedule::PHASES {
            for oid in self.schedule.queue(operation).iter() {
                let Some(entry) = self.tracked.get(&oid) else {
                    continue;
                };
                let name = entry.meta.name().to_string();
                if entry.parent.is_none() && !calculator.has_type(&name) {
                    calculator.add_type(name);
                    classes.push(Arc::clone(&entry.meta));
                }
            }
        }

        for meta in &classes {
            let mut targets = Vec::new();
            reference_targets(&registry, meta, &mut HashSet::new(), &mut targets);
            for target in targets {
                for dependency in registry.subclasses_of(&target) {
                    let name = dependency.name().to_string();
                    if name != meta.name() && calculator.has_type(&name) {
                        calculator.add_dependency(name, meta.name().to_string());
                    }
                }
            }
        }
        calculator.commit_order()
    }

    fn pending(&self, operation: WriteOperation, class: &str) -> Vec<Oid> {
        self.schedule
            .queue(operation)
            .iter()
            .filter(|oid| {
                self.tracked
                    .get(oid)
                    .is_some_and(|e| e.parent.is_none() && e.meta.name() == class)
            })
            .collect()
    }

    /// Schedules follow-up updates for documents inserted before the
    /// targets of some of their references had identifiers.
    fn schedule_deferred(&mut self, deferred: &[Oid]) -> CoreResult<()> {
        let registry = Arc::clone(&self.config.metadata);
        for oid in deferred {
            if self.tracked.contains_key(oid) {
                self.compute_one(&registry, *oid)?;
            }
        }
        Ok(())
    }

    fn run(&mut self, operation: WriteOperation, oid: Oid, journal: &mut Journal) -> CoreResult<Outcome> {
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(Outcome::Skipped);
        };
        let (document, meta) = (entry.document.clone(), Arc::clone(&entry.meta));
        let persister = self.persister_for(&meta)?;
        journal.record(self, oid);
        match operation {
            WriteOperation::Insert | WriteOperation::Upsert => {
                self.write_new(operation, persister.as_ref(), &meta, &document)
            }
            WriteOperation::Update => self.write_update(persister.as_ref(), &meta, &document),
            WriteOperation::Delete => self.write_delete(persister.as_ref(), &document),
        }
    }

    fn write_new(
        &mut self,
        operation: WriteOperation,
        persister: &dyn DocumentPersister,
        meta: &ClassMetadata,
        document: &DocumentRef,
    ) -> CoreResult<Outcome> {
        let registry = Arc::clone(&self.config.metadata);
        let deferred = PersistenceBuilder::new(&registry).deferred_references(meta, document);

        let version = meta.version_field().filter(|field| {
            document.read().get_or_null(field).is_null()
        });
        if let Some(field) = version {
            document.set(field, 1);
        }
        let written = match operation {
            WriteOperation::Upsert => persister.upsert(document).map(|()| None),
            _ => persister.insert(document).map(Some),
        };
        let id = match written {
            Ok(id) => id,
            Err(error) => {
                if let Some(field) = version {
                    document.set(field, Value::Null);
                }
                return Err(error);
            }
        };

        if let (None, Some(id)) = (meta.identifier(document), id) {
            meta.set_identifier(document, id);
        }
        if let Some(id) = meta.identifier(document) {
            self.identity_map.register(meta.root(), &id, document)?;
        }
        self.finalize(&registry, document.oid(), &deferred)?;

        if operation == WriteOperation::Upsert {
            self.stats.record_upsert();
        } else {
            self.stats.record_insert();
        }
        self.config.events.dispatch(LifecycleEvent::PostPersist, document);
        Ok(if deferred.is_empty() {
            Outcome::Written
        } else {
            Outcome::Deferred
        })
    }

    fn write_update(
        &mut self,
        persister: &dyn DocumentPersister,
        meta: &ClassMetadata,
        document: &DocumentRef,
    ) -> CoreResult<Outcome> {
        let oid = document.oid();
        let registry = Arc::clone(&self.config.metadata);
        self.config.events.dispatch(LifecycleEvent::PreUpdate, document);

        let change_set = {
            let original = self.tracked.get(&oid).and_then(|e| e.original.as_ref());
            ChangeSetComputer::new(&registry).compute(meta, original, document)?
        };
        if change_set.is_empty() {
            if let Some(entry) = self.tracked.get_mut(&oid) {
                entry.change_set = None;
            }
            self.schedule.remove(oid, WriteOperation::Update);
            return Ok(Outcome::Skipped);
        }
        if let Some(entry) = self.tracked.get_mut(&oid) {
            entry.change_set = Some(change_set.clone());
        }

        persister.update(document, &change_set)?;

        if let Some(field) = meta.version_field() {
            if change_set.fields().any(|changed| changed != field) {
                let next = meta.version_of(&document.read()).unwrap_or(0) + 1;
                document.set(field, next);
            }
        }
        self.finalize(&registry, oid, &[])?;
        self.stats.record_update();
        self.config.events.dispatch(LifecycleEvent::PostUpdate, document);
        Ok(Outcome::Written)
    }

    fn write_delete(&mut self, persister: &dyn DocumentPersister, document: &DocumentRef) -> CoreResult<Outcome> {
        persister.delete(document)?;
        self.forget(document.oid());
        self.stats.record_delete();
        self.config.events.dispatch(LifecycleEvent::PostRemove, document);
        Ok(Outcome::Written)
    }

    /// Marks a written document clean: new snapshot, no schedule, no change
    /// set. Deferred references are left out of the snapshot so that the
    /// next diff writes them.
    fn finalize(&mut self, registry: &MetadataRegistry, oid: Oid, deferred: &[DeferredReference]) -> CoreResult<()> {
        let Some(entry) = self.tracked.get(&oid) else {
            return Ok(());
        };
        let mut original = OriginalData::capture(registry, &entry.meta, &entry.document)?;
        for reference in deferred {
            let value = match (&reference.written, original.get(&reference.field)) {
                (None, _) => OriginalValue::Scalar(Value::Null),
                (Some(written), Some(OriginalValue::References { container, .. })) => OriginalValue::References {
                    container: container.clone(),
                    elements: written.clone(),
                },
                (Some(_), _) => continue,
            };
            original.set(reference.field.clone(), value);
        }

        if let Some(entry) = self.tracked.get_mut(&oid) {
            entry.original = Some(original);
            entry.change_set = None;
        }
        self.schedule.unschedule(oid);
        self.sync_embedded(oid)
    }
}

/// Classes that owning references of `meta` (and of its embedded
/// documents) point at.
fn reference_targets(
    registry: &MetadataRegistry,
    meta: &ClassMetadata,
    seen: &mut HashSet<String>,
    targets: &mut Vec<String>,
) {
    if !seen.insert(meta.name().to_string()) {
        return;
    }
    for mapping in meta.fields() {
        let Some(target) = mapping.kind.target() else {
            continue;
        };
        if mapping.kind.is_reference() && mapping.kind.is_owning() {
            targets.push(target.to_string());
        } else if mapping.kind.is_embedded() {
            for embedded in registry.subclasses_of(target) {
                reference_targets(registry, embedded, seen, targets);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::document::Collection;
    use crate::metadata::{Cascade, IdStrategy};
    use docmap_storage::{DocumentBackend, InMemoryBackend};

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .class(
                ClassMetadata::document("User")
                    .collection("users")
                    .id("id", IdStrategy::Auto)
                    .version("version")
                    .field("name")
                    .embed_many("addresses", "Address")
                    .reference_many("groups", "Group", Cascade::PERSIST)
                    .reference_one("best_friend", "User", Cascade::NONE),
            )
            .class(ClassMetadata::document("Group").collection("groups").id("id", IdStrategy::Auto).field("name"))
            .class(ClassMetadata::embedded("Address").field("city"))
            .build()
            .unwrap()
    }

    fn uow(config: Configuration) -> (Arc<InMemoryBackend>, UnitOfWork) {
        let backend = Arc::new(InMemoryBackend::new());
        let uow = UnitOfWork::new(Arc::new(config), backend.clone());
        (backend, uow)
    }

    #[test]
    fn empty_commit_writes_nothing() {
        let (_, mut uow) = uow(Configuration::new(registry()));
        let report = uow.commit().unwrap();
        assert_eq!(report, FlushReport::default());
        assert_eq!(uow.stats().flushes(), 1);
    }

    #[test]
    fn referenced_classes_are_written_first() {
        let (backend, mut uow) = uow(Configuration::new(registry()));
        let group = DocumentRef::new("Group").with("name", "admins");
        let user = DocumentRef::new("User")
            .with("name", "alice")
            .with("groups", Collection::of([group.clone()]));
        uow.persist(&user).unwrap();
        assert!(uow.is_scheduled_for_insert(&group));
        assert_eq!(uow.commit_order(), vec!["Group".to_string(), "User".to_string()]);

        let report = uow.commit().unwrap();
        assert_eq!(report.inserted, 2);
        let stored = backend
            .find_one("users", &uow.metadata().get("User").unwrap().identifier(&user).unwrap())
            .unwrap()
            .unwrap();
        let group_id = group.scalar("id").unwrap();
        assert_eq!(stored.get("groups"), Some(&Value::Array(vec![group_id])));
        assert_eq!(user.scalar("version"), Some(Value::Integer(1)));
    }

    #[test]
    fn self_references_are_fixed_up_after_insert() {
        let (backend, mut uow) = uow(Configuration::new(registry()));
        let alice = DocumentRef::new("User").with("name", "alice");
        let bob = DocumentRef::new("User").with("name", "bob");
        alice.set("best_friend", bob.clone());
        bob.set("best_friend", alice.clone());
        uow.persist(&alice).unwrap();
        uow.persist(&bob).unwrap();

        let report = uow.commit().unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.updated, 1);
        assert!(!uow.has_pending_writes());

        let alice_id = alice.scalar("id").unwrap();
        let bob_id = bob.scalar("id").unwrap();
        let stored = backend.find_one("users", &alice_id).unwrap().unwrap();
        assert_eq!(stored.get("best_friend"), Some(&bob_id));
        let stored = backend.find_one("users", &bob_id).unwrap().unwrap();
        assert_eq!(stored.get("best_friend"), Some(&alice_id));
    }

    #[test]
    fn unchanged_documents_are_not_updated() {
        let (_, mut uow) = uow(Configuration::new(registry()));
        let user = DocumentRef::new("User").with("name", "alice");
        uow.persist(&user).unwrap();
        uow.commit().unwrap();

        uow.compute_change_sets().unwrap();
        assert!(!uow.is_scheduled_for_update(&user));
        assert!(uow.change_set(&user).is_none());

        user.set("name", "bob");
        uow.compute_change_sets().unwrap();
        assert!(uow.is_scheduled_for_update(&user));
        assert!(uow.change_set(&user).unwrap().contains("name"));

        let report = uow.commit().unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(user.scalar("version"), Some(Value::Integer(2)));
    }

    #[test]
    fn transactional_commit_requires_backend_support() {
        let (_, mut uow) = uow(Configuration::new(registry()).transactional_flush(true));
        let user = DocumentRef::new("User").with("name", "alice");
        uow.persist(&user).unwrap();
        // the in-memory backend supports transactions
        assert_eq!(uow.commit().unwrap().attempts, 1);
        assert!(uow.backend().supports_transactions());
    }
}
