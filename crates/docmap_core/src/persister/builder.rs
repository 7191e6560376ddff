//! Translating documents and change sets into storage commands.

use crate::changeset::{embedded_element, embedded_meta, mismatch, Change, ChangeSet, CollectionChangeSet};
use crate::document::{Collection, DocumentRef, FieldValue, Link};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{ClassMetadata, CollectionStrategy, FieldKind, FieldMapping, MetadataRegistry, ID_DB_NAME};
use docmap_codec::Value;
use docmap_storage::UpdateSpec;

/// What to do with a reference whose target has no identifier yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unresolved {
    Skip,
    Fail,
}

/// A reference field that could not be written on insert because a target
/// had no identifier yet.
#[derive(Debug, Clone)]
pub(crate) struct DeferredReference {
    pub(crate) field: String,
    /// For collections, the links that were written.
    pub(crate) written: Option<Vec<Link>>,
}

/// Builds the stored form of documents and updates.
///
/// Stored documents are maps keyed by each field's `db_name`:
/// - the identifier is stored as `_id`
/// - the discriminator value, if the class has one, is written on insert
/// - embedded documents are nested maps, references are target ids
/// - null fields are omitted unless mapped as nullable
///
/// Updates follow the collection strategy of each field. `PushAll` and
/// `AddToSet` collections mutated in place are written incrementally
/// (`pull` then `push`/`add_to_set`); replaced or reordered collections,
/// removals from embedded collections and the atomic strategies rewrite
/// the whole array.
#[derive(Debug, Clone, Copy)]
pub struct PersistenceBuilder<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> PersistenceBuilder<'a> {
    /// Creates a builder over a registry.
    #[must_use]
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Returns the stored form of a document for insertion.
    ///
    /// References to documents without an identifier are left out.
    pub fn insert_data(&self, meta: &ClassMetadata, document: &DocumentRef) -> CoreResult<Value> {
        let mut pairs = Vec::new();
        if let Some(id) = meta.identifier(document) {
            pairs.push((ID_DB_NAME.to_string(), id));
        }
        push_discriminator(meta, &mut pairs);
        self.push_fields(meta, document, Unresolved::Skip, &mut pairs)?;
        Ok(Value::Map(pairs))
    }

    /// Returns an update that writes every field of a document whose
    /// identifier was assigned by the caller.
    pub fn upsert_data(&self, meta: &ClassMetadata, document: &DocumentRef) -> CoreResult<UpdateSpec> {
        let mut spec = UpdateSpec::new();
        if let Value::Map(pairs) = self.insert_data(meta, document)? {
            for (key, value) in pairs {
                if key != ID_DB_NAME {
                    spec = spec.set(key, value);
                }
            }
        }
        Ok(spec)
    }

    /// Returns the update writing `change_set`.
    ///
    /// Versioned classes get a precondition on the current version and an
    /// increment, unless the update is otherwise empty.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnpersistedReference`] if a changed reference
    /// points at a document without an identifier.
    pub fn update_data(
        &self,
        meta: &ClassMetadata,
        document: &DocumentRef,
        change_set: &ChangeSet,
    ) -> CoreResult<UpdateSpec> {
        let mut spec = self.push_changes(meta, document, change_set, "", UpdateSpec::new())?;
        if spec.is_empty() {
            return Ok(spec);
        }
        if let Some(field) = meta.version_field() {
            let path = meta.field(field).map_or(field, |m| m.db_name.as_str());
            let current = meta.version_of(&document.read());
            if let Some(version) = current {
                spec = spec.expect(path, Value::Integer(version));
            }
            spec = spec.inc(path, 1);
        }
        Ok(spec)
    }

    /// Returns the stored identifier a link points at, if known.
    #[must_use]
    pub fn reference_value(&self, link: &Link) -> Option<Value> {
        match link {
            Link::Loaded(target) => {
                let class = target.class();
                self.registry.try_get(&class)?.identifier(target)
            }
            Link::Unloaded(proxy) => Some(proxy.id.clone()),
        }
    }

    /// Lists the reference fields of `document` that an insert would leave
    /// out because a target has no identifier yet.
    pub(crate) fn deferred_references(
        &self,
        meta: &ClassMetadata,
        document: &DocumentRef,
    ) -> Vec<DeferredReference> {
        let values: Vec<(String, FieldValue)> = {
            let doc = document.read();
            meta.reference_fields()
                .filter(|m| m.is_persisted())
                .map(|m| (m.name.clone(), doc.get_or_null(&m.name)))
                .collect()
        };

        let mut deferred = Vec::new();
        for (field, value) in values {
            match value {
                FieldValue::One(link) if self.reference_value(&link).is_none() => {
                    deferred.push(DeferredReference {
                        field,
                        written: None,
                    });
                }
                FieldValue::Many(container) => {
                    let links = container.links();
                    let written: Vec<Link> = links
                        .iter()
                        .filter(|link| self.reference_value(link).is_some())
                        .cloned()
                        .collect();
                    if written.len() != links.len() {
                        deferred.push(DeferredReference {
                            field,
                            written: Some(written),
                        });
                    }
                }
                _ => {}
            }
        }
        deferred
    }

    fn push_fields(
        &self,
        meta: &ClassMetadata,
        document: &DocumentRef,
        mode: Unresolved,
        pairs: &mut Vec<(String, Value)>,
    ) -> CoreResult<()> {
        let values: Vec<(FieldMapping, FieldValue)> = {
            let doc = document.read();
            meta.fields()
                .iter()
                .filter(|m| m.is_persisted())
                .map(|m| (m.clone(), doc.get_or_null(&m.name)))
                .collect()
        };
        for (mapping, value) in values {
            let Some(stored) = self.stored_value(meta, &mapping, &value, mode)? else {
                continue;
            };
            if stored.is_null() && !mapping.nullable {
                continue;
            }
            pairs.push((mapping.db_name, stored));
        }
        Ok(())
    }

    fn push_changes(
        &self,
        meta: &ClassMetadata,
        document: &DocumentRef,
        change_set: &ChangeSet,
        prefix: &str,
        mut spec: UpdateSpec,
    ) -> CoreResult<UpdateSpec> {
        for (name, change) in change_set.iter() {
            let Some(mapping) = meta.field(name) else {
                continue;
            };
            if prefix.is_empty() && meta.version_field() == Some(name) {
                continue;
            }
            let path = format!("{prefix}{}", mapping.db_name);
            spec = match change {
                Change::Field(field) => {
                    let value = self
                        .stored_value(meta, mapping, &field.new, Unresolved::Fail)?
                        .unwrap_or(Value::Null);
                    if value.is_null() && !mapping.nullable {
                        spec.unset(path)
                    } else {
                        spec.set(path, value)
                    }
                }
                Change::Embedded(nested) => {
                    let current = document.read().get_or_null(name);
                    let (FieldKind::EmbedOne { target }, FieldValue::One(Link::Loaded(child))) =
                        (&mapping.kind, &current)
                    else {
                        return Err(mismatch(meta, mapping));
                    };
                    let child_meta = embedded_meta(self.registry, target, child)?;
                    self.push_changes(&child_meta, child, nested, &format!("{path}."), spec)?
                }
                Change::Collection(diff) => {
                    let current = document.read().get_or_null(name);
                    self.push_collection(meta, mapping, &current, diff, &path, spec)?
                }
            };
        }
        Ok(spec)
    }

    fn push_collection(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        current: &FieldValue,
        diff: &CollectionChangeSet,
        path: &str,
        mut spec: UpdateSpec,
    ) -> CoreResult<UpdateSpec> {
        let FieldValue::Many(container) = current else {
            return Err(mismatch(meta, mapping));
        };
        let strategy = mapping.kind.strategy().unwrap_or_default();
        let embedded = mapping.kind.is_embedded();
        let pulled = if strategy.is_atomic() || embedded || diff.deleted.is_empty() {
            Vec::new()
        } else {
            self.element_values(meta, mapping, &diff.deleted)?
        };
        let rewrite = strategy.is_atomic()
            || diff.reordered
            || (embedded && !diff.deleted.is_empty())
            || (!diff.updated.is_empty() && !diff.is_update_only())
            || (!diff.deleted.is_empty() && !diff.inserted.is_empty())
            || !appended_at_tail(container, &diff.inserted)
            || self.still_referenced(meta, mapping, container, &pulled)?;
        if rewrite {
            let value = self
                .stored_value(meta, mapping, current, Unresolved::Fail)?
                .unwrap_or(Value::Null);
            return Ok(spec.set(path, value));
        }

        if let FieldKind::EmbedMany { target, .. } = &mapping.kind {
            for (index, nested) in &diff.updated {
                let link = container.get(*index).ok_or_else(|| mismatch(meta, mapping))?;
                let child = embedded_element(meta, mapping, link)?;
                let child_meta = embedded_meta(self.registry, target, &child)?;
                spec = self.push_changes(&child_meta, &child, nested, &format!("{path}.{index}."), spec)?;
            }
        }
        if !pulled.is_empty() {
            spec = spec.pull(path, pulled);
        }
        if !diff.inserted.is_empty() {
            let values = self.element_values(meta, mapping, &diff.inserted)?;
            spec = match strategy {
                CollectionStrategy::AddToSet => spec.add_to_set(path, values),
                _ => spec.push(path, values),
            };
        }
        Ok(spec)
    }

    /// `$pull` removes every equal element, so a value that survives in
    /// the collection cannot be pulled.
    fn still_referenced(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        container: &Collection,
        pulled: &[Value],
    ) -> CoreResult<bool> {
        if pulled.is_empty() {
            return Ok(false);
        }
        for link in container.links() {
            if let Some(value) = self.element_value(meta, mapping, &link, Unresolved::Skip)? {
                if pulled.contains(&value) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn element_values(&self, meta: &ClassMetadata, mapping: &FieldMapping, links: &[Link]) -> CoreResult<Vec<Value>> {
        let mut values = Vec::with_capacity(links.len());
        for link in links {
            if let Some(value) = self.element_value(meta, mapping, link, Unresolved::Fail)? {
                values.push(value);
            }
        }
        Ok(values)
    }

    fn stored_value(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        value: &FieldValue,
        mode: Unresolved,
    ) -> CoreResult<Option<Value>> {
        if value.is_null() {
            return Ok(Some(Value::Null));
        }
        match (&mapping.kind, value) {
            (FieldKind::Scalar, FieldValue::Scalar(v)) => Ok(Some(v.clone())),
            (FieldKind::EmbedOne { target }, FieldValue::One(Link::Loaded(child))) => {
                self.embedded_value(target, child, mode).map(Some)
            }
            (FieldKind::ReferenceOne { .. }, FieldValue::One(link)) => self.reference(meta, mapping, link, mode),
            (FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. }, FieldValue::Many(container)) => {
                let mut items = Vec::with_capacity(container.len());
                for link in container.links() {
                    if let Some(item) = self.element_value(meta, mapping, &link, mode)? {
                        items.push(item);
                    }
                }
                Ok(Some(Value::Array(items)))
            }
            _ => Err(mismatch(meta, mapping)),
        }
    }

    fn element_value(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        link: &Link,
        mode: Unresolved,
    ) -> CoreResult<Option<Value>> {
        match &mapping.kind {
            FieldKind::EmbedMany { target, .. } => {
                let child = embedded_element(meta, mapping, link.clone())?;
                self.embedded_value(target, &child, mode).map(Some)
            }
            FieldKind::ReferenceMany { .. } => self.reference(meta, mapping, link, mode),
            _ => Err(mismatch(meta, mapping)),
        }
    }

    fn embedded_value(&self, declared: &str, child: &DocumentRef, mode: Unresolved) -> CoreResult<Value> {
        let child_meta = embedded_meta(self.registry, declared, child)?;
        let mut pairs = Vec::new();
        push_discriminator(&child_meta, &mut pairs);
        self.push_fields(&child_meta, child, mode, &mut pairs)?;
        Ok(Value::Map(pairs))
    }

    fn reference(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        link: &Link,
        mode: Unresolved,
    ) -> CoreResult<Option<Value>> {
        match (self.reference_value(link), mode) {
            (Some(id), _) => Ok(Some(id)),
            (None, Unresolved::Skip) => Ok(None),
            (None, Unresolved::Fail) => Err(CoreError::UnpersistedReference {
                class: meta.name().to_string(),
                field: mapping.name.clone(),
                target: link.document().map_or_else(String::new, DocumentRef::class),
            }),
        }
    }
}

/// `push` appends, so an incremental write keeps the stored order only
/// when every inserted element sits at the end of the collection.
fn appended_at_tail(container: &Collection, inserted: &[Link]) -> bool {
    let links = container.links();
    let Some(start) = links.len().checked_sub(inserted.len()) else {
        return false;
    };
    links[start..].iter().zip(inserted).all(|pair| match pair {
        (Link::Loaded(a), Link::Loaded(b)) => a.ptr_eq(b),
        (Link::Unloaded(a), Link::Unloaded(b)) => a == b,
        _ => false,
    })
}

fn push_discriminator(meta: &ClassMetadata, pairs: &mut Vec<(String, Value)>) {
    if let (Some(field), Some(value)) = (meta.discriminator_field(), meta.discriminator_value()) {
        pairs.push((field.to_string(), Value::from(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::{ChangeSetComputer, OriginalData};
    use crate::document::{Collection, Proxy};
    use crate::metadata::{Cascade, FieldMapping, IdStrategy};
    use docmap_storage::UpdateOp;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .class(
                ClassMetadata::document("User")
                    .collection("users")
                    .id("id", IdStrategy::Auto)
                    .version("version")
                    .mapping(FieldMapping::scalar("name").db_name("n"))
                    .mapping(FieldMapping::scalar("nickname").nullable())
                    .field("email")
                    .embed_one("address", "Address")
                    .embed_many("phones", "Phone")
                    .reference_one("manager", "User", Cascade::NONE)
                    .reference_many("groups", "Group", Cascade::NONE)
                    .mapping(
                        FieldMapping::reference_many("roles", "Group", Cascade::NONE)
                            .strategy(CollectionStrategy::SetArray),
                    ),
            )
            .class(
                ClassMetadata::document("Group")
                    .id("id", IdStrategy::None)
                    .field("name"),
            )
            .class(ClassMetadata::embedded("Address").field("city"))
            .class(ClassMetadata::embedded("Phone").field("number"))
            .build()
            .unwrap()
    }

    fn group(id: &str) -> DocumentRef {
        DocumentRef::new("Group").with("id", id).with("name", id)
    }

    fn phone(number: &str) -> DocumentRef {
        DocumentRef::new("Phone").with("number", number)
    }

    fn managed_user() -> DocumentRef {
        DocumentRef::new("User")
            .with("id", 7)
            .with("version", 3)
            .with("name", "alice")
            .with("address", DocumentRef::new("Address").with("city", "Oslo"))
            .with("phones", Collection::of([phone("1"), phone("2")]))
            .with("groups", Collection::of([group("a"), group("b")]))
            .with("roles", Collection::of([group("a")]))
    }

    fn update_for(registry: &MetadataRegistry, doc: &DocumentRef, mutate: impl FnOnce(&DocumentRef)) -> UpdateSpec {
        let meta = registry.get("User").unwrap();
        let original = OriginalData::capture(registry, meta, doc).unwrap();
        mutate(doc);
        let cs = ChangeSetComputer::new(registry)
            .compute(meta, Some(&original), doc)
            .unwrap();
        PersistenceBuilder::new(registry).update_data(meta, doc, &cs).unwrap()
    }

    #[test]
    fn insert_data_uses_stored_names() {
        let registry = registry();
        let meta = registry.get("User").unwrap();
        let doc = managed_user().with("manager", Link::Unloaded(Proxy::new("User", Value::Integer(1))));

        let data = PersistenceBuilder::new(&registry).insert_data(meta, &doc).unwrap();
        assert_eq!(data.get("_id"), Some(&Value::Integer(7)));
        assert_eq!(data.get("n"), Some(&Value::from("alice")));
        assert_eq!(data.get_path("address.city"), Some(&Value::from("Oslo")));
        assert_eq!(data.get_path("phones.1.number"), Some(&Value::from("2")));
        assert_eq!(
            data.get("groups"),
            Some(&Value::Array(vec![Value::from("a"), Value::from("b")]))
        );
        assert_eq!(data.get("manager"), Some(&Value::Integer(1)));
        // nullable nulls are written, the rest are omitted
        assert_eq!(data.get("nickname"), Some(&Value::Null));
        assert_eq!(data.get("email"), None);
        assert_eq!(data.get("id"), None);
    }

    #[test]
    fn unresolved_references_are_deferred_on_insert() {
        let registry = registry();
        let meta = registry.get("User").unwrap();
        let pending = DocumentRef::new("Group");
        let doc = DocumentRef::new("User")
            .with("manager", DocumentRef::new("User"))
            .with("groups", Collection::of([group("a"), pending.clone()]));

        let builder = PersistenceBuilder::new(&registry);
        let data = builder.insert_data(meta, &doc).unwrap();
        assert_eq!(data.get("manager"), None);
        assert_eq!(data.get("groups"), Some(&Value::Array(vec![Value::from("a")])));

        let deferred = builder.deferred_references(meta, &doc);
        assert_eq!(deferred.len(), 2);
        assert_eq!(deferred[0].field, "manager");
        assert!(deferred[0].written.is_none());
        assert_eq!(deferred[1].field, "groups");
        assert_eq!(deferred[1].written.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn scalar_changes_set_and_unset() {
        let registry = registry();
        let doc = managed_user().with("email", "a@example.com");
        let spec = update_for(&registry, &doc, |d| {
            d.set("name", "bob");
            d.set("email", Value::Null);
        });
        assert_eq!(
            spec.ops(),
            &[
                UpdateOp::Set {
                    path: "n".into(),
                    value: Value::from("bob")
                },
                UpdateOp::Unset {
                    path: "email".into()
                },
                UpdateOp::Inc {
                    path: "version".into(),
                    by: 1
                },
            ]
        );
        assert_eq!(spec.preconditions(), &[("version".to_string(), Value::Integer(3))]);
    }

    #[test]
    fn embedded_changes_use_dotted_paths() {
        let registry = registry();
        let doc = managed_user();
        let spec = update_for(&registry, &doc, |d| {
            let address = d.get("address").unwrap();
            address.as_document().unwrap().set("city", "Bergen");
            let phones = d.get("phones").unwrap();
            phones.as_collection().unwrap().documents()[1].set("number", "22");
        });
        assert_eq!(
            &spec.ops()[..2],
            &[
                UpdateOp::Set {
                    path: "address.city".into(),
                    value: Value::from("Bergen")
                },
                UpdateOp::Set {
                    path: "phones.1.number".into(),
                    value: Value::from("22")
                },
            ]
        );
    }

    #[test]
    fn push_all_collections_are_incremental() {
        let registry = registry();
        let doc = managed_user();
        let spec = update_for(&registry, &doc, |d| {
            d.get("groups").unwrap().as_collection().unwrap().remove(0);
        });
        assert_eq!(
            spec.ops(),
            &[UpdateOp::Pull {
                path: "groups".into(),
                values: vec![Value::from("a")]
            }]
        );

        let doc = managed_user();
        let spec = update_for(&registry, &doc, |d| {
            d.get("groups").unwrap().as_collection().unwrap().push(group("c"));
        });
        assert_eq!(
            spec.ops(),
            &[UpdateOp::Push {
                path: "groups".into(),
                values: vec![Value::from("c")]
            }]
        );
    }

    #[test]
    fn pull_and_push_on_one_path_rewrite_the_array() {
        let registry = registry();
        let doc = managed_user();
        let spec = update_for(&registry, &doc, |d| {
            let groups = d.get("groups").unwrap();
            let groups = groups.as_collection().unwrap();
            groups.remove(0);
            groups.push(group("c"));
        });
        assert_eq!(
            spec.ops(),
            &[UpdateOp::Set {
                path: "groups".into(),
                value: Value::Array(vec![Value::from("b"), Value::from("c")])
            }]
        );
    }

    #[test]
    fn removing_one_of_two_equal_references_rewrites_the_array() {
        let registry = registry();
        let a = group("a");
        let doc = managed_user().with("groups", Collection::of([a.clone(), group("b"), a]));
        let spec = update_for(&registry, &doc, |d| {
            d.get("groups").unwrap().as_collection().unwrap().remove(2);
        });
        assert_eq!(
            spec.ops(),
            &[UpdateOp::Set {
                path: "groups".into(),
                value: Value::Array(vec![Value::from("a"), Value::from("b")])
            }]
        );
    }

    #[test]
    fn atomic_and_embedded_removals_rewrite_the_array() {
        let registry = registry();
        let doc = managed_user();
        let spec = update_for(&registry, &doc, |d| {
            d.get("roles").unwrap().as_collection().unwrap().push(group("b"));
            d.get("phones").unwrap().as_collection().unwrap().remove(0);
        });
        assert_eq!(
            &spec.ops()[..2],
            &[
                UpdateOp::Set {
                    path: "phones".into(),
                    value: Value::Array(vec![Value::map([("number", Value::from("2"))])])
                },
                UpdateOp::Set {
                    path: "roles".into(),
                    value: Value::Array(vec![Value::from("a"), Value::from("b")])
                },
            ]
        );
    }

    #[test]
    fn empty_change_set_builds_no_update() {
        let registry = registry();
        let doc = managed_user();
        let spec = update_for(&registry, &doc, |_| {});
        assert!(spec.is_empty());
        assert!(spec.preconditions().is_empty());
    }

    #[test]
    fn unresolved_reference_fails_update() {
        let registry = registry();
        let doc = managed_user();
        let meta = registry.get("User").unwrap();
        let original = OriginalData::capture(&registry, meta, &doc).unwrap();
        doc.set("manager", DocumentRef::new("User"));
        let cs = ChangeSetComputer::new(&registry)
            .compute(meta, Some(&original), &doc)
            .unwrap();

        let err = PersistenceBuilder::new(&registry)
            .update_data(meta, &doc, &cs)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::UnpersistedReference { ref field, ref target, .. } if field == "manager" && target == "User"
        ));
    }
}
