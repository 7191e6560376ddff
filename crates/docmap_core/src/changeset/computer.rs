//! Diffing live documents against their snapshots.

use super::original::{embedded_element, embedded_meta, mismatch, OriginalData, OriginalValue};
use super::{Change, ChangeSet, CollectionChangeSet, FieldChange};
use crate::document::{DocumentRef, FieldValue, Link};
use crate::error::CoreResult;
use crate::metadata::{ClassMetadata, FieldKind, FieldMapping, MetadataRegistry};
use docmap_codec::Value;
use tracing::trace;

/// Computes [`ChangeSet`]s.
///
/// Equality rules:
/// - scalars compare strictly by type and value (`true` differs from `1`,
///   dates compare by value, floats bitwise)
/// - references compare by target identity: the same instance, or the
///   same root class and id when one side is an unloaded proxy
/// - embedded documents that are the same instance are diffed field by
///   field; a different instance replaces the field
/// - a collection container that was swapped replaces the field; a
///   container mutated in place yields a [`CollectionChangeSet`]
#[derive(Debug, Clone, Copy)]
pub struct ChangeSetComputer<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> ChangeSetComputer<'a> {
    /// Creates a computer over a registry.
    #[must_use]
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Diffs `document` against `original`.
    ///
    /// With no snapshot (a document never written) every persisted field is
    /// reported as a [`FieldChange`] with no old value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`](crate::CoreError::Mapping) if a field
    /// holds a value that does not fit its mapping.
    pub fn compute(
        &self,
        meta: &ClassMetadata,
        original: Option<&OriginalData>,
        document: &DocumentRef,
    ) -> CoreResult<ChangeSet> {
        let current: Vec<(FieldMapping, FieldValue)> = {
            let doc = document.read();
            meta.fields()
                .iter()
                .filter(|m| m.is_persisted())
                .map(|m| (m.clone(), doc.get_or_null(&m.name)))
                .collect()
        };

        let mut changes = ChangeSet::new();
        let Some(original) = original else {
            for (mapping, value) in current {
                changes.insert(mapping.name, Change::Field(FieldChange::new(None, value)));
            }
            return Ok(changes);
        };

        let null = OriginalValue::Scalar(Value::Null);
        for (mapping, value) in current {
            let before = original.get(&mapping.name).unwrap_or(&null);
            if let Some(change) = self.compare(meta, &mapping, before, value)? {
                changes.insert(mapping.name, change);
            }
        }

        if !changes.is_empty() {
            trace!(
                class = meta.name(),
                fields = ?changes.fields().collect::<Vec<_>>(),
                "computed change set"
            );
        }
        Ok(changes)
    }

    /// Returns `true` if two links point at the same document.
    #[must_use]
    pub fn same_link(&self, a: &Link, b: &Link) -> bool {
        match (a, b) {
            (Link::Loaded(x), Link::Loaded(y)) => x.ptr_eq(y),
            (Link::Unloaded(p), Link::Unloaded(q)) => {
                p.id == q.id && self.root_of(&p.class) == self.root_of(&q.class)
            }
            (Link::Loaded(doc), Link::Unloaded(proxy)) | (Link::Unloaded(proxy), Link::Loaded(doc)) => {
                let class = doc.class();
                self.root_of(&class) == self.root_of(&proxy.class)
                    && self
                        .registry
                        .try_get(&class)
                        .and_then(|meta| meta.identifier(doc))
                        .is_some_and(|id| id == proxy.id)
            }
        }
    }

    fn root_of<'c>(&'c self, class: &'c str) -> &'c str {
        self.registry.try_get(class).map_or(class, |meta| meta.root())
    }

    fn compare(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        before: &OriginalValue,
        value: FieldValue,
    ) -> CoreResult<Option<Change>> {
        if before.is_null() && value.is_null() {
            return Ok(None);
        }
        let replaced = |value: FieldValue| {
            Some(Change::Field(FieldChange::new(
                Some(before.to_field_value()),
                value,
            )))
        };

        match (&mapping.kind, before, &value) {
            (FieldKind::Scalar, OriginalValue::Scalar(old), FieldValue::Scalar(new)) => {
                Ok((old != new).then(|| replaced(value.clone())).flatten())
            }
            (FieldKind::Scalar, _, _) => Err(mismatch(meta, mapping)),

            (
                FieldKind::EmbedOne { target },
                OriginalValue::Embedded { document, data },
                FieldValue::One(Link::Loaded(current)),
            ) if document.ptr_eq(current) => {
                let embedded = embedded_meta(self.registry, target, current)?;
                let nested = self.compute(&embedded, Some(data), current)?;
                Ok((!nested.is_empty()).then_some(Change::Embedded(nested)))
            }
            (FieldKind::EmbedOne { .. }, _, FieldValue::One(Link::Loaded(_)) | FieldValue::Scalar(Value::Null)) => {
                Ok(replaced(value.clone()))
            }
            (FieldKind::EmbedOne { .. }, _, _) => Err(mismatch(meta, mapping)),

            (FieldKind::ReferenceOne { .. }, OriginalValue::Reference(old), FieldValue::One(new)) => {
                Ok((!self.same_link(old, new)).then(|| replaced(value.clone())).flatten())
            }
            (FieldKind::ReferenceOne { .. }, _, FieldValue::One(_) | FieldValue::Scalar(Value::Null)) => {
                Ok(replaced(value.clone()))
            }
            (FieldKind::ReferenceOne { .. }, _, _) => Err(mismatch(meta, mapping)),

            (
                FieldKind::EmbedMany { target, .. },
                OriginalValue::EmbeddedMany { container, elements },
                FieldValue::Many(current),
            ) if container.ptr_eq(current) => {
                let originals: Vec<Link> =
                    elements.iter().map(|(doc, _)| Link::Loaded(doc.clone())).collect();
                let links = current.links();
                let (mut change, survivors) = self.diff_links(&originals, &links);
                for (ci, oi) in survivors {
                    let doc = embedded_element(meta, mapping, links[ci].clone())?;
                    let embedded = embedded_meta(self.registry, target, &doc)?;
                    let nested = self.compute(&embedded, Some(&elements[oi].1), &doc)?;
                    if !nested.is_empty() {
                        change.updated.push((ci, nested));
                    }
                }
                Ok((!change.is_empty()).then_some(Change::Collection(change)))
            }
            (
                FieldKind::ReferenceMany { .. },
                OriginalValue::References { container, elements },
                FieldValue::Many(current),
            ) if container.ptr_eq(current) => {
                let (change, _) = self.diff_links(elements, &current.links());
                Ok((!change.is_empty()).then_some(Change::Collection(change)))
            }
            (
                FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. },
                _,
                FieldValue::Many(_) | FieldValue::Scalar(Value::Null),
            ) => Ok(replaced(value.clone())),
            (FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. }, _, _) => {
                Err(mismatch(meta, mapping))
            }
        }
    }

    /// Matches current elements to snapshot elements by identity.
    ///
    /// Returns the structural change and the `(current, original)` index
    /// pairs of surviving elements.
    fn diff_links(
        &self,
        original: &[Link],
        current: &[Link],
    ) -> (CollectionChangeSet, Vec<(usize, usize)>) {
        let mut used = vec![false; original.len()];
        let mut survivors = Vec::new();
        let mut change = CollectionChangeSet::default();

        for (ci, link) in current.iter().enumerate() {
            let found = (0..original.len()).find(|&oi| !used[oi] && self.same_link(&original[oi], link));
            match found {
                Some(oi) => {
                    used[oi] = true;
                    survivors.push((ci, oi));
                }
                None => change.inserted.push(link.clone()),
            }
        }
        change.deleted = original
            .iter()
            .zip(&used)
            .filter_map(|(link, &kept)| (!kept).then(|| link.clone()))
            .collect();
        change.reordered = survivors.windows(2).any(|w| w[0].1 > w[1].1);
        (change, survivors)
    }
}
