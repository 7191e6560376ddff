//! Turning stored documents back into document instances.

use crate::document::{Collection, DocumentRef, FieldValue, Link, Proxy};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{ClassMetadata, FieldKind, FieldMapping, MetadataRegistry, ID_DB_NAME};
use docmap_codec::Value;
use std::sync::Arc;

/// Builds [`DocumentRef`]s from stored maps.
///
/// References are resolved through a lookup (normally the identity map);
/// targets not found there become [`Link::Unloaded`] proxies.
#[derive(Debug, Clone, Copy)]
pub struct Hydrator<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> Hydrator<'a> {
    /// Creates a hydrator over a registry.
    #[must_use]
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Picks the concrete class of a stored document from its
    /// discriminator value.
    pub fn resolve_class(&self, declared: &ClassMetadata, data: &Value) -> CoreResult<Arc<ClassMetadata>> {
        let stored = declared
            .discriminator_field()
            .and_then(|field| data.get(field))
            .and_then(Value::as_text);
        let Some(value) = stored else {
            return Ok(Arc::clone(self.registry.get(declared.name())?));
        };
        match self.registry.class_for_discriminator(declared.root(), value) {
            Some(meta) if self.registry.is_subclass_of(meta.name(), declared.name()) => Ok(Arc::clone(meta)),
            Some(meta) => Err(CoreError::mapping(
                declared.name(),
                format!("stored document is a '{}'", meta.name()),
            )),
            None => Err(CoreError::mapping(
                declared.name(),
                format!("unknown discriminator value '{value}'"),
            )),
        }
    }

    /// Creates a document from its stored form.
    pub fn hydrate(
        &self,
        declared: &ClassMetadata,
        data: &Value,
        lookup: &dyn Fn(&str, &Value) -> Option<DocumentRef>,
    ) -> CoreResult<(Arc<ClassMetadata>, DocumentRef)> {
        let meta = self.resolve_class(declared, data)?;
        let document = DocumentRef::new(meta.name());
        self.fill(&meta, &document, data, lookup)?;
        Ok((meta, document))
    }

    /// Overwrites every persisted field of `document` from its stored form.
    pub fn fill(
        &self,
        meta: &ClassMetadata,
        document: &DocumentRef,
        data: &Value,
        lookup: &dyn Fn(&str, &Value) -> Option<DocumentRef>,
    ) -> CoreResult<()> {
        if data.as_map().is_none() {
            return Err(CoreError::mapping(
                meta.name(),
                format!("stored document is {}, not a map", data.type_name()),
            ));
        }

        let mut values = Vec::with_capacity(meta.fields().len() + 1);
        if let Some(field) = meta.id_field() {
            let id = data.get(ID_DB_NAME).cloned().unwrap_or(Value::Null);
            values.push((field.to_string(), FieldValue::Scalar(id)));
        }
        for mapping in meta.fields().iter().filter(|m| m.is_persisted()) {
            let stored = data.get(&mapping.db_name).cloned().unwrap_or(Value::Null);
            values.push((mapping.name.clone(), self.field(meta, mapping, stored, lookup)?));
        }

        let mut doc = document.write();
        for (field, value) in values {
            doc.set(field, value);
        }
        Ok(())
    }

    fn field(
        &self,
        meta: &ClassMetadata,
        mapping: &FieldMapping,
        stored: Value,
        lookup: &dyn Fn(&str, &Value) -> Option<DocumentRef>,
    ) -> CoreResult<FieldValue> {
        match (&mapping.kind, stored) {
            (FieldKind::Scalar, value) => Ok(FieldValue::Scalar(value)),
            (FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. }, Value::Null) => {
                Ok(FieldValue::Many(Collection::new()))
            }
            (_, Value::Null) => Ok(FieldValue::Scalar(Value::Null)),
            (FieldKind::EmbedOne { target }, value) => {
                Ok(FieldValue::One(Link::Loaded(self.embedded(target, &value, lookup)?)))
            }
            (FieldKind::EmbedMany { target, .. }, Value::Array(items)) => {
                let mut links = Vec::with_capacity(items.len());
                for item in &items {
                    links.push(Link::Loaded(self.embedded(target, item, lookup)?));
                }
                Ok(FieldValue::Many(Collection::from_links(links)))
            }
            (FieldKind::ReferenceOne { target, .. }, id) => Ok(FieldValue::One(link(target, id, lookup))),
            (FieldKind::ReferenceMany { target, .. }, Value::Array(ids)) => Ok(FieldValue::Many(
                Collection::from_links(ids.into_iter().map(|id| link(target, id, lookup))),
            )),
            (_, other) => Err(CoreError::mapping(
                meta.name(),
                format!(
                    "stored value of field '{}' is {}, expected an array",
                    mapping.name,
                    other.type_name()
                ),
            )),
        }
    }

    fn embedded(
        &self,
        declared: &str,
        data: &Value,
        lookup: &dyn Fn(&str, &Value) -> Option<DocumentRef>,
    ) -> CoreResult<DocumentRef> {
        let declared = self.registry.get(declared)?;
        let (_, document) = self.hydrate(declared, data, lookup)?;
        Ok(document)
    }
}

fn link(target: &str, id: Value, lookup: &dyn Fn(&str, &Value) -> Option<DocumentRef>) -> Link {
    match lookup(target, &id) {
        Some(document) => Link::Loaded(document),
        None => Link::Unloaded(Proxy::new(target, id)),
    }
}
