//! Snapshots of last-written document state.

use crate::document::{Collection, DocumentRef, FieldValue, Link};
use crate::error::{CoreError, CoreResult};
use crate::metadata::{ClassMetadata, FieldKind, FieldMapping, MetadataRegistry};
use docmap_codec::Value;
use std::sync::Arc;

/// The snapshot of one field.
#[derive(Debug, Clone)]
pub enum OriginalValue {
    /// A scalar, or null for an empty association.
    Scalar(Value),
    /// A referenced document.
    Reference(Link),
    /// An embedded document and its own snapshot.
    Embedded {
        /// The embedded instance.
        document: DocumentRef,
        /// Its fields as written.
        data: OriginalData,
    },
    /// A reference collection and its elements as written.
    References {
        /// The container.
        container: Collection,
        /// Elements as written.
        elements: Vec<Link>,
    },
    /// An embedded collection and each element's snapshot.
    EmbeddedMany {
        /// The container.
        container: Collection,
        /// Elements as written.
        elements: Vec<(DocumentRef, OriginalData)>,
    },
}

impl OriginalValue {
    /// Converts back to the field value that was captured.
    #[must_use]
    pub fn to_field_value(&self) -> FieldValue {
        match self {
            Self::Scalar(value) => FieldValue::Scalar(value.clone()),
            Self::Reference(link) => FieldValue::One(link.clone()),
            Self::Embedded { document, .. } => FieldValue::One(Link::Loaded(document.clone())),
            Self::References { container, .. } | Self::EmbeddedMany { container, .. } => {
                FieldValue::Many(container.clone())
            }
        }
    }

    /// Returns `true` for a null snapshot.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Value::Null))
    }
}

/// The last-written state of a document, used as the diff baseline.
#[derive(Debug, Clone, Default)]
pub struct OriginalData {
    fields: Vec<(String, OriginalValue)>,
}

impl OriginalData {
    /// Captures the current state of `document`.
    ///
    /// Embedded documents are captured recursively; references and
    /// collections record their targets and containers by identity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] if a field holds a value that does not
    /// fit its mapping, or an embedded document's class is not mapped.
    pub fn capture(
        registry: &MetadataRegistry,
        meta: &ClassMetadata,
        document: &DocumentRef,
    ) -> CoreResult<Self> {
        let (id, values) = {
            let doc = document.read();
            let id = meta
                .id_field()
                .map(|f| (f.to_string(), doc.scalar(f).cloned().unwrap_or(Value::Null)));
            let values: Vec<(FieldMapping, FieldValue)> = meta
                .fields()
                .iter()
                .filter(|m| m.is_persisted())
                .map(|m| (m.clone(), doc.get_or_null(&m.name)))
                .collect();
            (id, values)
        };

        let mut data = Self::default();
        if let Some((field, id)) = id {
            data.set(field, OriginalValue::Scalar(id));
        }
        for (mapping, value) in values {
            let original = capture_field(registry, meta, &mapping, value)?;
            data.set(mapping.name, original);
        }
        Ok(data)
    }

    /// Returns the snapshot of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&OriginalValue> {
        self.fields.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    /// Returns the scalar snapshot of a field.
    #[must_use]
    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.get(field) {
            Some(OriginalValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    /// Overwrites the snapshot of a field.
    pub fn set(&mut self, field: impl Into<String>, value: OriginalValue) {
        let field = field.into();
        match self.fields.iter_mut().find(|(k, _)| *k == field) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((field, value)),
        }
    }

    /// Iterates captured fields.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OriginalValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the number of captured fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if nothing was captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn capture_field(
    registry: &MetadataRegistry,
    meta: &ClassMetadata,
    mapping: &FieldMapping,
    value: FieldValue,
) -> CoreResult<OriginalValue> {
    if value.is_null() {
        return Ok(OriginalValue::Scalar(Value::Null));
    }
    match (&mapping.kind, value) {
        (FieldKind::Scalar, FieldValue::Scalar(v)) => Ok(OriginalValue::Scalar(v)),
        (FieldKind::EmbedOne { target }, FieldValue::One(Link::Loaded(doc))) => {
            let embedded = embedded_meta(registry, target, &doc)?;
            let data = OriginalData::capture(registry, &embedded, &doc)?;
            Ok(OriginalValue::Embedded {
                document: doc,
                data,
            })
        }
        (FieldKind::EmbedMany { target, .. }, FieldValue::Many(container)) => {
            let mut elements = Vec::new();
            for link in container.links() {
                let doc = embedded_element(meta, mapping, link)?;
                let embedded = embedded_meta(registry, target, &doc)?;
                let data = OriginalData::capture(registry, &embedded, &doc)?;
                elements.push((doc, data));
            }
            Ok(OriginalValue::EmbeddedMany {
                container,
                elements,
            })
        }
        (FieldKind::ReferenceOne { .. }, FieldValue::One(link)) => {
            Ok(OriginalValue::Reference(link))
        }
        (FieldKind::ReferenceMany { .. }, FieldValue::Many(container)) => {
            Ok(OriginalValue::References {
                elements: container.links(),
                container,
            })
        }
        _ => Err(mismatch(meta, mapping)),
    }
}

/// Resolves the metadata of an embedded instance, which may be a subclass
/// of the declared target.
pub(crate) fn embedded_meta(
    registry: &MetadataRegistry,
    declared: &str,
    document: &DocumentRef,
) -> CoreResult<Arc<ClassMetadata>> {
    let class = document.class();
    let meta = registry.get(&class)?;
    if !meta.is_embedded() || !registry.is_subclass_of(&class, declared) {
        return Err(CoreError::mapping(
            class,
            format!("cannot be embedded where '{declared}' is expected"),
        ));
    }
    Ok(Arc::clone(meta))
}

pub(crate) fn embedded_element(
    meta: &ClassMetadata,
    mapping: &FieldMapping,
    link: Link,
) -> CoreResult<DocumentRef> {
    match link {
        Link::Loaded(doc) => Ok(doc),
        Link::Unloaded(_) => Err(CoreError::mapping(
            meta.name(),
            format!("embedded field '{}' cannot hold a proxy", mapping.name),
        )),
    }
}

pub(crate) fn mismatch(meta: &ClassMetadata, mapping: &FieldMapping) -> CoreError {
    let expected = match &mapping.kind {
        FieldKind::Scalar => "a scalar",
        FieldKind::EmbedOne { .. } => "an embedded document",
        FieldKind::ReferenceOne { .. } => "a reference",
        FieldKind::EmbedMany { .. } | FieldKind::ReferenceMany { .. } => "a collection",
    };
    CoreError::mapping(
        meta.name(),
        format!("field '{}' must hold {expected}", mapping.name),
    )
}
