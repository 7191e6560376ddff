//! Per-class mapping metadata.

use crate::document::{Document, DocumentRef, FieldValue};
use docmap_codec::Value;
use std::fmt;
use std::sync::Arc;

/// The storage name of every document identifier.
pub const ID_DB_NAME: &str = "_id";

/// What kind of type a class maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// A top-level document stored in its own collection.
    Document,
    /// A document stored inline in its owner.
    Embedded,
    /// Shares fields with subclasses but is never persisted itself.
    MappedSuperclass,
}

/// Generates identifiers for [`IdStrategy::Custom`].
pub trait IdGenerator: Send + Sync + fmt::Debug {
    /// Returns a fresh identifier for a document of `class`.
    fn generate(&self, class: &ClassMetadata) -> Value;
}

/// How a class obtains identifiers.
#[derive(Debug, Clone, Default)]
pub enum IdStrategy {
    /// The caller always assigns the id.
    None,
    /// The backend assigns an [`ObjectId`](docmap_codec::ObjectId) on insert
    /// unless the caller already set one.
    #[default]
    Auto,
    /// A random UUID (v4, hyphenated text) is generated at persist time.
    Uuid,
    /// A custom generator runs at persist time.
    Custom(Arc<dyn IdGenerator>),
}

impl IdStrategy {
    /// Generates an id at persist time, if this strategy does so.
    #[must_use]
    pub fn generate(&self, class: &ClassMetadata) -> Option<Value> {
        match self {
            Self::None | Self::Auto => None,
            Self::Uuid => Some(Value::Text(uuid::Uuid::new_v4().to_string())),
            Self::Custom(generator) => Some(generator.generate(class)),
        }
    }
}

/// Which operations propagate across a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct Cascade {
    /// `persist` follows the reference.
    pub persist: bool,
    /// `remove` follows the reference.
    pub remove: bool,
    /// `detach` follows the reference.
    pub detach: bool,
    /// `refresh` follows the reference.
    pub refresh: bool,
}

impl Cascade {
    /// Nothing cascades.
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
        detach: false,
        refresh: false,
    };
    /// Only persist cascades.
    pub const PERSIST: Self = Self {
        persist: true,
        ..Self::NONE
    };
    /// Only remove cascades.
    pub const REMOVE: Self = Self {
        remove: true,
        ..Self::NONE
    };
    /// Everything cascades.
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
        detach: true,
        refresh: true,
    };

    /// Combines two cascade sets.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self {
            persist: self.persist || other.persist,
            remove: self.remove || other.remove,
            detach: self.detach || other.detach,
            refresh: self.refresh || other.refresh,
        }
    }
}

/// How changes to a collection field are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionStrategy {
    /// Incremental: removed elements are pulled, new ones pushed.
    #[default]
    PushAll,
    /// Incremental: new elements are added only if not already present.
    AddToSet,
    /// The whole array is rewritten on any change.
    Set,
    /// Like `Set`, re-indexing the array.
    SetArray,
}

impl CollectionStrategy {
    /// Returns `true` for strategies that rewrite the whole field.
    #[must_use]
    pub const fn is_atomic(self) -> bool {
        matches!(self, Self::Set | Self::SetArray)
    }
}

/// What a mapped field holds.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// A plain value.
    Scalar,
    /// One embedded document.
    EmbedOne {
        /// Embedded class.
        target: String,
    },
    /// A list of embedded documents.
    EmbedMany {
        /// Embedded class.
        target: String,
        /// Write strategy.
        strategy: CollectionStrategy,
    },
    /// One referenced document, stored as its id.
    ReferenceOne {
        /// Referenced class.
        target: String,
        /// Cascaded operations.
        cascade: Cascade,
        /// `false` for an inverse side that is never written.
        owning: bool,
    },
    /// A list of referenced documents, stored as an array of ids.
    ReferenceMany {
        /// Referenced class.
        target: String,
        /// Cascaded operations.
        cascade: Cascade,
        /// `false` for an inverse side that is never written.
        owning: bool,
        /// Write strategy.
        strategy: CollectionStrategy,
    },
}

impl FieldKind {
    /// Returns the associated class, if any.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Scalar => None,
            Self::EmbedOne { target }
            | Self::EmbedMany { target, .. }
            | Self::ReferenceOne { target, .. }
            | Self::ReferenceMany { target, .. } => Some(target),
        }
    }

    /// Returns `true` for embedded fields.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::EmbedOne { .. } | Self::EmbedMany { .. })
    }

    /// Returns `true` for reference fields.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::ReferenceOne { .. } | Self::ReferenceMany { .. })
    }

    /// Returns `true` for collection fields.
    #[must_use]
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::EmbedMany { .. } | Self::ReferenceMany { .. })
    }

    /// Returns the cascade set of a reference (embedded fields are owned
    /// and handled separately).
    #[must_use]
    pub fn cascade(&self) -> Cascade {
        match self {
            Self::ReferenceOne { cascade, .. } | Self::ReferenceMany { cascade, .. } => *cascade,
            _ => Cascade::NONE,
        }
    }

    /// Returns `false` only for inverse-side references.
    #[must_use]
    pub fn is_owning(&self) -> bool {
        match self {
            Self::ReferenceOne { owning, .. } | Self::ReferenceMany { owning, .. } => *owning,
            _ => true,
        }
    }

    /// Returns the write strategy of a collection field.
    #[must_use]
    pub fn strategy(&self) -> Option<CollectionStrategy> {
        match self {
            Self::EmbedMany { strategy, .. } | Self::ReferenceMany { strategy, .. } => {
                Some(*strategy)
            }
            _ => None,
        }
    }
}

/// One mapped field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    /// In-memory field name.
    pub name: String,
    /// Storage field name.
    pub db_name: String,
    /// What the field holds.
    pub kind: FieldKind,
    /// Whether null is written as null (`true`) or the field is unset.
    pub nullable: bool,
}

impl FieldMapping {
    fn with_kind(name: impl Into<String>, kind: FieldKind) -> Self {
        let name = name.into();
        Self {
            db_name: name.clone(),
            name,
            kind,
            nullable: false,
        }
    }

    /// A scalar field.
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::with_kind(name, FieldKind::Scalar)
    }

    /// An embed-one field.
    pub fn embed_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            FieldKind::EmbedOne {
                target: target.into(),
            },
        )
    }

    /// An embed-many field.
    pub fn embed_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            FieldKind::EmbedMany {
                target: target.into(),
                strategy: CollectionStrategy::default(),
            },
        )
    }

    /// A reference-one field.
    pub fn reference_one(name: impl Into<String>, target: impl Into<String>, cascade: Cascade) -> Self {
        Self::with_kind(
            name,
            FieldKind::ReferenceOne {
                target: target.into(),
                cascade,
                owning: true,
            },
        )
    }

    /// A reference-many field.
    pub fn reference_many(name: impl Into<String>, target: impl Into<String>, cascade: Cascade) -> Self {
        Self::with_kind(
            name,
            FieldKind::ReferenceMany {
                target: target.into(),
                cascade,
                owning: true,
                strategy: CollectionStrategy::default(),
            },
        )
    }

    /// Sets the storage name.
    #[must_use]
    pub fn db_name(mut self, db_name: impl Into<String>) -> Self {
        self.db_name = db_name.into();
        self
    }

    /// Writes null values instead of unsetting the field.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the write strategy of a collection field.
    #[must_use]
    pub fn strategy(mut self, value: CollectionStrategy) -> Self {
        match &mut self.kind {
            FieldKind::EmbedMany { strategy, .. } | FieldKind::ReferenceMany { strategy, .. } => {
                *strategy = value;
            }
            _ => {}
        }
        self
    }

    /// Marks a reference as the inverse side: loaded but never written.
    #[must_use]
    pub fn inverse(mut self) -> Self {
        match &mut self.kind {
            FieldKind::ReferenceOne { owning, .. } | FieldKind::ReferenceMany { owning, .. } => {
                *owning = false;
            }
            _ => {}
        }
        self
    }

    /// Returns `true` if this field is written to storage.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.kind.is_owning()
    }
}

/// Resolved metadata of one class.
///
/// Fields inherited from parent classes come first, in the parent's order.
/// Instances are produced by [`MetadataRegistry`](super::MetadataRegistry)
/// and are immutable.
#[derive(Debug, Clone)]
pub struct ClassMetadata {
    pub(super) name: String,
    pub(super) kind: DocumentKind,
    pub(super) parent: Option<String>,
    pub(super) root: String,
    pub(super) collection: Option<String>,
    pub(super) id_field: Option<String>,
    pub(super) id_strategy: IdStrategy,
    pub(super) version_field: Option<String>,
    pub(super) discriminator_field: Option<String>,
    pub(super) discriminator_value: Option<String>,
    pub(super) fields: Vec<FieldMapping>,
}

impl ClassMetadata {
    /// Starts a top-level document class.
    pub fn document(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, DocumentKind::Document)
    }

    /// Starts an embedded document class.
    pub fn embedded(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, DocumentKind::Embedded)
    }

    /// Starts a mapped superclass.
    pub fn mapped_superclass(name: impl Into<String>) -> ClassBuilder {
        ClassBuilder::new(name, DocumentKind::MappedSuperclass)
    }

    /// Class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class kind.
    #[must_use]
    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    /// Returns `true` for top-level documents.
    #[must_use]
    pub fn is_document(&self) -> bool {
        self.kind == DocumentKind::Document
    }

    /// Returns `true` for embedded documents.
    #[must_use]
    pub fn is_embedded(&self) -> bool {
        self.kind == DocumentKind::Embedded
    }

    /// Direct parent class.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// Topmost class of the inheritance chain; identities are scoped to it.
    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Storage collection (`None` for embedded classes).
    #[must_use]
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// In-memory name of the identifier field.
    #[must_use]
    pub fn id_field(&self) -> Option<&str> {
        self.id_field.as_deref()
    }

    /// Identifier strategy.
    #[must_use]
    pub fn id_strategy(&self) -> &IdStrategy {
        &self.id_strategy
    }

    /// Optimistic-lock version field.
    #[must_use]
    pub fn version_field(&self) -> Option<&str> {
        self.version_field.as_deref()
    }

    /// Storage field holding the discriminator.
    #[must_use]
    pub fn discriminator_field(&self) -> Option<&str> {
        self.discriminator_field.as_deref()
    }

    /// This class's discriminator value.
    #[must_use]
    pub fn discriminator_value(&self) -> Option<&str> {
        self.discriminator_value.as_deref()
    }

    /// All mapped fields (excluding the identifier).
    #[must_use]
    pub fn fields(&self) -> &[FieldMapping] {
        &self.fields
    }

    /// Looks up a mapped field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Mapped fields that reference other documents.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.kind.is_reference())
    }

    /// Mapped fields that embed other documents.
    pub fn embedded_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.kind.is_embedded())
    }

    /// Reads a non-null identifier from a document.
    #[must_use]
    pub fn identifier_of(&self, document: &Document) -> Option<Value> {
        let field = self.id_field.as_deref()?;
        document.scalar(field).filter(|v| !v.is_null()).cloned()
    }

    /// Reads a non-null identifier through a handle.
    #[must_use]
    pub fn identifier(&self, document: &DocumentRef) -> Option<Value> {
        self.identifier_of(&document.read())
    }

    /// Writes the identifier field of a document.
    pub fn set_identifier(&self, document: &DocumentRef, id: Value) {
        if let Some(field) = self.id_field.as_deref() {
            document.set(field, FieldValue::Scalar(id));
        }
    }

    /// Reads the version of a versioned document.
    #[must_use]
    pub fn version_of(&self, document: &Document) -> Option<i64> {
        let field = self.version_field.as_deref()?;
        document.scalar(field).and_then(Value::as_integer)
    }
}

/// Builder for [`ClassMetadata`], resolved by the registry.
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    pub(super) name: String,
    pub(super) kind: DocumentKind,
    pub(super) parent: Option<String>,
    pub(super) collection: Option<String>,
    pub(super) id: Option<(String, IdStrategy)>,
    pub(super) version_field: Option<String>,
    pub(super) discriminator_field: Option<String>,
    pub(super) discriminator_value: Option<String>,
    pub(super) fields: Vec<FieldMapping>,
}

impl ClassBuilder {
    fn new(name: impl Into<String>, kind: DocumentKind) -> Self {
        Self {
            name: name.into(),
            kind,
            parent: None,
            collection: None,
            id: None,
            version_field: None,
            discriminator_field: None,
            discriminator_value: None,
            fields: Vec::new(),
        }
    }

    /// Inherits fields, identifier and collection from `parent`.
    #[must_use]
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Sets the storage collection (defaults to the class name).
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Declares the identifier field and strategy.
    #[must_use]
    pub fn id(mut self, field: impl Into<String>, strategy: IdStrategy) -> Self {
        self.id = Some((field.into(), strategy));
        self
    }

    /// Declares an integer version field used for optimistic locking.
    #[must_use]
    pub fn version(mut self, field: impl Into<String>) -> Self {
        self.version_field = Some(field.into());
        self
    }

    /// Declares the storage field holding the discriminator (root classes).
    #[must_use]
    pub fn discriminator_field(mut self, field: impl Into<String>) -> Self {
        self.discriminator_field = Some(field.into());
        self
    }

    /// Declares this class's discriminator value.
    #[must_use]
    pub fn discriminator_value(mut self, value: impl Into<String>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    /// Adds a field mapping.
    #[must_use]
    pub fn mapping(mut self, mapping: FieldMapping) -> Self {
        self.fields.push(mapping);
        self
    }

    /// Adds a scalar field.
    #[must_use]
    pub fn field(self, name: impl Into<String>) -> Self {
        self.mapping(FieldMapping::scalar(name))
    }

    /// Adds an embed-one field.
    #[must_use]
    pub fn embed_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.mapping(FieldMapping::embed_one(name, target))
    }

    /// Adds an embed-many field.
    #[must_use]
    pub fn embed_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.mapping(FieldMapping::embed_many(name, target))
    }

    /// Adds a reference-one field.
    #[must_use]
    pub fn reference_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        cascade: Cascade,
    ) -> Self {
        self.mapping(FieldMapping::reference_one(name, target, cascade))
    }

    /// Adds a reference-many field.
    #[must_use]
    pub fn reference_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        cascade: Cascade,
    ) -> Self {
        self.mapping(FieldMapping::reference_many(name, target, cascade))
    }

    /// Returns the class name being built.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_union() {
        let both = Cascade::PERSIST.union(Cascade::REMOVE);
        assert!(both.persist && both.remove);
        assert!(!both.detach);
        assert_eq!(Cascade::default(), Cascade::NONE);
    }

    #[test]
    fn field_mapping_builders() {
        let f = FieldMapping::reference_many("groups", "Group", Cascade::ALL)
            .db_name("group_ids")
            .strategy(CollectionStrategy::AddToSet)
            .inverse();
        assert_eq!(f.db_name, "group_ids");
        assert_eq!(f.kind.strategy(), Some(CollectionStrategy::AddToSet));
        assert!(!f.is_persisted());
        assert_eq!(f.kind.target(), Some("Group"));
        assert!(f.kind.is_collection() && f.kind.is_reference());
    }

    #[test]
    fn embedded_fields_do_not_cascade() {
        let f = FieldMapping::embed_one("address", "Address");
        assert_eq!(f.kind.cascade(), Cascade::NONE);
        assert!(f.kind.is_embedded());
        assert!(f.is_persisted());
    }

    #[test]
    fn uuid_strategy_generates_text() {
        let class = ClassMetadata {
            name: "T".into(),
            kind: DocumentKind::Document,
            parent: None,
            root: "T".into(),
            collection: Some("t".into()),
            id_field: Some("id".into()),
            id_strategy: IdStrategy::Uuid,
            version_field: None,
            discriminator_field: None,
            discriminator_value: None,
            fields: Vec::new(),
        };
        let id = class.id_strategy().generate(&class).unwrap();
        assert_eq!(id.as_text().map(str::len), Some(36));
        assert!(IdStrategy::Auto.generate(&class).is_none());
    }
}
