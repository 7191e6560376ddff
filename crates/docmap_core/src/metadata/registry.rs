//! Resolved metadata for every mapped class.

use super::class::{ClassBuilder, ClassMetadata, DocumentKind, FieldKind, FieldMapping, IdStrategy};
use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable lookup of [`ClassMetadata`] by class name.
///
/// Built once through [`MetadataRegistry::builder`], which composes
/// inherited fields and validates every association.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    classes: Vec<Arc<ClassMetadata>>,
    index: HashMap<String, usize>,
}

impl MetadataRegistry {
    /// Starts building a registry.
    #[must_use]
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Returns the metadata of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] if the class is not mapped.
    pub fn get(&self, class: &str) -> CoreResult<&Arc<ClassMetadata>> {
        self.try_get(class)
            .ok_or_else(|| CoreError::mapping(class, "class is not mapped"))
    }

    /// Returns the metadata of `class`, if mapped.
    #[must_use]
    pub fn try_get(&self, class: &str) -> Option<&Arc<ClassMetadata>> {
        self.index.get(class).map(|&i| &self.classes[i])
    }

    /// Returns `true` if `class` is mapped.
    #[must_use]
    pub fn contains(&self, class: &str) -> bool {
        self.index.contains_key(class)
    }

    /// Iterates classes in registration order.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassMetadata>> {
        self.classes.iter()
    }

    /// Returns the number of mapped classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    /// Returns `true` if nothing is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Returns `true` if `class` is `ancestor` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: &str, ancestor: &str) -> bool {
        let mut current = self.try_get(class);
        while let Some(meta) = current {
            if meta.name() == ancestor {
                return true;
            }
            current = meta.parent().and_then(|p| self.try_get(p));
        }
        false
    }

    /// Returns `class` and every class inheriting from it, in registration order.
    #[must_use]
    pub fn subclasses_of(&self, class: &str) -> Vec<&Arc<ClassMetadata>> {
        self.classes
            .iter()
            .filter(|meta| self.is_subclass_of(meta.name(), class))
            .collect()
    }

    /// Finds the class in `root`'s hierarchy with the given discriminator value.
    #[must_use]
    pub fn class_for_discriminator(&self, root: &str, value: &str) -> Option<&Arc<ClassMetadata>> {
        self.classes
            .iter()
            .find(|meta| meta.root() == root && meta.discriminator_value() == Some(value))
    }
}

/// Collects [`ClassBuilder`]s and resolves them into a [`MetadataRegistry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    builders: Vec<ClassBuilder>,
}

impl RegistryBuilder {
    /// Adds a class.
    #[must_use]
    pub fn class(mut self, builder: ClassBuilder) -> Self {
        self.builders.push(builder);
        self
    }

    /// Resolves inheritance and validates all mappings.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Mapping`] for duplicate classes or fields,
    /// unknown or cyclic parents, documents without an identifier,
    /// associations to unknown or wrongly-kinded classes, and duplicate
    /// discriminator values.
    pub fn build(self) -> CoreResult<MetadataRegistry> {
        let mut positions = HashMap::new();
        for (i, builder) in self.builders.iter().enumerate() {
            if positions.insert(builder.name.clone(), i).is_some() {
                return Err(CoreError::mapping(&builder.name, "class is mapped twice"));
            }
        }

        // Parents must resolve before children.
        let mut resolved: Vec<Option<Arc<ClassMetadata>>> = vec![None; self.builders.len()];
        let mut remaining = self.builders.len();
        while remaining > 0 {
            let mut progressed = false;
            for (i, builder) in self.builders.iter().enumerate() {
                if resolved[i].is_some() {
                    continue;
                }
                let parent = match &builder.parent {
                    None => None,
                    Some(parent) => {
                        let &p = positions.get(parent).ok_or_else(|| {
                            CoreError::mapping(&builder.name, format!("unknown parent '{parent}'"))
                        })?;
                        match &resolved[p] {
                            Some(meta) => Some(Arc::clone(meta)),
                            None => continue,
                        }
                    }
                };
                resolved[i] = Some(Arc::new(resolve(builder, parent.as_deref())?));
                remaining -= 1;
                progressed = true;
            }
            if !progressed {
                let stuck = self
                    .builders
                    .iter()
                    .zip(&resolved)
                    .find(|(_, r)| r.is_none())
                    .map_or_else(String::new, |(b, _)| b.name.clone());
                return Err(CoreError::mapping(stuck, "inheritance cycle"));
            }
        }

        let registry = MetadataRegistry {
            classes: resolved.into_iter().flatten().collect(),
            index: positions,
        };
        validate(&registry)?;
        Ok(registry)
    }
}

fn resolve(builder: &ClassBuilder, parent: Option<&ClassMetadata>) -> CoreResult<ClassMetadata> {
    let name = builder.name.clone();

    if let Some(parent) = parent {
        let compatible = match builder.kind {
            DocumentKind::Embedded => parent.kind() == DocumentKind::Embedded,
            DocumentKind::Document | DocumentKind::MappedSuperclass => {
                parent.kind() != DocumentKind::Embedded
            }
        };
        if !compatible {
            return Err(CoreError::mapping(
                &name,
                format!("cannot extend '{}' of a different kind", parent.name()),
            ));
        }
    }

    let mut fields: Vec<FieldMapping> = parent.map(|p| p.fields.clone()).unwrap_or_default();
    for mapping in &builder.fields {
        if fields.iter().any(|f| f.name == mapping.name) {
            return Err(CoreError::mapping(
                &name,
                format!("field '{}' is mapped twice", mapping.name),
            ));
        }
        fields.push(mapping.clone());
    }

    let (id_field, id_strategy) = match (&builder.id, parent) {
        (Some((field, strategy)), _) => (Some(field.clone()), strategy.clone()),
        (None, Some(p)) => (p.id_field.clone(), p.id_strategy.clone()),
        (None, None) => (None, IdStrategy::default()),
    };
    if builder.kind == DocumentKind::Document && id_field.is_none() {
        return Err(CoreError::mapping(&name, "documents must declare an identifier"));
    }
    if let Some(id) = &id_field {
        if fields.iter().any(|f| &f.name == id) {
            return Err(CoreError::mapping(
                &name,
                format!("identifier '{id}' is also mapped as a field"),
            ));
        }
    }

    let version_field = builder
        .version_field
        .clone()
        .or_else(|| parent.and_then(|p| p.version_field.clone()));
    if let Some(version) = &version_field {
        match fields.iter().find(|f| &f.name == version) {
            Some(f) if f.kind != FieldKind::Scalar => {
                return Err(CoreError::mapping(&name, "version field must be a scalar"));
            }
            Some(_) => {}
            None => fields.push(FieldMapping::scalar(version.clone())),
        }
    }

    // Mapped superclasses share fields only: identity and storage start at
    // the first real document class.
    let document_parent = parent.filter(|p| p.kind() != DocumentKind::MappedSuperclass);
    let collection = match builder.kind {
        DocumentKind::Embedded => None,
        DocumentKind::MappedSuperclass => builder.collection.clone(),
        DocumentKind::Document => builder
            .collection
            .clone()
            .or_else(|| document_parent.and_then(|p| p.collection.clone()))
            .or_else(|| Some(name.clone())),
    };

    Ok(ClassMetadata {
        root: document_parent.map_or_else(|| name.clone(), |p| p.root.clone()),
        parent: parent.map(|p| p.name.clone()),
        kind: builder.kind,
        collection,
        id_field,
        id_strategy,
        version_field,
        discriminator_field: builder
            .discriminator_field
            .clone()
            .or_else(|| parent.and_then(|p| p.discriminator_field.clone())),
        discriminator_value: builder.discriminator_value.clone(),
        fields,
        name,
    })
}

fn validate(registry: &MetadataRegistry) -> CoreResult<()> {
    let mut discriminators: HashMap<(&str, &str), &str> = HashMap::new();

    for meta in registry.classes() {
        for field in meta.fields() {
            let Some(target) = field.kind.target() else {
                continue;
            };
            let target_meta = registry.try_get(target).ok_or_else(|| {
                CoreError::mapping(
                    meta.name(),
                    format!("field '{}' targets unknown class '{target}'", field.name),
                )
            })?;
            let expected_embedded = field.kind.is_embedded();
            if target_meta.is_embedded() != expected_embedded {
                let wanted = if expected_embedded { "an embedded" } else { "a document" };
                return Err(CoreError::mapping(
                    meta.name(),
                    format!("field '{}' must target {wanted} class", field.name),
                ));
            }
        }

        if let Some(value) = meta.discriminator_value() {
            if meta.discriminator_field().is_none() {
                return Err(CoreError::mapping(
                    meta.name(),
                    "discriminator value without a discriminator field",
                ));
            }
            if let Some(other) = discriminators.insert((meta.root(), value), meta.name()) {
                return Err(CoreError::mapping(
                    meta.name(),
                    format!("discriminator value '{value}' is already used by '{other}'"),
                ));
            }
        }
    }
    Ok(())
}
