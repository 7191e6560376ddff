//! Class mapping metadata.
//!
//! Metadata is declared through builders rather than read from annotations,
//! resolved once into a [`MetadataRegistry`], and shared immutably by the
//! unit of work, change-set computer and persisters.

mod class;
mod registry;

pub use class::{
    Cascade, ClassBuilder, ClassMetadata, CollectionStrategy, DocumentKind, FieldKind,
    FieldMapping, IdGenerator, IdStrategy, ID_DB_NAME,
};
pub use registry::{MetadataRegistry, RegistryBuilder};
