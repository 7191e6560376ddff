//! In-memory document model.
//!
//! A [`DocumentRef`] is a shared handle to one document instance. Fields are
//! [`FieldValue`]s: scalars, single links to other documents (embedded or
//! referenced, possibly an unloaded [`Proxy`]), or [`Collection`]s of links.
//! What a field *means* is decided by the class metadata, not by the value.

mod collection;
mod field;
mod handle;

pub use collection::Collection;
pub use field::{FieldValue, Link, Proxy};
pub use handle::{Document, DocumentRef, WeakDocumentRef};
