//! Shared document handles.

use super::field::FieldValue;
use crate::types::Oid;
use docmap_codec::Value;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::{Arc, Weak};

/// The fields of one document instance.
///
/// Fields keep their insertion order. A missing field reads as null.
#[derive(Debug, Clone, Default)]
pub struct Document {
    class: String,
    fields: Vec<(String, FieldValue)>,
}

impl Document {
    /// Creates an empty document of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Vec::new(),
        }
    }

    /// Returns the class name.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Returns a field, if set.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    /// Returns a field, or null when missing.
    #[must_use]
    pub fn get_or_null(&self, field: &str) -> FieldValue {
        self.get(field).cloned().unwrap_or_default()
    }

    /// Returns the scalar value of a field, if it holds one.
    #[must_use]
    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.get(field) {
            Some(FieldValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    /// Sets a field, returning the previous value.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Option<FieldValue> {
        let field = field.into();
        let value = value.into();
        if let Some((_, slot)) = self.fields.iter_mut().find(|(k, _)| *k == field) {
            return Some(std::mem::replace(slot, value));
        }
        self.fields.push((field, value));
        None
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|(k, _)| k == field)?;
        Some(self.fields.remove(pos).1)
    }

    /// Iterates fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// A shared, mutable handle to a document instance.
///
/// Cloning the handle does not copy the document: every clone observes the
/// same fields, and [`DocumentRef::oid`] is identical for all of them.
#[derive(Clone)]
pub struct DocumentRef(Arc<RwLock<Document>>);

impl DocumentRef {
    /// Creates a new, empty document of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self::from_document(Document::new(class))
    }

    /// Wraps an existing document.
    #[must_use]
    pub fn from_document(document: Document) -> Self {
        Self(Arc::new(RwLock::new(document)))
    }

    /// Builder-style field assignment.
    #[must_use]
    pub fn with(self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(field, value);
        self
    }

    /// Returns the session identity of this instance.
    #[must_use]
    pub fn oid(&self) -> Oid {
        Oid::from_raw(Arc::as_ptr(&self.0).cast::<()>() as usize)
    }

    /// Returns `true` if both handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &DocumentRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns the class name.
    #[must_use]
    pub fn class(&self) -> String {
        self.0.read().class.clone()
    }

    /// Locks the document for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, Document> {
        self.0.read()
    }

    /// Locks the document for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, Document> {
        self.0.write()
    }

    /// Returns a copy of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.0.read().get(field).cloned()
    }

    /// Returns a copy of a scalar field.
    #[must_use]
    pub fn scalar(&self, field: &str) -> Option<Value> {
        self.0.read().scalar(field).cloned()
    }

    /// Sets a field.
    pub fn set(&self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.write().set(field, value);
    }

    /// Returns a weak handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakDocumentRef {
        WeakDocumentRef(Arc::downgrade(&self.0))
    }
}

impl PartialEq for DocumentRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for DocumentRef {}

// Documents may reference each other in cycles, so only the class and
// identity are printed.
impl fmt::Debug for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Some(doc) => write!(f, "DocumentRef({} @ {})", doc.class, self.oid()),
            None => write!(f, "DocumentRef(<locked> @ {})", self.oid()),
        }
    }
}

/// A non-owning handle to a document instance.
#[derive(Debug, Clone)]
pub struct WeakDocumentRef(Weak<RwLock<Document>>);

impl WeakDocumentRef {
    /// Returns a strong handle if the instance is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<DocumentRef> {
        self.0.upgrade().map(DocumentRef)
    }

    /// Returns `true` if this handle points at `document`.
    #[must_use]
    pub fn is(&self, document: &DocumentRef) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&document.0))
    }
}
