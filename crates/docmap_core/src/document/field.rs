//! Field values, references and lazy proxies.

use super::collection::Collection;
use super::handle::DocumentRef;
use docmap_codec::{ObjectId, Value};

/// A reference to a document that has not been loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct Proxy {
    /// Declared class of the target.
    pub class: String,
    /// Identifier of the target.
    pub id: Value,
}

impl Proxy {
    /// Creates a proxy.
    pub fn new(class: impl Into<String>, id: Value) -> Self {
        Self {
            class: class.into(),
            id,
        }
    }
}

/// A reference to another document, loaded or not.
#[derive(Debug, Clone)]
pub enum Link {
    /// The target instance is in memory.
    Loaded(DocumentRef),
    /// Only the target's class and id are known.
    Unloaded(Proxy),
}

impl Link {
    /// Returns `true` if the target is in memory.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Returns the target instance if loaded.
    #[must_use]
    pub fn document(&self) -> Option<&DocumentRef> {
        match self {
            Self::Loaded(doc) => Some(doc),
            Self::Unloaded(_) => None,
        }
    }

    /// Returns the proxy if unloaded.
    #[must_use]
    pub fn proxy(&self) -> Option<&Proxy> {
        match self {
            Self::Loaded(_) => None,
            Self::Unloaded(proxy) => Some(proxy),
        }
    }
}

// Loaded links compare by instance, proxies by class and id. A loaded link
// never equals a proxy here; the change-set computer resolves that case
// through metadata.
impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Loaded(a), Self::Loaded(b)) => a.ptr_eq(b),
            (Self::Unloaded(a), Self::Unloaded(b)) => a == b,
            _ => false,
        }
    }
}

impl From<DocumentRef> for Link {
    fn from(doc: DocumentRef) -> Self {
        Self::Loaded(doc)
    }
}

impl From<Proxy> for Link {
    fn from(proxy: Proxy) -> Self {
        Self::Unloaded(proxy)
    }
}

/// The value held by one field of a document.
///
/// Scalars (including arrays and maps of scalars) are plain [`Value`]s;
/// single embedded documents and references are [`Link`]s; embedded and
/// referenced collections are [`Collection`]s. A null reference or a
/// null collection is `Scalar(Value::Null)`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// A plain value.
    Scalar(Value),
    /// One embedded or referenced document.
    One(Link),
    /// Many embedded or referenced documents.
    Many(Collection),
}

impl FieldValue {
    /// Returns `true` for `Scalar(Null)`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Scalar(Value::Null))
    }

    /// Returns the scalar value, if any.
    #[must_use]
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the link, if any.
    #[must_use]
    pub fn as_link(&self) -> Option<&Link> {
        match self {
            Self::One(link) => Some(link),
            _ => None,
        }
    }

    /// Returns the loaded document of a `One` field.
    #[must_use]
    pub fn as_document(&self) -> Option<&DocumentRef> {
        self.as_link().and_then(Link::document)
    }

    /// Returns the collection, if any.
    #[must_use]
    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Many(collection) => Some(collection),
            _ => None,
        }
    }
}

impl Default for FieldValue {
    fn default() -> Self {
        Self::Scalar(Value::Null)
    }
}

macro_rules! scalar_from {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for FieldValue {
                fn from(value: $t) -> Self {
                    Self::Scalar(Value::from(value))
                }
            }
        )*
    };
}

scalar_from!(bool, i32, i64, u32, f64, String, &str, ObjectId, Vec<Value>);

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<Link> for FieldValue {
    fn from(link: Link) -> Self {
        Self::One(link)
    }
}

impl From<DocumentRef> for FieldValue {
    fn from(doc: DocumentRef) -> Self {
        Self::One(Link::Loaded(doc))
    }
}

impl From<Proxy> for FieldValue {
    fn from(proxy: Proxy) -> Self {
        Self::One(Link::Unloaded(proxy))
    }
}

impl From<Collection> for FieldValue {
    fn from(collection: Collection) -> Self {
        Self::Many(collection)
    }
}

impl From<Option<DocumentRef>> for FieldValue {
    fn from(doc: Option<DocumentRef>) -> Self {
        doc.map_or_else(Self::default, Self::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn links_compare_by_identity() {
        let a = DocumentRef::new("Group");
        let b = DocumentRef::new("Group");
        assert_eq!(Link::from(a.clone()), Link::from(a.clone()));
        assert_ne!(Link::from(a.clone()), Link::from(b));

        let p = Proxy::new("Group", Value::Integer(1));
        assert_eq!(Link::from(p.clone()), Link::from(p.clone()));
        assert_ne!(Link::from(p), Link::from(a));
    }

    #[test]
    fn field_value_conversions() {
        assert_eq!(FieldValue::from("x"), FieldValue::Scalar(Value::from("x")));
        assert!(FieldValue::from(None::<DocumentRef>).is_null());
        let doc = DocumentRef::new("Address");
        assert!(FieldValue::from(doc.clone()).as_document().unwrap().ptr_eq(&doc));
    }
}
