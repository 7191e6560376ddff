//! Collection-valued fields.

use super::field::Link;
use super::handle::DocumentRef;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// A shared list of links held by an embed-many or reference-many field.
///
/// The container has its own identity: mutating it in place is tracked
/// element by element, while assigning a different `Collection` to the
/// field is a wholesale replacement.
#[derive(Clone, Default)]
pub struct Collection(Arc<RwLock<Vec<Link>>>);

impl Collection {
    /// Creates an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a collection of loaded documents.
    pub fn of(documents: impl IntoIterator<Item = DocumentRef>) -> Self {
        Self::from_links(documents.into_iter().map(Link::Loaded))
    }

    /// Creates a collection from links.
    pub fn from_links(links: impl IntoIterator<Item = Link>) -> Self {
        Self(Arc::new(RwLock::new(links.into_iter().collect())))
    }

    /// Returns `true` if both handles are the same container.
    #[must_use]
    pub fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns the number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Returns `true` if empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Returns a copy of the current elements.
    #[must_use]
    pub fn links(&self) -> Vec<Link> {
        self.0.read().clone()
    }

    /// Returns the loaded documents, skipping unloaded proxies.
    #[must_use]
    pub fn documents(&self) -> Vec<DocumentRef> {
        self.0
            .read()
            .iter()
            .filter_map(|link| link.document().cloned())
            .collect()
    }

    /// Returns the element at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Link> {
        self.0.read().get(index).cloned()
    }

    /// Appends an element.
    pub fn push(&self, link: impl Into<Link>) {
        self.0.write().push(link.into());
    }

    /// Inserts an element at `index`, shifting later ones.
    ///
    /// # Panics
    ///
    /// Panics if `index > len`.
    pub fn insert(&self, index: usize, link: impl Into<Link>) {
        self.0.write().insert(index, link.into());
    }

    /// Replaces the element at `index`, returning the old one.
    pub fn replace(&self, index: usize, link: impl Into<Link>) -> Option<Link> {
        let mut items = self.0.write();
        let slot = items.get_mut(index)?;
        Some(std::mem::replace(slot, link.into()))
    }

    /// Removes the element at `index`.
    pub fn remove(&self, index: usize) -> Option<Link> {
        let mut items = self.0.write();
        (index < items.len()).then(|| items.remove(index))
    }

    /// Removes the first occurrence of a loaded document.
    pub fn remove_document(&self, document: &DocumentRef) -> bool {
        let mut items = self.0.write();
        match items
            .iter()
            .position(|link| link.document().is_some_and(|d| d.ptr_eq(document)))
        {
            Some(pos) => {
                items.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Swaps two elements.
    pub fn swap(&self, a: usize, b: usize) {
        self.0.write().swap(a, b);
    }

    /// Removes every element.
    pub fn clear(&self) {
        self.0.write().clear();
    }
}

// Collections compare by container identity.
impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Some(items) => f.debug_list().entries(items.iter()).finish(),
            None => f.write_str("Collection(<locked>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_elements() {
        let a = Collection::new();
        let b = a.clone();
        b.push(DocumentRef::new("Phone"));
        assert_eq!(a.len(), 1);
        assert!(a.ptr_eq(&b));
        assert_ne!(a, Collection::new());
    }

    #[test]
    fn remove_document_by_identity() {
        let x = DocumentRef::new("Phone");
        let y = DocumentRef::new("Phone");
        let c = Collection::of([x.clone(), y.clone()]);
        assert!(c.remove_document(&x));
        assert!(!c.remove_document(&x));
        assert_eq!(c.documents(), vec![y]);
    }

    #[test]
    fn positional_edits() {
        let x = DocumentRef::new("Phone");
        let y = DocumentRef::new("Phone");
        let c = Collection::of([x.clone()]);
        c.insert(0, y.clone());
        c.swap(0, 1);
        assert_eq!(c.documents(), vec![x.clone(), y.clone()]);
        assert!(c.replace(5, x.clone()).is_none());
        assert!(c.remove(1).is_some());
        assert!(c.remove(1).is_none());
    }
}
