//! Change sets: what differs between a snapshot and a live document.
//!
//! A [`ChangeSet`] is sparse: it lists only fields that changed. Each entry
//! is a [`Change`]:
//!
//! - [`Change::Field`]: the value was replaced (for a NEW document every
//!   field is reported with no old value)
//! - [`Change::Embedded`]: the same embedded instance was modified; the
//!   nested change set lists its changed fields
//! - [`Change::Collection`]: the same collection container was mutated in
//!   place; see [`CollectionChangeSet`]

mod computer;
mod original;

pub use computer::ChangeSetComputer;
pub use original::{OriginalData, OriginalValue};
pub(crate) use original::{embedded_element, embedded_meta, mismatch};

use crate::document::{FieldValue, Link};

/// A replaced field value.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Snapshot value; `None` when the document has never been written.
    pub old: Option<FieldValue>,
    /// Current value.
    pub new: FieldValue,
}

impl FieldChange {
    /// Creates a field change.
    #[must_use]
    pub fn new(old: Option<FieldValue>, new: FieldValue) -> Self {
        Self { old, new }
    }
}

/// In-place mutation of a collection field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionChangeSet {
    /// Elements not in the snapshot, in current order.
    pub inserted: Vec<Link>,
    /// Snapshot elements no longer present, in snapshot order.
    pub deleted: Vec<Link>,
    /// Surviving elements changed their relative order.
    pub reordered: bool,
    /// Surviving embedded elements that were modified, by current index.
    pub updated: Vec<(usize, ChangeSet)>,
}

impl CollectionChangeSet {
    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && !self.reordered && self.updated.is_empty()
    }

    /// Returns `true` if only element contents changed.
    #[must_use]
    pub fn is_update_only(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && !self.reordered
    }
}

/// One field's change.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// The field value was replaced.
    Field(FieldChange),
    /// The embedded document was modified in place.
    Embedded(ChangeSet),
    /// The collection was mutated in place.
    Collection(CollectionChangeSet),
}

/// Per-field changes of one document, in mapping order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: Vec<(String, Change)>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns the number of changed fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns the change of a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Change> {
        self.changes.iter().find(|(k, _)| k == field).map(|(_, c)| c)
    }

    /// Returns `true` if the field changed.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    /// Returns the field change of a replaced field.
    #[must_use]
    pub fn field(&self, field: &str) -> Option<&FieldChange> {
        match self.get(field) {
            Some(Change::Field(change)) => Some(change),
            _ => None,
        }
    }

    /// Returns the nested change set of an embedded field.
    #[must_use]
    pub fn embedded(&self, field: &str) -> Option<&ChangeSet> {
        match self.get(field) {
            Some(Change::Embedded(nested)) => Some(nested),
            _ => None,
        }
    }

    /// Returns the collection change of a collection field.
    #[must_use]
    pub fn collection(&self, field: &str) -> Option<&CollectionChangeSet> {
        match self.get(field) {
            Some(Change::Collection(change)) => Some(change),
            _ => None,
        }
    }

    /// Iterates changes in mapping order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Change)> {
        self.changes.iter().map(|(k, c)| (k.as_str(), c))
    }

    /// Iterates changed field names.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|(k, _)| k.as_str())
    }

    /// Records a change, replacing any earlier change of the same field.
    pub fn insert(&mut self, field: impl Into<String>, change: Change) {
        let field = field.into();
        match self.changes.iter_mut().find(|(k, _)| *k == field) {
            Some((_, slot)) => *slot = change,
            None => self.changes.push((field, change)),
        }
    }

    /// Removes a field's change.
    pub fn remove(&mut self, field: &str) -> Option<Change> {
        let pos = self.changes.iter().position(|(k, _)| k == field)?;
        Some(self.changes.remove(pos).1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmap_codec::Value;

    #[test]
    fn change_set_accessors() {
        let mut cs = ChangeSet::new();
        assert!(cs.is_empty());
        cs.insert(
            "name",
            Change::Field(FieldChange::new(
                Some(FieldValue::from("x")),
                FieldValue::from("y"),
            )),
        );
        cs.insert("tags", Change::Collection(CollectionChangeSet::default()));
        assert_eq!(cs.len(), 2);
        assert_eq!(
            cs.field("name").unwrap().new,
            FieldValue::Scalar(Value::from("y"))
        );
        assert!(cs.collection("tags").is_some());
        assert!(cs.embedded("name").is_none());
        assert_eq!(cs.fields().collect::<Vec<_>>(), vec!["name", "tags"]);

        cs.insert("name", Change::Embedded(ChangeSet::new()));
        assert_eq!(cs.len(), 2);
        assert!(cs.remove("name").is_some());
        assert!(!cs.contains("name"));
    }

    #[test]
    fn collection_change_emptiness() {
        let mut c = CollectionChangeSet::default();
        assert!(c.is_empty() && c.is_update_only());
        c.reordered = true;
        assert!(!c.is_empty() && !c.is_update_only());
    }
}
