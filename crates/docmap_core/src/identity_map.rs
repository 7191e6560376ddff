//! Identity map: at most one instance per (root class, id).

use crate::document::DocumentRef;
use crate::error::{CoreError, CoreResult};
use crate::types::Oid;
use docmap_codec::{to_canonical_cbor, Value};
use std::collections::HashMap;

/// Registry of managed instances by identity.
///
/// Keys are the root class of the inheritance hierarchy and the canonical
/// binary encoding of the id, so ids compare strictly by type (`1` and
/// `"1"` are different identities). Lookups are O(1).
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<String, HashMap<Vec<u8>, DocumentRef>>,
    keys: HashMap<Oid, (String, Vec<u8>)>,
}

impl IdentityMap {
    /// Creates an empty identity map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `document` under `(root, id)`.
    ///
    /// Returns `true` if newly registered and `false` if this same instance
    /// was already registered under that identity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IdentityConflict`] if a different instance holds
    /// the identity, or if `document` is registered under another identity.
    pub fn register(&mut self, root: &str, id: &Value, document: &DocumentRef) -> CoreResult<bool> {
        let key = to_canonical_cbor(id)?;
        if let Some((existing_root, existing_key)) = self.keys.get(&document.oid()) {
            if existing_root == root && *existing_key == key {
                return Ok(false);
            }
            return Err(CoreError::invalid_operation(format!(
                "document is already registered under another identity than {id}"
            )));
        }

        let by_id = self.entries.entry(root.to_string()).or_default();
        if by_id.contains_key(&key) {
            return Err(CoreError::IdentityConflict {
                class: root.to_string(),
                id: id.to_string(),
            });
        }
        by_id.insert(key.clone(), document.clone());
        self.keys.insert(document.oid(), (root.to_string(), key));
        Ok(true)
    }

    /// Looks up the instance registered under `(root, id)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id cannot be encoded.
    pub fn get(&self, root: &str, id: &Value) -> CoreResult<Option<DocumentRef>> {
        let key = to_canonical_cbor(id)?;
        Ok(self
            .entries
            .get(root)
            .and_then(|by_id| by_id.get(&key))
            .cloned())
    }

    /// Returns `true` if this instance is registered.
    #[must_use]
    pub fn contains(&self, document: &DocumentRef) -> bool {
        self.keys.contains_key(&document.oid())
    }

    /// Removes this instance. Returns `true` if it was registered.
    pub fn remove(&mut self, document: &DocumentRef) -> bool {
        let Some((root, key)) = self.keys.remove(&document.oid()) else {
            return false;
        };
        if let Some(by_id) = self.entries.get_mut(&root) {
            by_id.remove(&key);
            if by_id.is_empty() {
                self.entries.remove(&root);
            }
        }
        true
    }

    /// Removes everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.keys.clear();
    }

    /// Returns the number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn register_and_lookup() {
        let mut map = IdentityMap::new();
        let doc = DocumentRef::new("User");
        assert!(map.register("User", &Value::Integer(1), &doc).unwrap());
        assert!(map.contains(&doc));
        assert!(map
            .get("User", &Value::Integer(1))
            .unwrap()
            .unwrap()
            .ptr_eq(&doc));
        assert!(map.get("User", &Value::from("1")).unwrap().is_none());
        assert!(map.get("Group", &Value::Integer(1)).unwrap().is_none());
    }

    #[test]
    fn same_instance_twice_is_noop() {
        let mut map = IdentityMap::new();
        let doc = DocumentRef::new("User");
        map.register("User", &Value::Integer(1), &doc).unwrap();
        assert!(!map.register("User", &Value::Integer(1), &doc).unwrap());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn second_instance_conflicts() {
        let mut map = IdentityMap::new();
        map.register("User", &Value::Integer(1), &DocumentRef::new("User"))
            .unwrap();
        let err = map
            .register("User", &Value::Integer(1), &DocumentRef::new("User"))
            .unwrap_err();
        assert!(matches!(err, CoreError::IdentityConflict { .. }));
    }

    #[test]
    fn instance_cannot_change_identity() {
        let mut map = IdentityMap::new();
        let doc = DocumentRef::new("User");
        map.register("User", &Value::Integer(1), &doc).unwrap();
        assert!(map.register("User", &Value::Integer(2), &doc).is_err());
    }

    #[test]
    fn remove_frees_identity() {
        let mut map = IdentityMap::new();
        let a = DocumentRef::new("User");
        map.register("User", &Value::Integer(1), &a).unwrap();
        assert!(map.remove(&a));
        assert!(!map.remove(&a));
        assert!(map.is_empty());

        let b = DocumentRef::new("User");
        assert!(map.register("User", &Value::Integer(1), &b).unwrap());
    }

    #[test]
    fn clear_empties() {
        let mut map = IdentityMap::new();
        map.register("A", &Value::Integer(1), &DocumentRef::new("A")).unwrap();
        map.register("B", &Value::Integer(1), &DocumentRef::new("B")).unwrap();
        assert_eq!(map.len(), 2);
        map.clear();
        assert!(map.is_empty());
    }

    proptest! {
        #[test]
        fn at_most_one_instance_per_identity(ids in prop::collection::vec(0i64..8, 1..40)) {
            let mut map = IdentityMap::new();
            let mut winners: HashMap<i64, DocumentRef> = HashMap::new();
            for id in ids {
                let doc = DocumentRef::new("User");
                let result = map.register("User", &Value::Integer(id), &doc);
                if let Some(existing) = winners.get(&id) {
                    prop_assert!(result.is_err());
                    let found = map.get("User", &Value::Integer(id)).unwrap().unwrap();
                    prop_assert!(found.ptr_eq(existing));
                } else {
                    prop_assert!(result.unwrap());
                    winners.insert(id, doc);
                }
            }
            prop_assert_eq!(map.len(), winners.len());
        }
    }
}
