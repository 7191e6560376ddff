//! Property-based test generators using proptest.
//!
//! Provides strategies for generating field values, acyclic class
//! dependency graphs and collection edits.

use docmap_codec::Value;
use docmap_core::{Collection, DocumentRef};
use proptest::prelude::*;

/// Strategy for short lowercase names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex")
}

/// Strategy for scalar field values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        name_strategy().prop_map(Value::Text),
    ]
}

/// Strategy for a set of scalar field assignments, keyed by field name.
pub fn user_fields_strategy() -> impl Strategy<Value = Vec<(&'static str, Value)>> {
    (
        name_strategy().prop_map(Value::Text),
        scalar_strategy(),
    )
        .prop_map(|(name, email)| vec![("name", name), ("email", email)])
}

/// Strategy for an acyclic dependency graph over `0..nodes`.
///
/// Returns a hidden topological order and edges `(before, after)` that
/// respect it.
pub fn dag_strategy(nodes: usize) -> impl Strategy<Value = (Vec<usize>, Vec<(usize, usize)>)> {
    let order = Just((0..nodes).collect::<Vec<_>>()).prop_shuffle();
    let pairs = prop::collection::vec((0..nodes, 0..nodes), 0..nodes * 2);
    (order, pairs).prop_map(|(order, pairs)| {
        let edges = pairs
            .into_iter()
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (order[a.min(b)], order[a.max(b)]))
            .collect();
        (order, edges)
    })
}

/// One in-place edit of a collection.
#[derive(Debug, Clone)]
pub enum CollectionEdit {
    /// Append a new element.
    Push(String),
    /// Remove the element at `index % len`.
    Remove(usize),
    /// Swap two elements, indexes taken modulo the length.
    Swap(usize, usize),
    /// Append the element at `index % len` again.
    Duplicate(usize),
}

impl CollectionEdit {
    /// Applies the edit, creating elements with `make`.
    pub fn apply(&self, collection: &Collection, make: impl Fn(&str) -> DocumentRef) {
        let len = collection.len();
        match self {
            Self::Push(label) => collection.push(make(label)),
            Self::Remove(index) if len > 0 => {
                collection.remove(index % len);
            }
            Self::Swap(a, b) if len > 0 => collection.swap(a % len, b % len),
            Self::Duplicate(index) if len > 0 => {
                if let Some(link) = collection.get(index % len) {
                    collection.push(link);
                }
            }
            _ => {}
        }
    }
}

/// Strategy for a sequence of collection edits.
pub fn collection_edits_strategy() -> impl Strategy<Value = Vec<CollectionEdit>> {
    prop::collection::vec(
        prop_oneof![
            name_strategy().prop_map(CollectionEdit::Push),
            any::<usize>().prop_map(CollectionEdit::Remove),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| CollectionEdit::Swap(a, b)),
        ],
        0..8,
    )
}

/// Strategy for edits of a reference collection.
///
/// Unlike [`collection_edits_strategy`] this also repeats existing
/// elements, which only reference collections may do.
pub fn reference_edits_strategy() -> impl Strategy<Value = Vec<CollectionEdit>> {
    prop::collection::vec(
        prop_oneof![
            name_strategy().prop_map(CollectionEdit::Push),
            any::<usize>().prop_map(CollectionEdit::Remove),
            (any::<usize>(), any::<usize>()).prop_map(|(a, b)| CollectionEdit::Swap(a, b)),
            any::<usize>().prop_map(CollectionEdit::Duplicate),
        ],
        0..8,
    )
}

/// Configuration for property-based tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
