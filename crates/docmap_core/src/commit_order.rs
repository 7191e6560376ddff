//! Commit ordering of classes.
//!
//! A depth-first topological sort over a dependency graph of classes.
//! `add_dependency(a, b)` means documents of `a` must be written before
//! documents of `b` (e.g. `a` is the target of a reference held by `b`).
//!
//! # Cycles
//!
//! Self references and mutually referencing classes are common. An edge
//! that closes a cycle is ignored, so the calculator always returns an
//! order; within a cycle the order follows insertion order.
//!
//! # Determinism
//!
//! Nodes and edges are kept in insertion order, so the same inputs always
//! produce the same output.

use std::collections::HashMap;
use std::hash::Hash;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    NotVisited,
    InProgress,
    Visited,
}

#[derive(Debug)]
struct Node<T> {
    value: T,
    edges: Vec<usize>,
}

/// Computes a write order over a set of types.
///
/// # Example
///
/// ```rust
/// use docmap_core::CommitOrderCalculator;
///
/// let mut calc = CommitOrderCalculator::new();
/// for t in 1..=5 {
///     calc.add_type(t);
/// }
/// calc.add_dependency(1, 2);
/// calc.add_dependency(2, 3);
/// calc.add_dependency(3, 4);
/// calc.add_dependency(5, 1);
/// assert_eq!(calc.commit_order(), vec![5, 1, 2, 3, 4]);
/// ```
#[derive(Debug)]
pub struct CommitOrderCalculator<T> {
    nodes: Vec<Node<T>>,
    index: HashMap<T, usize>,
}

impl<T> Default for CommitOrderCalculator<T> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T: Clone + Eq + Hash + std::fmt::Debug> CommitOrderCalculator<T> {
    /// Creates an empty calculator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a type. Adding a known type again has no effect.
    pub fn add_type(&mut self, value: T) {
        self.node(value);
    }

    /// Returns `true` if the type is known.
    #[must_use]
    pub fn has_type(&self, value: &T) -> bool {
        self.index.contains_key(value)
    }

    /// Records that `from` must be committed before `to`.
    ///
    /// Unknown types are added.
    pub fn add_dependency(&mut self, from: T, to: T) {
        let from = self.node(from);
        let to = self.node(to);
        if !self.nodes[from].edges.contains(&to) {
            self.nodes[from].edges.push(to);
        }
    }

    /// Returns the number of types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns `true` if no types were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns every type, dependencies first.
    #[must_use]
    pub fn commit_order(&self) -> Vec<T> {
        let mut marks = vec![Mark::NotVisited; self.nodes.len()];
        let mut sorted = Vec::with_capacity(self.nodes.len());
        for start in 0..self.nodes.len() {
            if marks[start] == Mark::NotVisited {
                self.visit(start, &mut marks, &mut sorted);
            }
        }
        sorted.reverse();
        sorted.into_iter().map(|i| self.nodes[i].value.clone()).collect()
    }

    fn visit(&self, node: usize, marks: &mut [Mark], sorted: &mut Vec<usize>) {
        marks[node] = Mark::InProgress;
        for &next in &self.nodes[node].edges {
            match marks[next] {
                Mark::NotVisited => self.visit(next, marks, sorted),
                Mark::InProgress => trace!(
                    from = ?self.nodes[node].value,
                    to = ?self.nodes[next].value,
                    "ignoring cyclic commit dependency"
                ),
                Mark::Visited => {}
            }
        }
        marks[node] = Mark::Visited;
        sorted.push(node);
    }

    fn node(&mut self, value: T) -> usize {
        if let Some(&i) = self.index.get(&value) {
            return i;
        }
        let i = self.nodes.len();
        self.index.insert(value.clone(), i);
        self.nodes.push(Node {
            value,
            edges: Vec::new(),
        });
        i
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn chain_with_late_head() {
        let mut calc = CommitOrderCalculator::new();
        for t in 1..=5 {
            calc.add_type(t);
        }
        calc.add_dependency(1, 2);
        calc.add_dependency(2, 3);
        calc.add_dependency(3, 4);
        calc.add_dependency(5, 1);
        assert_eq!(calc.commit_order(), vec![5, 1, 2, 3, 4]);
    }

    #[test]
    fn single_type() {
        let mut calc = CommitOrderCalculator::new();
        calc.add_type("User");
        assert_eq!(calc.commit_order(), vec!["User"]);
        assert!(calc.has_type(&"User"));
        assert!(!calc.has_type(&"Group"));
    }

    #[test]
    fn empty() {
        let calc: CommitOrderCalculator<&str> = CommitOrderCalculator::new();
        assert!(calc.is_empty());
        assert!(calc.commit_order().is_empty());
    }

    #[test]
    fn duplicate_types_and_edges_are_ignored() {
        let mut calc = CommitOrderCalculator::new();
        calc.add_type("a");
        calc.add_type("a");
        calc.add_dependency("a", "b");
        calc.add_dependency("a", "b");
        assert_eq!(calc.len(), 2);
        assert_eq!(calc.commit_order(), vec!["a", "b"]);
    }

    #[test]
    fn self_reference_does_not_loop() {
        let mut calc = CommitOrderCalculator::new();
        calc.add_dependency("Category", "Category");
        assert_eq!(calc.commit_order(), vec!["Category"]);
    }

    #[test]
    fn cycle_still_yields_every_type() {
        let mut calc = CommitOrderCalculator::new();
        calc.add_dependency("a", "b");
        calc.add_dependency("b", "c");
        calc.add_dependency("c", "a");
        calc.add_dependency("d", "a");
        let order = calc.commit_order();
        assert_eq!(order.len(), 4);
        let pos = |x| order.iter().position(|y| *y == x).unwrap();
        assert!(pos("d") < pos("a"));
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn order_is_stable() {
        let build = || {
            let mut calc = CommitOrderCalculator::new();
            for t in ["x", "y", "z", "w"] {
                calc.add_type(t);
            }
            calc.add_dependency("z", "x");
            calc.add_dependency("w", "y");
            calc
        };
        let first = build().commit_order();
        for _ in 0..10 {
            assert_eq!(build().commit_order(), first);
        }
        let calc = build();
        assert_eq!(calc.commit_order(), calc.commit_order());
    }

    proptest! {
        #[test]
        fn acyclic_edges_are_respected(
            n in 1usize..12,
            raw_edges in prop::collection::vec((0usize..12, 0usize..12), 0..30),
        ) {
            let mut calc = CommitOrderCalculator::new();
            for t in 0..n {
                calc.add_type(t);
            }
            // Only forward edges, so the graph is acyclic.
            let edges: Vec<(usize, usize)> = raw_edges
                .into_iter()
                .filter(|&(a, b)| a < b && b < n)
                .collect();
            for &(a, b) in &edges {
                calc.add_dependency(a, b);
            }

            let order = calc.commit_order();
            prop_assert_eq!(order.len(), n);
            let pos: HashMap<usize, usize> =
                order.iter().enumerate().map(|(i, t)| (*t, i)).collect();
            for (a, b) in edges {
                prop_assert!(pos[&a] < pos[&b]);
            }
        }
    }
}
