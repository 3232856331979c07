//! Reverse-Dependency Index
//!
//! Forward edges (a computation's inputs) are owned by the node structure
//! itself. The reverse direction — "who depends on me" — is a derived
//! index maintained here, so that rebinding a terminal can find every
//! downstream node to invalidate.
//!
//! The index stores plain [`NodeId`]s, not references: it never keeps an
//! otherwise-dead node alive, which is what lets the cache reclaimer evict
//! a subgraph even while the index still mentions it. Entries for evicted
//! nodes are swept together with the nodes.

use std::collections::{HashSet, VecDeque};

use dashmap::DashMap;

use super::node::NodeId;

/// Derived index of reverse dependency edges.
#[derive(Debug, Default)]
pub struct DependentIndex {
    /// For each node, the set of nodes that use it as an input.
    edges: DashMap<NodeId, HashSet<NodeId>>,
}

impl DependentIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` depends on each of `inputs`.
    pub fn register(&self, node: NodeId, inputs: &[NodeId]) {
        for input in inputs {
            self.edges.entry(*input).or_default().insert(node);
        }
    }

    /// Direct dependents of a node.
    pub fn dependents_of(&self, id: NodeId) -> HashSet<NodeId> {
        self.edges.get(&id).map(|s| s.clone()).unwrap_or_default()
    }

    /// All nodes transitively downstream of `root`, including `root`.
    ///
    /// This is the set that must be marked dirty when `root` is rebound.
    pub fn dirty_closure(&self, root: NodeId) -> HashSet<NodeId> {
        let mut closure = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(root);

        while let Some(id) = queue.pop_front() {
            if !closure.insert(id) {
                continue;
            }
            if let Some(dependents) = self.edges.get(&id) {
                for dependent in dependents.iter() {
                    queue.push_back(*dependent);
                }
            }
        }

        closure
    }

    /// Drop a node from the index: its own entry and its membership in the
    /// dependent sets of each of its inputs.
    pub fn remove(&self, node: NodeId, inputs: &[NodeId]) {
        self.edges.remove(&node);
        for input in inputs {
            if let Some(mut set) = self.edges.get_mut(input) {
                set.remove(&node);
            }
        }
    }

    /// Number of nodes with at least one recorded dependent.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_reverse_edges() {
        let index = DependentIndex::new();
        let a = NodeId::new();
        let b = NodeId::new();
        let sum = NodeId::new();

        index.register(sum, &[a, b]);

        assert!(index.dependents_of(a).contains(&sum));
        assert!(index.dependents_of(b).contains(&sum));
        assert!(index.dependents_of(sum).is_empty());
    }

    #[test]
    fn dirty_closure_walks_transitively() {
        let index = DependentIndex::new();
        let source = NodeId::new();
        let mid = NodeId::new();
        let leaf = NodeId::new();
        let unrelated = NodeId::new();

        index.register(mid, &[source]);
        index.register(leaf, &[mid]);

        let closure = index.dirty_closure(source);
        assert!(closure.contains(&source));
        assert!(closure.contains(&mid));
        assert!(closure.contains(&leaf));
        assert!(!closure.contains(&unrelated));
    }

    #[test]
    fn dirty_closure_handles_diamonds() {
        let index = DependentIndex::new();
        let source = NodeId::new();
        let left = NodeId::new();
        let right = NodeId::new();
        let join = NodeId::new();

        index.register(left, &[source]);
        index.register(right, &[source]);
        index.register(join, &[left, right]);

        let closure = index.dirty_closure(source);
        assert_eq!(closure.len(), 4);
    }

    #[test]
    fn remove_clears_both_directions() {
        let index = DependentIndex::new();
        let a = NodeId::new();
        let sum = NodeId::new();

        index.register(sum, &[a]);
        assert!(index.dependents_of(a).contains(&sum));

        index.remove(sum, &[a]);
        assert!(index.dependents_of(a).is_empty());
    }
}
