//! Cache Reclamation
//!
//! Memo entries live as long as something can still reach them. Ownership
//! is rooted only at externally held [`NodeHandle`]s (tracked weakly by
//! the engine) and at live nodes referencing a node as an input; the
//! reverse-dependency index holds plain ids and never pins anything.
//!
//! [`Engine::reclaim`] is an explicit mark-and-sweep over that root set:
//!
//! - **Mark**: start from every upgradeable handle plus every key with a
//!   pending or in-flight evaluation, and follow input edges (a live node
//!   keeps its inputs alive).
//! - **Sweep**: drop unmarked nodes from every table — arena, memo table,
//!   constant intern table, bindings, result cache, reverse index, error
//!   intent, scope-affinity memo.
//!
//! The pass is driven by the embedder (periodically, or on memory
//! pressure); the engine never collects behind your back.
//!
//! [`NodeHandle`]: crate::graph::node::NodeHandle

use std::collections::HashSet;

use tracing::debug;

use super::{Engine, Slot};
use crate::graph::node::NodeId;

impl Engine {
    /// Run one mark-and-sweep pass and return how many nodes were
    /// evicted.
    pub fn reclaim(&self) -> usize {
        // Prune dead weak handles first; survivors are the external roots.
        self.handles.retain(|_, weak| weak.strong_count() > 0);

        let mut roots: Vec<NodeId> = self.handles.iter().map(|entry| *entry.key()).collect();
        for entry in self.results.iter() {
            if matches!(entry.value(), Slot::Pending { .. }) {
                roots.push(entry.key().0);
            }
        }
        for entry in self.inflight.iter() {
            roots.push(entry.key().0);
        }

        // Mark: forward edges only. Reverse edges are non-owning by
        // design, so a dependent cannot keep its dead inputs' dependents
        // alive.
        let mut marked = HashSet::new();
        let mut stack = roots;
        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(data) = self.node_data(id) {
                stack.extend(data.inputs.iter().copied());
            }
        }

        // Sweep.
        let dead: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|entry| *entry.key())
            .filter(|id| !marked.contains(id))
            .collect();

        for &id in &dead {
            if let Some((_, data)) = self.nodes.remove(&id) {
                self.dependents.remove(id, &data.inputs);
            }
            self.bindings.remove(&id);
            self.error_intent.remove(&id);
            self.handles.remove(&id);
        }
        self.memo.retain(|_, id| marked.contains(id));
        self.consts.retain(|_, id| marked.contains(id));
        self.results.retain(|(id, _), _| marked.contains(id));
        self.affinity.retain(|(id, _), _| marked.contains(id));

        debug!(
            evicted = dead.len(),
            live = marked.len(),
            "reclamation pass"
        );
        dead.len()
    }
}
