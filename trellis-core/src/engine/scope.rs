//! Binding Scopes
//!
//! A scope is an immutable overlay of terminal overrides, used for
//! what-if/scenario evaluation without mutating the base graph. Scopes
//! nest: deriving a scope from a parent layers a new override set on top,
//! and lookup walks the chain innermost-first.
//!
//! # Scope identity and caching
//!
//! Each derived scope gets a unique [`ScopeId`]; the base scope is always
//! id 0. A node's cached results are namespaced by its *effective* scope —
//! the innermost scope in the lineage whose overrides actually reach one
//! of the node's transitive terminals (computed by the engine). Nodes
//! untouched by any override in the lineage resolve to the base namespace,
//! which is what lets scenario runs share the bulk of the base cache.
//!
//! Scopes are cheap to clone (an `Arc` bump) and never mutated after
//! creation, so evaluating under one scope can never corrupt results
//! visible under another.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::graph::node::NodeId;
use crate::value::Value;

/// Unique identifier for a binding scope. Id 0 is the base scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u64);

impl ScopeId {
    /// The base (empty) scope's id.
    pub const BASE: ScopeId = ScopeId(0);

    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Whether this is the base scope id.
    pub fn is_base(&self) -> bool {
        *self == Self::BASE
    }
}

/// What a terminal is overridden with inside a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// Substitute a fixed value for the terminal.
    Value(Value),

    /// Substitute another node; forcing the terminal forces that node
    /// under the same scope.
    Node(NodeId),
}

struct ScopeInner {
    id: ScopeId,
    parent: Option<Scope>,
    /// Ordered so that scenario definitions round-trip deterministically.
    overrides: IndexMap<NodeId, Binding>,
}

/// An immutable overlay of terminal overrides.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    /// The base scope: no overrides, id 0.
    pub fn base() -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::BASE,
                parent: None,
                overrides: IndexMap::new(),
            }),
        }
    }

    /// Derive a child scope. Validation of the override keys is the
    /// engine's job ([`crate::engine::Engine::with_overrides`]).
    pub(crate) fn derive(parent: &Scope, overrides: IndexMap<NodeId, Binding>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                id: ScopeId::next(),
                parent: Some(parent.clone()),
                overrides,
            }),
        }
    }

    /// This scope's id.
    pub fn id(&self) -> ScopeId {
        self.inner.id
    }

    /// Whether this is the base scope.
    pub fn is_base(&self) -> bool {
        self.inner.id.is_base()
    }

    /// The parent scope, if any.
    pub fn parent(&self) -> Option<Scope> {
        self.inner.parent.clone()
    }

    /// The overrides introduced at this level (not the whole lineage).
    pub(crate) fn overrides(&self) -> &IndexMap<NodeId, Binding> {
        &self.inner.overrides
    }

    /// Resolve the innermost override for a terminal, walking the chain.
    pub fn lookup(&self, terminal: NodeId) -> Option<Binding> {
        let mut current = self;
        loop {
            if let Some(binding) = current.inner.overrides.get(&terminal) {
                return Some(binding.clone());
            }
            match &current.inner.parent {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Number of scopes in the lineage, the base scope counting as 1.
    pub fn depth(&self) -> usize {
        match &self.inner.parent {
            Some(parent) => parent.depth() + 1,
            None => 1,
        }
    }
}

impl PartialEq for Scope {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Scope {}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.inner.id)
            .field("depth", &self.depth())
            .field("overrides", &self.inner.overrides.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: Vec<(NodeId, Binding)>) -> IndexMap<NodeId, Binding> {
        pairs.into_iter().collect()
    }

    #[test]
    fn base_scope_has_reserved_id() {
        assert!(Scope::base().is_base());
        assert_eq!(Scope::base().id(), ScopeId::BASE);
    }

    #[test]
    fn derived_scopes_get_fresh_ids() {
        let base = Scope::base();
        let a = Scope::derive(&base, IndexMap::new());
        let b = Scope::derive(&base, IndexMap::new());
        assert_ne!(a.id(), b.id());
        assert!(!a.is_base());
    }

    #[test]
    fn lookup_walks_the_chain_innermost_first() {
        let t1 = NodeId::new();
        let t2 = NodeId::new();

        let base = Scope::base();
        let outer = Scope::derive(
            &base,
            overrides(vec![
                (t1, Binding::Value(Value::Int(1))),
                (t2, Binding::Value(Value::Int(2))),
            ]),
        );
        let inner = Scope::derive(&outer, overrides(vec![(t1, Binding::Value(Value::Int(10)))]));

        // Inner override shadows the outer one.
        assert_eq!(inner.lookup(t1), Some(Binding::Value(Value::Int(10))));
        // Unshadowed key falls through to the parent.
        assert_eq!(inner.lookup(t2), Some(Binding::Value(Value::Int(2))));
        // The outer scope is unaffected by the derivation.
        assert_eq!(outer.lookup(t1), Some(Binding::Value(Value::Int(1))));
        // Base has no overrides at all.
        assert_eq!(base.lookup(t1), None);
    }

    #[test]
    fn depth_counts_the_lineage() {
        let base = Scope::base();
        let child = Scope::derive(&base, IndexMap::new());
        let grandchild = Scope::derive(&child, IndexMap::new());
        assert_eq!(base.depth(), 1);
        assert_eq!(grandchild.depth(), 3);
    }
}
