//! Computation Engine
//!
//! The engine is the central coordinator: it owns the node arena, the memo
//! table that deduplicates structurally identical computations, the
//! per-scope result cache, the reverse-dependency index used for
//! invalidation, and the weak handle registry that defines reachability
//! roots for reclamation.
//!
//! # How It Works
//!
//! 1. An external front end constructs nodes: terminals for inputs,
//!    computations for derived values. `make_computation` is memoizing —
//!    the same function applied to the same ordered inputs yields the
//!    same node.
//!
//! 2. `force` pulls a node's value: dependencies are evaluated
//!    depth-first, each node at most once per (node, scope lineage), and
//!    outcomes (successes *and* failures) are cached.
//!
//! 3. `rebind` mutates a root terminal and lazily invalidates the dirty
//!    closure; the next `force` recomputes exactly the downstream portion.
//!
//! 4. `with_overrides` layers scenario substitutions over a base scope
//!    without touching it; unaffected subgraphs keep hitting the base
//!    cache.
//!
//! # Thread Safety
//!
//! All shared tables are concurrent maps; the result cache uses a
//! `Pending` slot plus a condvar so concurrent forces of the same key
//! coalesce instead of double-computing. The async layer
//! ([`Engine::force_async`]) adds per-key in-flight futures on top.

mod eval;
mod future;
mod reclaim;
pub mod scope;

pub use scope::{Binding, Scope, ScopeId};

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{EvalError, GraphError};
use crate::graph::depend::DependentIndex;
use crate::graph::node::{Function, HandleInner, NodeData, NodeHandle, NodeId, NodeKey, NodeKind};
use crate::value::Value;

pub(crate) use future::SharedEval;

/// Results are namespaced per (node, effective scope).
pub(crate) type CacheKey = (NodeId, ScopeId);

/// State of a result-cache entry.
///
/// Absence of an entry is the `Unevaluated` state; `Pending` marks an
/// evaluation in flight (and doubles as the coalescing point for
/// concurrent synchronous forces); `Ready` holds the cached outcome,
/// failure or success alike.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    /// An evaluation owns this slot. `discard` is set by a rebind that
    /// lands while the evaluation is in flight: the outcome was computed
    /// against the old binding and must not be published.
    Pending { discard: bool },
    Ready(Result<Value, EvalError>),
}

/// Outcome of trying to claim a cache slot for evaluation.
pub(crate) enum Claim {
    /// Another evaluation already produced (or will produce) the result.
    Ready(Result<Value, EvalError>),
    /// The caller owns the slot and must evaluate and [`Engine::complete`].
    Claimed,
}

/// Outcome of a non-blocking claim ([`Engine::try_claim_slot`]).
pub(crate) enum TryClaim {
    Ready(Result<Value, EvalError>),
    Claimed,
    /// Another evaluation owns the slot; the caller must back off and
    /// retry without parking its thread.
    Busy,
}

/// The demand-driven, memoizing computation engine.
pub struct Engine {
    /// Node arena: all structural data, terminal and computation alike.
    pub(crate) nodes: DashMap<NodeId, Arc<NodeData>>,

    /// Memo table: (function, ordered inputs) -> existing node.
    pub(crate) memo: DashMap<NodeKey, NodeId>,

    /// Content-keyed intern table for constant terminals.
    pub(crate) consts: DashMap<Value, NodeId>,

    /// Current bound value of each bound terminal.
    pub(crate) bindings: DashMap<NodeId, Value>,

    /// Per-(node, effective scope) cached outcomes.
    pub(crate) results: DashMap<CacheKey, Slot>,

    /// In-flight async evaluations, for concurrent-force coalescing.
    pub(crate) inflight: DashMap<CacheKey, SharedEval>,

    /// Reverse-dependency index (non-owning), for invalidation.
    pub(crate) dependents: DependentIndex,

    /// Input positions each node has declared error intent for.
    pub(crate) error_intent: DashMap<NodeId, SmallVec<[usize; 4]>>,

    /// Memoized effective-scope resolution per (node, scope).
    pub(crate) affinity: DashMap<(NodeId, ScopeId), ScopeId>,

    /// Weak registry of externally held handles; upgradeable entries are
    /// the reachability roots for the cache reclaimer.
    pub(crate) handles: DashMap<NodeId, Weak<HandleInner>>,

    /// Condvar protocol for `Pending` slot waiters.
    pub(crate) pending_lock: Mutex<()>,
    pub(crate) pending_cv: Condvar,
}

impl Engine {
    /// Create an empty engine.
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            memo: DashMap::new(),
            consts: DashMap::new(),
            bindings: DashMap::new(),
            results: DashMap::new(),
            inflight: DashMap::new(),
            dependents: DependentIndex::new(),
            error_intent: DashMap::new(),
            affinity: DashMap::new(),
            handles: DashMap::new(),
            pending_lock: Mutex::new(()),
            pending_cv: Condvar::new(),
        }
    }

    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// Create a mutable root terminal bound to `value`.
    pub fn make_terminal(&self, value: Value) -> NodeHandle {
        let data = NodeData::terminal(false);
        let id = data.id;
        self.nodes.insert(id, Arc::new(data));
        self.bindings.insert(id, value);
        debug!(node = id.raw(), "created terminal");
        self.handle_for(id)
    }

    /// Create a mutable root terminal with no value yet. Forcing it (or
    /// anything downstream) before `bind` fails with
    /// [`EvalError::UnboundInput`].
    pub fn make_unbound_terminal(&self) -> NodeHandle {
        let data = NodeData::terminal(false);
        let id = data.id;
        self.nodes.insert(id, Arc::new(data));
        debug!(node = id.raw(), "created unbound terminal");
        self.handle_for(id)
    }

    /// Create (or reuse) a content-interned constant terminal.
    ///
    /// Equal values map to the same node, so structurally identical
    /// subgraphs built over the same constants collapse in the memo table.
    /// Constants cannot be rebound.
    pub fn constant(&self, value: Value) -> NodeHandle {
        if let Some(existing) = self.consts.get(&value) {
            return self.handle_for(*existing);
        }
        let id = *self.consts.entry(value.clone()).or_insert_with(|| {
            let data = NodeData::terminal(true);
            let id = data.id;
            self.nodes.insert(id, Arc::new(data));
            self.bindings.insert(id, value.clone());
            debug!(node = id.raw(), "interned constant");
            id
        });
        self.handle_for(id)
    }

    /// Create (or reuse) a computation node applying `function` to the
    /// ordered `inputs`.
    ///
    /// Deduplicates through the memo table: an existing node for the same
    /// (function, ordered inputs) key is returned unchanged, with no
    /// re-invocation of anything. A fresh node starts unevaluated and is
    /// registered as a dependent of each input.
    pub fn make_computation(&self, function: &Function, inputs: &[NodeHandle]) -> NodeHandle {
        let ids: SmallVec<[NodeId; 4]> = inputs.iter().map(|h| h.id()).collect();
        let key = NodeKey::new(function.id(), ids.clone());

        if let Some(existing) = self.memo.get(&key) {
            return self.handle_for(*existing);
        }
        let id = *self.memo.entry(key).or_insert_with(|| {
            let data = NodeData::computation(function.clone(), ids.clone());
            let id = data.id;
            self.nodes.insert(id, Arc::new(data));
            self.dependents.register(id, &ids);
            debug!(
                node = id.raw(),
                function = function.name(),
                arity = ids.len(),
                "created computation"
            );
            id
        });
        self.handle_for(id)
    }

    // ------------------------------------------------------------------
    // Binding & invalidation
    // ------------------------------------------------------------------

    /// Bind a value to a terminal that has never been bound, as created by
    /// [`Engine::make_unbound_terminal`]. Initial population invalidates
    /// nothing; replacing a live binding must go through
    /// [`Engine::rebind`] so dependents are dirtied, and a `bind` on an
    /// already-bound terminal is rejected.
    pub fn bind(&self, terminal: &NodeHandle, value: Value) -> Result<(), GraphError> {
        use dashmap::mapref::entry::Entry;
        self.check_mutable_terminal(terminal.id())?;
        match self.bindings.entry(terminal.id()) {
            Entry::Occupied(_) => Err(GraphError::AlreadyBound {
                node: terminal.id(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Rebind a mutable root terminal and lazily invalidate its dirty
    /// closure.
    ///
    /// Every node transitively downstream of the terminal drops back to
    /// unevaluated (in every scope namespace — a scoped result may depend
    /// on this terminal without overriding it) and recomputes on the next
    /// force. Nodes outside the closure keep their cached results.
    pub fn rebind(&self, terminal: &NodeHandle, value: Value) -> Result<(), GraphError> {
        self.check_mutable_terminal(terminal.id())?;
        self.bindings.insert(terminal.id(), value);

        let dirty = self.dependents.dirty_closure(terminal.id());
        // Ready entries are evicted. A Pending entry belongs to an
        // evaluation that started against the old binding: it stays, marked
        // so its completion publishes nothing (see [`Engine::complete`]).
        self.results.retain(|(node, _), slot| {
            if !dirty.contains(node) {
                return true;
            }
            match slot {
                Slot::Pending { discard } => {
                    *discard = true;
                    true
                }
                Slot::Ready(_) => false,
            }
        });
        debug!(
            terminal = terminal.id().raw(),
            dirtied = dirty.len(),
            "rebind invalidated dependents"
        );
        Ok(())
    }

    fn check_mutable_terminal(&self, id: NodeId) -> Result<(), GraphError> {
        let data = self
            .node_data(id)
            .ok_or(GraphError::UnknownNode { node: id })?;
        match data.kind {
            NodeKind::Terminal { interned: false } => Ok(()),
            NodeKind::Terminal { interned: true } => {
                Err(GraphError::ImmutableTerminal { node: id })
            }
            NodeKind::Computation => Err(GraphError::NotATerminal { node: id }),
        }
    }

    // ------------------------------------------------------------------
    // Scopes
    // ------------------------------------------------------------------

    /// Derive a new immutable scope from `base`, overriding the given
    /// terminals. `base` is not mutated; evaluating under the new scope
    /// reuses base-scope results for every node not downstream of an
    /// overridden terminal.
    pub fn with_overrides(
        &self,
        base: &Scope,
        overrides: impl IntoIterator<Item = (NodeHandle, Binding)>,
    ) -> Result<Scope, GraphError> {
        let mut map = IndexMap::new();
        for (handle, binding) in overrides {
            let id = handle.id();
            let data = self
                .node_data(id)
                .ok_or(GraphError::UnknownNode { node: id })?;
            if !data.is_terminal() {
                return Err(GraphError::NotATerminal { node: id });
            }
            if let Binding::Node(replacement) = binding {
                if self.node_data(replacement).is_none() {
                    return Err(GraphError::UnknownNode { node: replacement });
                }
                // The override makes the terminal dynamically depend on the
                // replacement node. Recording the edge lets a rebind that
                // reaches the replacement dirty everything reading the
                // terminal as well.
                self.dependents.register(id, &[replacement]);
            }
            map.insert(id, binding);
        }
        let scope = Scope::derive(base, map);
        debug!(scope = ?scope.id(), parent = ?base.id(), "derived override scope");
        Ok(scope)
    }

    /// Resolve the scope namespace a node's results are cached under: the
    /// innermost scope in the lineage whose overrides reach one of the
    /// node's terminals, else the base scope.
    ///
    /// The terminal set is first expanded through the lineage's
    /// `Binding::Node` redirections ([`Engine::scoped_terminals`]): a
    /// rerouted terminal drags the replacement node's terminals into the
    /// set, so a scope that only overrides the replacement's inputs still
    /// gets its own namespace.
    ///
    /// Memoized per (node, scope) — node structure and scopes are both
    /// immutable, so the answer never changes.
    pub(crate) fn effective_scope(&self, id: NodeId, scope: &Scope) -> ScopeId {
        if scope.is_base() {
            return ScopeId::BASE;
        }
        let memo_key = (id, scope.id());
        if let Some(hit) = self.affinity.get(&memo_key) {
            return *hit;
        }

        let terminals = self.scoped_terminals(id, scope);
        let mut resolved = ScopeId::BASE;
        let mut current = Some(scope.clone());
        while let Some(s) = current {
            if s.overrides().keys().any(|t| terminals.contains(t)) {
                resolved = s.id();
                break;
            }
            current = s.parent();
        }

        self.affinity.insert(memo_key, resolved);
        resolved
    }

    /// The node's transitive terminals, expanded to a fixpoint through
    /// every `Binding::Node` redirection in the scope lineage.
    fn scoped_terminals(&self, id: NodeId, scope: &Scope) -> HashSet<NodeId> {
        let mut terminals = self.transitive_terminals(id);
        loop {
            let mut added = Vec::new();
            let mut current = Some(scope.clone());
            while let Some(s) = current {
                for (overridden, binding) in s.overrides() {
                    if let Binding::Node(replacement) = binding {
                        if terminals.contains(overridden) {
                            added.extend(
                                self.transitive_terminals(*replacement)
                                    .into_iter()
                                    .filter(|t| !terminals.contains(t)),
                            );
                        }
                    }
                }
                current = s.parent();
            }
            if added.is_empty() {
                break;
            }
            terminals.extend(added);
        }
        terminals
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// The transitive set of terminals feeding a node, for
    /// sensitivity/tweak tooling. A terminal reports itself.
    pub fn discover_inputs(&self, node: &NodeHandle) -> Vec<NodeHandle> {
        let mut terminals: Vec<NodeId> = self.transitive_terminals(node.id()).into_iter().collect();
        terminals.sort();
        terminals.into_iter().map(|id| self.handle_for(id)).collect()
    }

    pub(crate) fn transitive_terminals(&self, id: NodeId) -> HashSet<NodeId> {
        let mut terminals = HashSet::new();
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(data) = self.node_data(current) {
                if data.is_terminal() {
                    terminals.insert(current);
                } else {
                    stack.extend(data.inputs.iter().copied());
                }
            }
        }
        terminals
    }

    /// Opt a computation into receiving error sentinels instead of
    /// short-circuit propagation for the named input positions.
    pub fn declare_error_intent(
        &self,
        node: &NodeHandle,
        positions: &[usize],
    ) -> Result<(), GraphError> {
        let id = node.id();
        let data = self
            .node_data(id)
            .ok_or(GraphError::UnknownNode { node: id })?;
        if data.is_terminal() {
            return Err(GraphError::NotATerminal { node: id });
        }
        let arity = data.inputs.len();
        for &position in positions {
            if position >= arity {
                return Err(GraphError::PositionOutOfRange {
                    node: id,
                    position,
                    arity,
                });
            }
        }
        let mut entry = self.error_intent.entry(id).or_default();
        for &position in positions {
            if !entry.contains(&position) {
                entry.push(position);
            }
        }
        Ok(())
    }

    /// Number of cached result entries (all scope namespaces).
    pub fn entry_count(&self) -> usize {
        self.results.len()
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ------------------------------------------------------------------
    // Internal plumbing shared by the evaluators
    // ------------------------------------------------------------------

    pub(crate) fn node_data(&self, id: NodeId) -> Option<Arc<NodeData>> {
        self.nodes.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub(crate) fn binding_of(&self, id: NodeId) -> Option<Value> {
        self.bindings.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn intent_of(&self, id: NodeId) -> SmallVec<[usize; 4]> {
        self.error_intent
            .get(&id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub(crate) fn cached(&self, key: CacheKey) -> Option<Result<Value, EvalError>> {
        match self.results.get(&key).as_deref() {
            Some(Slot::Ready(outcome)) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Atomically claim the slot for `key`: either the caller becomes the
    /// unique evaluator, or it receives the outcome another evaluation
    /// produced (waiting on the condvar if that evaluation is in flight).
    pub(crate) fn claim_slot(&self, key: CacheKey) -> Claim {
        use dashmap::mapref::entry::Entry;
        loop {
            let existing = match self.results.entry(key) {
                Entry::Occupied(entry) => match entry.get() {
                    Slot::Ready(outcome) => Some(outcome.clone()),
                    Slot::Pending { .. } => None,
                },
                Entry::Vacant(entry) => {
                    entry.insert(Slot::Pending { discard: false });
                    return Claim::Claimed;
                }
            };
            match existing {
                Some(outcome) => return Claim::Ready(outcome),
                None => {
                    // Another evaluation owns the slot; wait for it. The
                    // completer resolves the slot before taking the lock,
                    // so checking under the lock cannot miss the wakeup.
                    let mut guard = self.pending_lock.lock();
                    let still_pending = matches!(
                        self.results.get(&key).as_deref(),
                        Some(Slot::Pending { .. })
                    );
                    if still_pending {
                        self.pending_cv.wait(&mut guard);
                    }
                }
            }
        }
    }

    /// Non-blocking claim for async evaluators: never parks the calling
    /// thread. `Busy` callers yield to their executor and retry, so a
    /// worker is never parked on the condvar while holding poll capacity
    /// other tasks need.
    pub(crate) fn try_claim_slot(&self, key: CacheKey) -> TryClaim {
        use dashmap::mapref::entry::Entry;
        match self.results.entry(key) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(outcome) => TryClaim::Ready(outcome.clone()),
                Slot::Pending { .. } => TryClaim::Busy,
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Pending { discard: false });
                TryClaim::Claimed
            }
        }
    }

    /// Publish the outcome for a claimed slot and wake any waiters.
    ///
    /// A slot marked for discard by an interleaved rebind is dropped
    /// instead of published: the outcome was computed against the old
    /// binding, and a woken waiter re-claims and recomputes.
    pub(crate) fn complete(&self, key: CacheKey, outcome: Result<Value, EvalError>) {
        use dashmap::mapref::entry::Entry;
        match self.results.entry(key) {
            Entry::Occupied(mut entry) => match entry.get() {
                Slot::Pending { discard: true } => {
                    entry.remove();
                }
                _ => {
                    entry.insert(Slot::Ready(outcome));
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Ready(outcome));
            }
        }
        let _guard = self.pending_lock.lock();
        self.pending_cv.notify_all();
    }

    /// Drop a claimed slot without publishing and wake waiters so one of
    /// them re-claims. Used when an evaluation task is torn down before it
    /// can complete.
    pub(crate) fn abandon(&self, key: CacheKey) {
        let removed = self
            .results
            .remove_if(&key, |_, slot| matches!(slot, Slot::Pending { .. }))
            .is_some();
        if removed {
            let _guard = self.pending_lock.lock();
            self.pending_cv.notify_all();
        }
    }

    pub(crate) fn handle_for(&self, id: NodeId) -> NodeHandle {
        let mut entry = self.handles.entry(id).or_insert_with(Weak::new);
        if let Some(pin) = entry.upgrade() {
            return NodeHandle::new(pin);
        }
        let pin = Arc::new(HandleInner { id });
        *entry = Arc::downgrade(&pin);
        NodeHandle::new(pin)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("nodes", &self.nodes.len())
            .field("memo_entries", &self.memo.len())
            .field("cached_results", &self.results.len())
            .finish()
    }
}
