//! Graph Nodes
//!
//! This module defines the vertex types of the computation graph.
//!
//! A node is either a *terminal* (holds a bound value directly, no
//! dependencies) or a *computation* (a pure function applied to an ordered
//! list of input nodes). Two computations built from the same function and
//! the same ordered inputs are the same node; the engine's memo table
//! enforces this with [`NodeKey`].
//!
//! Nodes themselves are immutable structure. Everything that changes over
//! time (terminal bindings, cached results, dirty state) lives in the
//! engine's tables, keyed by [`NodeId`], so structure can be shared freely
//! across scopes and threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smallvec::SmallVec;

use crate::error::EvalError;
use crate::value::Value;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a computation function.
///
/// Function identity is registration identity: two [`Function`]s built
/// from the same closure are distinct for memoization purposes. The
/// external front end is expected to build each function once and reuse
/// the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(u64);

impl FunctionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The argument a computation function receives for each input position.
///
/// Inputs resolve to [`Arg::Value`] normally. A position the node has
/// declared error intent for resolves to [`Arg::Failed`] when that input
/// failed, letting the function degrade instead of short-circuiting.
#[derive(Debug, Clone)]
pub enum Arg {
    Value(Value),
    Failed(EvalError),
}

impl Arg {
    /// The resolved value, if this input succeeded.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Arg::Value(v) => Some(v),
            Arg::Failed(_) => None,
        }
    }

    /// The failure, if this input failed.
    pub fn error(&self) -> Option<&EvalError> {
        match self {
            Arg::Failed(e) => Some(e),
            Arg::Value(_) => None,
        }
    }

    /// Whether this input failed.
    pub fn is_failed(&self) -> bool {
        matches!(self, Arg::Failed(_))
    }
}

/// A pure computation function, identified for memoization.
///
/// The closure must be pure with respect to its arguments: the engine
/// invokes it at most once per distinct (key, scope lineage) and caches
/// the outcome. An `Err(message)` return becomes
/// [`EvalError::Function`] on the node.
#[derive(Clone)]
pub struct Function {
    id: FunctionId,
    name: Arc<str>,
    run: Arc<dyn Fn(&[Arg]) -> Result<Value, String> + Send + Sync>,
}

impl Function {
    /// Create a new function with a display name and a compute closure.
    pub fn new<F>(name: impl Into<Arc<str>>, run: F) -> Self
    where
        F: Fn(&[Arg]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            id: FunctionId::next(),
            name: name.into(),
            run: Arc::new(run),
        }
    }

    /// The function's memoization identity.
    pub fn id(&self) -> FunctionId {
        self.id
    }

    /// The function's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function with resolved arguments.
    pub(crate) fn invoke(&self, args: &[Arg]) -> Result<Value, String> {
        (self.run)(args)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Memoization key for a computation node.
///
/// Input order is significant and preserved exactly as declared: swapping
/// two inputs produces a different key even when their values are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub(crate) function: FunctionId,
    pub(crate) inputs: SmallVec<[NodeId; 4]>,
}

impl NodeKey {
    pub(crate) fn new(function: FunctionId, inputs: SmallVec<[NodeId; 4]>) -> Self {
        Self { function, inputs }
    }
}

/// The kind of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A root holding a bound value. Interned terminals are content-keyed
    /// constants and immutable; non-interned terminals are mutable roots
    /// that may be rebound over the graph's lifetime.
    Terminal { interned: bool },

    /// A pure function applied to ordered input nodes.
    Computation,
}

/// Immutable structural data for a node.
pub(crate) struct NodeData {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) function: Option<Function>,
    pub(crate) inputs: SmallVec<[NodeId; 4]>,
}

impl NodeData {
    pub(crate) fn terminal(interned: bool) -> Self {
        Self {
            id: NodeId::new(),
            kind: NodeKind::Terminal { interned },
            function: None,
            inputs: SmallVec::new(),
        }
    }

    pub(crate) fn computation(function: Function, inputs: SmallVec<[NodeId; 4]>) -> Self {
        Self {
            id: NodeId::new(),
            kind: NodeKind::Computation,
            function: Some(function),
            inputs,
        }
    }

    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal { .. })
    }
}

impl fmt::Debug for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("NodeData");
        d.field("id", &self.id).field("kind", &self.kind);
        if let Some(function) = &self.function {
            d.field("function", &function.name());
        }
        d.field("inputs", &self.inputs).finish()
    }
}

/// Backing allocation for a [`NodeHandle`].
///
/// The engine tracks these weakly; an upgradeable entry marks the node as
/// an externally held root for the cache reclaimer.
pub(crate) struct HandleInner {
    pub(crate) id: NodeId,
}

/// A strong, externally held reference to a node.
///
/// Holding a `NodeHandle` (or any live node that references the node as an
/// input) keeps the node's memo entries alive across reclamation passes.
/// Dropping every handle to a subgraph makes it eligible for eviction.
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    pin: Arc<HandleInner>,
}

impl NodeHandle {
    pub(crate) fn new(pin: Arc<HandleInner>) -> Self {
        Self { id: pin.id, pin }
    }

    /// The node this handle refers to.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn pin(&self) -> &Arc<HandleInner> {
        &self.pin
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn function_ids_are_registration_identity() {
        let f1 = Function::new("add", |_| Ok(Value::Unit));
        let f2 = Function::new("add", |_| Ok(Value::Unit));
        assert_ne!(f1.id(), f2.id());
        assert_eq!(f1.clone().id(), f1.id());
    }

    #[test]
    fn node_key_is_order_sensitive() {
        let f = Function::new("sub", |_| Ok(Value::Unit));
        let a = NodeId::new();
        let b = NodeId::new();

        let ab = NodeKey::new(f.id(), smallvec![a, b]);
        let ba = NodeKey::new(f.id(), smallvec![b, a]);
        assert_ne!(ab, ba);
        assert_eq!(ab, NodeKey::new(f.id(), smallvec![a, b]));
    }

    #[test]
    fn arg_accessors() {
        let ok = Arg::Value(Value::Int(1));
        assert_eq!(ok.value(), Some(&Value::Int(1)));
        assert!(!ok.is_failed());

        let node = NodeId::new();
        let failed = Arg::Failed(EvalError::UnboundInput { node });
        assert!(failed.is_failed());
        assert_eq!(failed.value(), None);
        assert_eq!(failed.error(), Some(&EvalError::UnboundInput { node }));
    }
}
