//! Error Types
//!
//! Two separate taxonomies, following the split between building a graph
//! and evaluating it:
//!
//! - [`GraphError`]: misuse of the construction/binding API. These are
//!   programmer errors surfaced at call time and never cached.
//!
//! - [`EvalError`]: failures produced while forcing a node. These behave
//!   exactly like successful results: they are cached on the failing node
//!   and propagated structurally to dependents until an invalidation
//!   clears them.
//!
//! Propagated failures always carry the *originating* node, so forcing a
//! deep dependent of a broken terminal reports the terminal, not a generic
//! wrapper several layers removed.

use std::sync::Arc;

use thiserror::Error;

use crate::graph::node::NodeId;

/// Errors produced while evaluating (forcing) a node.
///
/// `EvalError` is `Clone` because failures are cached and handed to every
/// dependent, and because coalesced concurrent forces all receive the same
/// outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    /// A terminal was forced without a bound value in the active scope.
    #[error("terminal {node:?} forced without a bound value")]
    UnboundInput { node: NodeId },

    /// The dependency walk re-entered a node already being evaluated.
    ///
    /// The construction API cannot build a cycle (edges only reference
    /// existing nodes); this arises from a scope override binding a
    /// terminal to a node downstream of itself.
    #[error("dependency cycle detected through {node:?}")]
    CycleDetected { node: NodeId },

    /// An input failed and this node did not declare intent to handle it.
    ///
    /// `origin` is the node where the failure started; `cause` is its
    /// error. Re-propagation reuses both, so the original failure is
    /// visible from arbitrarily deep dependents.
    #[error("input failure originating at {origin:?}: {cause}")]
    Propagated { origin: NodeId, cause: Arc<EvalError> },

    /// The computation function itself reported an error.
    #[error("function failed at {node:?}: {message}")]
    Function { node: NodeId, message: String },

    /// The evaluation task was torn down before producing a result.
    #[error("evaluation of {node:?} was cancelled")]
    Cancelled { node: NodeId },
}

impl EvalError {
    /// The node where this failure originated.
    pub fn origin(&self) -> NodeId {
        match self {
            EvalError::UnboundInput { node }
            | EvalError::CycleDetected { node }
            | EvalError::Function { node, .. }
            | EvalError::Cancelled { node } => *node,
            EvalError::Propagated { origin, .. } => *origin,
        }
    }

    /// Wrap a failing input's error for a dependent at `input` without
    /// losing the original cause.
    pub(crate) fn propagate_from(input: NodeId, err: EvalError) -> EvalError {
        match err {
            // Already carries its origin; pass it through unchanged.
            prop @ EvalError::Propagated { .. } => prop,
            other => EvalError::Propagated {
                origin: input,
                cause: Arc::new(other),
            },
        }
    }
}

/// Errors produced by the graph construction and binding API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The referenced node is not (or no longer) in the engine.
    #[error("unknown node {node:?}")]
    UnknownNode { node: NodeId },

    /// The operation requires a terminal but was given a computation.
    #[error("{node:?} is not a terminal")]
    NotATerminal { node: NodeId },

    /// Interned constants are content-keyed and cannot be rebound.
    #[error("{node:?} is an interned constant and cannot be rebound")]
    ImmutableTerminal { node: NodeId },

    /// `bind` only populates never-bound terminals; replacing a live
    /// binding requires `rebind`, which also invalidates dependents.
    #[error("{node:?} is already bound; use rebind")]
    AlreadyBound { node: NodeId },

    /// An error-intent position is out of range for the node's inputs.
    #[error("input position {position} out of range for {node:?} ({arity} inputs)")]
    PositionOutOfRange {
        node: NodeId,
        position: usize,
        arity: usize,
    },
}
