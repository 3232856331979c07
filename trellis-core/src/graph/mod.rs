//! Computation Graph
//!
//! This module defines the structural half of the engine: the node types
//! that make up the dependency DAG and the reverse-dependency index used
//! for invalidation.
//!
//! # Overview
//!
//! The graph is a DAG where:
//!
//! - Terminals are the roots: they hold bound values and have no inputs.
//! - Computations apply a pure function to an ordered list of input nodes.
//! - Forward edges (inputs) are primary structure, owned by the node.
//! - Reverse edges (dependents) are a derived index, maintained separately
//!   and non-owning, so that invalidation can walk downstream without
//!   creating retention cycles.
//!
//! Acyclicity holds by construction for the build API — a computation can
//! only reference nodes that already exist — so the graph layer carries no
//! cycle checks of its own. The evaluator re-checks at force time for the
//! one escape hatch (scope overrides that substitute a node for a
//! terminal).

pub mod depend;
pub mod node;

pub use depend::DependentIndex;
pub use node::{Arg, Function, FunctionId, NodeHandle, NodeId, NodeKey, NodeKind};
