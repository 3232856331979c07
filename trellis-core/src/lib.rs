//! Trellis Core
//!
//! This crate provides the core engine for the Trellis demand-driven
//! computation framework. It implements:
//!
//! - A computation graph of terminals and memoized pure-function nodes
//! - Lazy, pull-based evaluation with exactly-once caching
//! - Scoped terminal overrides for what-if/scenario runs
//! - Invalidation propagation when root terminals are rebound
//! - Futures-based concurrent evaluation of independent subgraphs
//! - Mark-and-sweep reclamation of unreachable memo entries
//!
//! Front ends (the layers that turn ordinary function definitions or
//! stored models into graphs) are external collaborators: they construct
//! nodes through [`Engine`]'s builder API and force them on demand.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `value`: the immutable, hashable value model flowing along edges
//! - `graph`: node structure, memoization keys, reverse-dependency index
//! - `engine`: the engine facade — construction, scopes, evaluation
//!   (sync and async), invalidation, reclamation
//! - `error`: evaluation and construction error taxonomies
//!
//! # Example
//!
//! ```rust
//! use trellis_core::{Arg, Binding, Engine, Function, Scope, Value};
//!
//! let engine = Engine::new();
//! let mul = Function::new("mul", |args: &[Arg]| {
//!     let a = args[0].value().and_then(Value::as_float).ok_or("bad input")?;
//!     let b = args[1].value().and_then(Value::as_float).ok_or("bad input")?;
//!     Ok(Value::Float(a * b))
//! });
//!
//! let spot = engine.make_terminal(Value::Float(100.0));
//! let qty = engine.make_terminal(Value::Float(3.0));
//! let exposure = engine.make_computation(&mul, &[spot.clone(), qty]);
//!
//! let base = Scope::base();
//! assert_eq!(engine.force(&exposure, &base), Ok(Value::Float(300.0)));
//!
//! // What-if: bump spot without touching the base graph.
//! let bumped = engine
//!     .with_overrides(&base, [(spot.clone(), Binding::Value(Value::Float(105.0)))])
//!     .unwrap();
//! assert_eq!(engine.force(&exposure, &bumped), Ok(Value::Float(315.0)));
//! assert_eq!(engine.force(&exposure, &base), Ok(Value::Float(300.0)));
//!
//! // Live rebind: dependents recompute on the next force.
//! engine.rebind(&spot, Value::Float(90.0)).unwrap();
//! assert_eq!(engine.force(&exposure, &base), Ok(Value::Float(270.0)));
//! ```

pub mod engine;
pub mod error;
pub mod graph;
pub mod value;

pub use engine::{Binding, Engine, Scope, ScopeId};
pub use error::{EvalError, GraphError};
pub use graph::{Arg, Function, FunctionId, NodeHandle, NodeId};
pub use value::Value;
