//! Pull Evaluator
//!
//! Synchronous, depth-first, demand-driven evaluation: forcing a node
//! pulls its unevaluated ancestors bottom-up, invokes the node's function
//! once all inputs are resolved, and caches the outcome under the node's
//! effective scope.
//!
//! # Algorithm
//!
//! 1. Terminals resolve directly: innermost scope override first (a value,
//!    or another node forced under the same scope), then the base binding,
//!    else `UnboundInput`. Terminal reads are O(1) and not cached.
//!
//! 2. A computation whose slot is already `Ready` returns the cached
//!    outcome immediately, without re-entering its dependencies.
//!
//! 3. Otherwise the evaluator claims the slot (`Pending`), forces each
//!    input in declared order, and either invokes the function or
//!    propagates the first unhandled input failure. Failures cache exactly
//!    like successes.
//!
//! 4. Inputs the node declared error intent for resolve to an error
//!    sentinel instead of short-circuiting, letting the function degrade.
//!
//! # Cycles
//!
//! The build API cannot create a cycle, but a scope override can (bind a
//! terminal to a node downstream of itself). The evaluator keeps the set
//! of keys currently on its own call chain; re-entering one fails with
//! `CycleDetected` instead of deadlocking on its own pending slot.

use std::collections::HashSet;

use tracing::trace;

use super::scope::{Binding, Scope};
use super::{CacheKey, Claim, Engine};
use crate::error::EvalError;
use crate::graph::node::{Arg, NodeData, NodeHandle, NodeId};
use crate::value::Value;

impl Engine {
    /// Force a node to a value under the given scope.
    ///
    /// Each (node, scope lineage) evaluates at most once until
    /// invalidated; repeated forces return the cached outcome, including
    /// cached failures.
    pub fn force(&self, node: &NodeHandle, scope: &Scope) -> Result<Value, EvalError> {
        Evaluator::new(self).force(node.id(), scope)
    }
}

/// One synchronous evaluation walk.
pub(crate) struct Evaluator<'a> {
    engine: &'a Engine,
    /// Keys currently being evaluated on this call chain.
    in_progress: HashSet<CacheKey>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            in_progress: HashSet::new(),
        }
    }

    pub(crate) fn force(&mut self, id: NodeId, scope: &Scope) -> Result<Value, EvalError> {
        let Some(data) = self.engine.node_data(id) else {
            // Only reachable with a handle that outlived reclamation of an
            // unbound subgraph; report it as the terminal case it is.
            return Err(EvalError::UnboundInput { node: id });
        };

        if data.is_terminal() {
            return self.resolve_terminal(id, scope);
        }

        let key = (id, self.engine.effective_scope(id, scope));
        if self.in_progress.contains(&key) {
            return Err(EvalError::CycleDetected { node: id });
        }

        match self.engine.claim_slot(key) {
            Claim::Ready(outcome) => {
                trace!(node = id.raw(), "cache hit");
                outcome
            }
            Claim::Claimed => {
                self.in_progress.insert(key);
                let outcome = self.evaluate(&data, id, scope);
                self.in_progress.remove(&key);
                self.engine.complete(key, outcome.clone());
                outcome
            }
        }
    }

    fn resolve_terminal(&mut self, id: NodeId, scope: &Scope) -> Result<Value, EvalError> {
        match scope.lookup(id) {
            Some(Binding::Value(value)) => Ok(value),
            Some(Binding::Node(replacement)) => self.force(replacement, scope),
            None => match self.engine.binding_of(id) {
                Some(value) => Ok(value),
                None => Err(EvalError::UnboundInput { node: id }),
            },
        }
    }

    fn evaluate(&mut self, data: &NodeData, id: NodeId, scope: &Scope) -> Result<Value, EvalError> {
        let Some(function) = data.function.clone() else {
            return Err(EvalError::Function {
                node: id,
                message: "computation node has no function".into(),
            });
        };
        let intent = self.engine.intent_of(id);

        let mut args = Vec::with_capacity(data.inputs.len());
        for (position, input) in data.inputs.iter().enumerate() {
            match self.force(*input, scope) {
                Ok(value) => args.push(Arg::Value(value)),
                Err(err) => {
                    if intent.contains(&position) {
                        args.push(Arg::Failed(err));
                    } else {
                        // First unhandled input failure short-circuits;
                        // the function is not invoked.
                        return Err(EvalError::propagate_from(*input, err));
                    }
                }
            }
        }

        trace!(node = id.raw(), function = function.name(), "invoking");
        function
            .invoke(&args)
            .map_err(|message| EvalError::Function { node: id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Function;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_add(counter: Arc<AtomicUsize>) -> Function {
        Function::new("add", move |args: &[Arg]| {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut sum = 0;
            for arg in args {
                sum += arg.value().and_then(Value::as_int).ok_or("not an int")?;
            }
            Ok(Value::Int(sum))
        })
    }

    #[test]
    fn evaluates_and_caches() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());

        let a = engine.make_terminal(Value::Int(2));
        let b = engine.make_terminal(Value::Int(3));
        let sum = engine.make_computation(&add, &[a, b]);

        let scope = Scope::base();
        assert_eq!(engine.force(&sum, &scope), Ok(Value::Int(5)));
        assert_eq!(engine.force(&sum, &scope), Ok(Value::Int(5)));
        assert_eq!(engine.force(&sum, &scope), Ok(Value::Int(5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbound_terminal_fails() {
        let engine = Engine::new();
        let t = engine.make_unbound_terminal();
        assert_eq!(
            engine.force(&t, &Scope::base()),
            Err(EvalError::UnboundInput { node: t.id() })
        );
    }

    #[test]
    fn unbound_failure_propagates_with_origin() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());

        let t = engine.make_unbound_terminal();
        let bound = engine.make_terminal(Value::Int(1));
        let sum = engine.make_computation(&add, &[t.clone(), bound]);

        let err = engine.force(&sum, &Scope::base()).unwrap_err();
        assert_eq!(err.origin(), t.id());
        // Short-circuited: the function never ran.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The failure is cached like any result.
        let again = engine.force(&sum, &Scope::base()).unwrap_err();
        assert_eq!(again, err);
    }

    #[test]
    fn function_failures_are_cached() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let broken = Function::new("broken", move |_args: &[Arg]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        });

        let a = engine.make_terminal(Value::Int(1));
        let node = engine.make_computation(&broken, &[a]);

        let scope = Scope::base();
        let err = engine.force(&node, &scope).unwrap_err();
        assert_eq!(
            err,
            EvalError::Function {
                node: node.id(),
                message: "boom".into(),
            }
        );
        let _ = engine.force(&node, &scope);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_intent_receives_sentinel() {
        let engine = Engine::new();
        let fallback = Function::new("fallback", |args: &[Arg]| {
            Ok(match &args[0] {
                Arg::Value(v) => v.clone(),
                Arg::Failed(_) => Value::Int(-1),
            })
        });

        let t = engine.make_unbound_terminal();
        let node = engine.make_computation(&fallback, &[t]);
        engine.declare_error_intent(&node, &[0]).unwrap();

        assert_eq!(engine.force(&node, &Scope::base()), Ok(Value::Int(-1)));
    }

    #[test]
    fn override_cycle_is_detected() {
        let engine = Engine::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let add = counting_add(calls.clone());

        let t = engine.make_terminal(Value::Int(1));
        let node = engine.make_computation(&add, &[t.clone()]);

        // Bind the terminal to a node downstream of itself.
        let scope = engine
            .with_overrides(&Scope::base(), [(t, Binding::Node(node.id()))])
            .unwrap();

        let err = engine.force(&node, &scope).unwrap_err();
        match err {
            EvalError::CycleDetected { .. } => {}
            EvalError::Propagated { cause, .. } => {
                assert!(matches!(*cause, EvalError::CycleDetected { .. }));
            }
            other => panic!("expected a cycle error, got {other:?}"),
        }
    }
}
