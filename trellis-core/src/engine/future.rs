//! Futures-Based Evaluation
//!
//! `force_async` evaluates independent subgraphs concurrently: each node's
//! inputs are awaited together, so siblings with no dependency
//! relationship run in parallel on the runtime's workers, while a node
//! itself suspends only on its own unresolved inputs.
//!
//! # Coalescing
//!
//! At most one evaluation task exists per (node, effective scope) at a
//! time: the first caller spawns it and registers the shared future in
//! the in-flight table; every concurrent caller clones that future and
//! awaits the same outcome. Combined with the result cache this is the
//! exactly-once guarantee under concurrency.
//!
//! # Cancellation
//!
//! Evaluation tasks are spawned, not inlined, so dropping a caller's
//! future abandons only the await: work already started runs to
//! completion and populates the cache (its result is valid and reusable).
//! A task torn down before completing (runtime shutdown, abort) surfaces
//! as [`EvalError::Cancelled`] to anyone still awaiting it.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use tracing::trace;

use super::scope::{Binding, Scope};
use super::{CacheKey, Engine, TryClaim};
use crate::error::EvalError;
use crate::graph::node::{Arg, NodeHandle, NodeId};
use crate::value::Value;

pub(crate) type EvalOutcome = Result<Value, EvalError>;
pub(crate) type SharedEval = Shared<BoxFuture<'static, EvalOutcome>>;

impl Engine {
    /// Force a node asynchronously under the given scope.
    ///
    /// Concurrent calls for the same (node, scope) coalesce onto a single
    /// in-flight evaluation; independent subgraphs evaluate concurrently.
    pub async fn force_async(self: Arc<Self>, node: NodeHandle, scope: Scope) -> EvalOutcome {
        let path = Arc::new(HashSet::new());
        eval_shared(&self, node.id(), &scope, &path).await
    }
}

/// Get the single in-flight evaluation for a key, spawning it if absent.
fn eval_shared(
    engine: &Arc<Engine>,
    id: NodeId,
    scope: &Scope,
    path: &Arc<HashSet<NodeId>>,
) -> SharedEval {
    let key = (id, engine.effective_scope(id, scope));

    // Checked before the in-flight lookup: a cycle's in-flight future is
    // our own ancestor, and awaiting it would deadlock.
    if path.contains(&id) {
        return futures_util::future::ready(Err(EvalError::CycleDetected { node: id }))
            .boxed()
            .shared();
    }
    if let Some(ready) = engine.cached(key) {
        return futures_util::future::ready(ready).boxed().shared();
    }
    if let Some(existing) = engine.inflight.get(&key) {
        trace!(node = id.raw(), "coalesced onto in-flight evaluation");
        return existing.clone();
    }

    engine
        .inflight
        .entry(key)
        .or_insert_with(|| {
            let cleanup = InflightGuard {
                engine: Arc::clone(engine),
                key,
            };
            let engine = Arc::clone(engine);
            let scope = scope.clone();
            let path = Arc::clone(path);
            let task = tokio::spawn(async move {
                let _cleanup = cleanup;
                eval_task(Arc::clone(&engine), id, key, scope, path).await
            });
            async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EvalError::Cancelled { node: id }),
                }
            }
            .boxed()
            .shared()
        })
        .clone()
}

/// Releases a task's in-flight registration when the task finishes,
/// completed or torn down.
struct InflightGuard {
    engine: Arc<Engine>,
    key: CacheKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.engine.inflight.remove(&self.key);
    }
}

/// Releases a claimed slot if the owning task is torn down before it can
/// complete. Without this, an aborted task would leave a `Pending` slot
/// that blocks synchronous waiters forever. After a normal completion the
/// slot is `Ready` and the abandon is a no-op.
struct SlotGuard {
    engine: Arc<Engine>,
    key: CacheKey,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.engine.abandon(self.key);
    }
}

/// The body of one node's evaluation task. Boxed for recursion.
fn eval_task(
    engine: Arc<Engine>,
    id: NodeId,
    key: CacheKey,
    scope: Scope,
    path: Arc<HashSet<NodeId>>,
) -> BoxFuture<'static, EvalOutcome> {
    Box::pin(async move {
        let Some(data) = engine.node_data(id) else {
            return Err(EvalError::UnboundInput { node: id });
        };

        let mut extended: HashSet<NodeId> = HashSet::clone(&path);
        extended.insert(id);
        let path = Arc::new(extended);

        // Terminals resolve directly and are not cached.
        if data.is_terminal() {
            return match scope.lookup(id) {
                Some(Binding::Value(value)) => Ok(value),
                Some(Binding::Node(replacement)) => {
                    eval_shared(&engine, replacement, &scope, &path).await
                }
                None => match engine.binding_of(id) {
                    Some(value) => Ok(value),
                    None => Err(EvalError::UnboundInput { node: id }),
                },
            };
        }

        // Claim the slot shared with the synchronous evaluator: a sync
        // force racing this task coalesces on the slot instead of invoking
        // the function a second time, and vice versa. Busy means a sync
        // evaluation owns the slot; yield until it publishes rather than
        // parking the worker.
        loop {
            match engine.try_claim_slot(key) {
                TryClaim::Ready(outcome) => return outcome,
                TryClaim::Claimed => break,
                TryClaim::Busy => tokio::task::yield_now().await,
            }
        }
        let _slot = SlotGuard {
            engine: Arc::clone(&engine),
            key,
        };

        let outcome = match data.function.clone() {
            None => Err(EvalError::Function {
                node: id,
                message: "computation node has no function".into(),
            }),
            Some(function) => {
                // Pull every input concurrently; a node suspends only on
                // its own unresolved inputs.
                let pending: Vec<SharedEval> = data
                    .inputs
                    .iter()
                    .map(|input| eval_shared(&engine, *input, &scope, &path))
                    .collect();
                let resolved = join_all(pending).await;

                let intent = engine.intent_of(id);
                let mut args = Vec::with_capacity(resolved.len());
                let mut failure: Option<EvalError> = None;
                for (position, (input, outcome)) in data.inputs.iter().zip(resolved).enumerate() {
                    match outcome {
                        Ok(value) => args.push(Arg::Value(value)),
                        Err(err) => {
                            if intent.contains(&position) {
                                args.push(Arg::Failed(err));
                            } else {
                                // First failure in declared order wins.
                                failure = Some(EvalError::propagate_from(*input, err));
                                break;
                            }
                        }
                    }
                }

                match failure {
                    Some(err) => Err(err),
                    None => {
                        trace!(node = id.raw(), function = function.name(), "invoking");
                        function
                            .invoke(&args)
                            .map_err(|message| EvalError::Function { node: id, message })
                    }
                }
            }
        };

        engine.complete(key, outcome.clone());
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::Function;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_forces_coalesce() {
        let engine = Arc::new(Engine::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let slow = Function::new("slow", move |args: &[Arg]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(args[0].value().cloned().ok_or("missing input")?)
        });

        let t = engine.make_terminal(Value::Int(7));
        let node = engine.make_computation(&slow, &[t]);
        let scope = Scope::base();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                tokio::spawn(Arc::clone(&engine).force_async(node.clone(), scope.clone()))
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(Value::Int(7)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn independent_siblings_run_concurrently() {
        let engine = Arc::new(Engine::new());

        let slow_double = Function::new("slow_double", |args: &[Arg]| {
            std::thread::sleep(Duration::from_millis(50));
            let n = args[0].value().and_then(Value::as_int).ok_or("not an int")?;
            Ok(Value::Int(n * 2))
        });
        let add = Function::new("add", |args: &[Arg]| {
            let mut sum = 0;
            for arg in args {
                sum += arg.value().and_then(Value::as_int).ok_or("not an int")?;
            }
            Ok(Value::Int(sum))
        });

        let left = engine.make_computation(&slow_double, &[engine.make_terminal(Value::Int(1))]);
        let right = engine.make_computation(&slow_double, &[engine.make_terminal(Value::Int(2))]);
        let joined = engine.make_computation(&add, &[left, right]);

        let start = std::time::Instant::now();
        let outcome = Arc::clone(&engine)
            .force_async(joined, Scope::base())
            .await;
        assert_eq!(outcome, Ok(Value::Int(6)));
        // Both 50ms leaves overlapped; well under the 100ms serial time.
        assert!(start.elapsed() < Duration::from_millis(95));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_results_land_in_the_shared_cache() {
        let engine = Arc::new(Engine::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let f = Function::new("inc", move |args: &[Arg]| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            let n = args[0].value().and_then(Value::as_int).ok_or("not an int")?;
            Ok(Value::Int(n + 1))
        });

        let t = engine.make_terminal(Value::Int(9));
        let node = engine.make_computation(&f, &[t]);
        let scope = Scope::base();

        let outcome = Arc::clone(&engine)
            .force_async(node.clone(), scope.clone())
            .await;
        assert_eq!(outcome, Ok(Value::Int(10)));

        // The synchronous evaluator sees the same cached result.
        assert_eq!(engine.force(&node, &scope), Ok(Value::Int(10)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn torn_down_tasks_surface_cancelled_and_release_their_slots() {
        use futures_util::task::noop_waker_ref;
        use std::future::Future;
        use std::pin::Pin;
        use std::task::{Context, Poll};
        use std::time::Instant;

        let engine = Arc::new(Engine::new());
        let slow = Function::new("slow", |args: &[Arg]| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(args[0].value().cloned().ok_or("missing input")?)
        });
        let pass = Function::new("pass", |args: &[Arg]| {
            Ok(args[0].value().cloned().ok_or("missing input")?)
        });

        let t = engine.make_terminal(Value::Int(7));
        let leaf = engine.make_computation(&slow, &[t]);
        let top = engine.make_computation(&pass, &[leaf]);

        // Start the evaluation, wait until `top` is parked on `leaf`,
        // then tear the runtime down underneath it.
        let rt = tokio::runtime::Runtime::new().unwrap();
        let mut shared = {
            let _ctx = rt.enter();
            eval_shared(
                &engine,
                top.id(),
                &Scope::base(),
                &Arc::new(std::collections::HashSet::new()),
            )
        };
        std::thread::sleep(Duration::from_millis(50));
        rt.shutdown_background();

        let mut cx = Context::from_waker(noop_waker_ref());
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = loop {
            match Pin::new(&mut shared).poll(&mut cx) {
                Poll::Ready(outcome) => break outcome,
                Poll::Pending => {
                    assert!(Instant::now() < deadline, "cancellation never surfaced");
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        };
        assert_eq!(outcome, Err(EvalError::Cancelled { node: top.id() }));

        // The torn-down tasks released their in-flight registrations and
        // claimed slots; nothing is left to block a later force.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !engine.inflight.is_empty() {
            assert!(Instant::now() < deadline, "in-flight table never drained");
            std::thread::sleep(Duration::from_millis(10));
        }

        let rt = tokio::runtime::Runtime::new().unwrap();
        let outcome = rt.block_on(Arc::clone(&engine).force_async(top.clone(), Scope::base()));
        assert_eq!(outcome, Ok(Value::Int(7)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_cycle_detection() {
        let engine = Arc::new(Engine::new());
        let identity = Function::new("identity", |args: &[Arg]| {
            Ok(args[0].value().cloned().ok_or("missing input")?)
        });

        let t = engine.make_terminal(Value::Int(1));
        let node = engine.make_computation(&identity, &[t.clone()]);
        let scope = engine
            .with_overrides(&Scope::base(), [(t, Binding::Node(node.id()))])
            .unwrap();

        let err = Arc::clone(&engine)
            .force_async(node, scope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::CycleDetected { .. } | EvalError::Propagated { .. }
        ));
    }
}
