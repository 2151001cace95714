//! # Effect Descriptions
//!
//! An [`Effect`] is an immutable description of a computation — a value, not
//! an action. Nothing runs until the description is handed to a
//! [`Runtime`](crate::scheduler::Runtime) (or forked from a running fiber).
//!
//! ## Representation
//!
//! The interpreter works over a closed set of node kinds with a single
//! dispatch match (adding a node kind means extending the enum and the
//! interpreter, never subclassing). Values travel through the interpreter as
//! `Arc<dyn Any + Send + Sync>`; the typed `Effect<A, E>` facade downcasts
//! at the seams. `E` is a phantom: failures are carried structurally in a
//! [`Cause`] and extracted with their concrete type by `catch_all`.
//!
//! Descriptions are single-use: running one consumes it. Build reusable
//! programs as functions returning fresh descriptions.

use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect, Exit, ExitKind};
use crate::fiber::{FiberId, FiberShared, RawFiber, Resume};
use crate::fiber_ref::ErasedRef;
use crate::scope::Scope;
use crate::stm::{Stm, StmNode};

/// Type-erased value flowing through the interpreter.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Continuation applied to a success value.
pub(crate) type Cont = Box<dyn FnOnce(Value) -> Node + Send>;
/// Continuation applied to a failure cause.
pub(crate) type FailCont = Box<dyn FnOnce(Cause) -> Node + Send>;
/// A finalizer: observes how the guarded region exited, yields a cleanup node.
pub(crate) type FinalizerFn = Box<dyn FnOnce(ExitKind) -> Node + Send>;

/// The unit value in erased form.
pub(crate) fn unit_value() -> Value {
    Arc::new(())
}

/// Box a typed value for the interpreter.
pub(crate) fn box_value<A: Send + Sync + 'static>(a: A) -> Value {
    Arc::new(a)
}

/// Recover a typed value at a facade boundary.
///
/// The phantom types on [`Effect`]/[`Stm`] make a mismatch a runtime bug,
/// so this uses `expect` the way captured continuations do.
pub(crate) fn unbox<A: Clone + Send + Sync + 'static>(v: Value) -> A {
    v.downcast_ref::<A>()
        .expect("effect value type mismatch")
        .clone()
}

/// Rebuild a node that reproduces a recorded exit.
pub(crate) fn exit_to_node(exit: Exit<Value>) -> Node {
    match exit {
        Exit::Success(v) => Node::SucceedNow(v),
        Exit::Failure(c) => Node::FailCause(Box::new(move || c)),
    }
}

// ============================================================================
// Node kinds
// ============================================================================

/// Closed set of effect description nodes.
///
/// Immutable once constructed; consumed exactly once by the interpreter.
pub(crate) enum Node {
    /// An already-computed value.
    SucceedNow(Value),
    /// A synchronous step; panics become `Die` causes.
    Sync(Box<dyn FnOnce() -> Value + Send>),
    /// A lazily-built failure cause.
    FailCause(Box<dyn FnOnce() -> Cause + Send>),
    /// A lazily-built description.
    Defer(Box<dyn FnOnce() -> Node + Send>),
    /// Sequencing: run the inner node, feed its value to the continuation.
    FlatMap(Box<Node>, Cont),
    /// Error boundary. `typed_only` handlers skip causes containing
    /// defects or interruptions; catch-all handlers see everything.
    Fold {
        inner: Box<Node>,
        on_success: Cont,
        on_failure: FailCont,
        typed_only: bool,
    },
    /// Register a callback and suspend until it fires.
    Async(Box<dyn FnOnce(Resume) + Send>),
    /// Spawn the inner node as a new fiber; continue with its handle.
    Fork { inner: Box<Node>, daemon: bool },
    /// Run the inner node with interruption masked.
    Masked(Box<Node>),
    /// Run the inner node, then the finalizer on every exit path.
    Ensuring {
        inner: Box<Node>,
        finalizer: FinalizerFn,
    },
    /// Read a fiber-scoped reference.
    GetRef(Arc<ErasedRef>),
    /// Write a fiber-scoped reference.
    SetRef(Arc<ErasedRef>, Value),
    /// Merge a completed child fiber's references into the current fiber.
    JoinMerge(Arc<FiberShared>),
    /// Signal interruption of the target, carrying the current fiber's id.
    InterruptSignal(Arc<FiberShared>),
    /// Hand the current fiber's scope to the body.
    WithScope(Box<dyn FnOnce(Scope) -> Node + Send>),
    /// Commit an STM transaction, retrying/blocking as needed.
    Commit(Arc<StmNode>),
    /// Yield the rest of this scheduler turn.
    YieldNow,
}

// ============================================================================
// Effect facade
// ============================================================================

/// A lazily-evaluated, composable description of a computation that
/// succeeds with `A` or fails with `E` (plus defects and interruptions,
/// which every effect can produce).
pub struct Effect<A, E = Infallible> {
    pub(crate) node: Node,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Effect<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// An effect that succeeds with the given value.
    pub fn succeed(a: A) -> Self {
        Self::from_node(Node::SucceedNow(box_value(a)))
    }

    /// An effect that runs a synchronous step when executed.
    pub fn succeed_with(f: impl FnOnce() -> A + Send + 'static) -> Self {
        Self::from_node(Node::Sync(Box::new(move || box_value(f()))))
    }

    /// An effect that fails with the given error.
    pub fn fail(e: E) -> Self {
        Self::from_node(Node::FailCause(Box::new(move || Cause::fail(e))))
    }

    /// An effect that fails with a lazily-built error.
    pub fn fail_with(f: impl FnOnce() -> E + Send + 'static) -> Self {
        Self::from_node(Node::FailCause(Box::new(move || Cause::fail(f()))))
    }

    /// An effect that dies with a defect, signalling a bug.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let d = defect.into();
        Self::from_node(Node::FailCause(Box::new(move || Cause::Die(d))))
    }

    /// An effect built lazily at execution time.
    pub fn suspend(f: impl FnOnce() -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_node(Node::Defer(Box::new(move || f().node)))
    }

    /// An effect that never completes. Only interruption ends it.
    pub fn never() -> Self {
        Self::from_node(Node::Async(Box::new(|_resume| {})))
    }

    /// Suspend until `register`'s callback fires.
    ///
    /// The callback is one-shot: the first completion wins, later calls are
    /// ignored. Firing it synchronously inside `register` is allowed and
    /// continues without suspending.
    pub fn from_async(register: impl FnOnce(AsyncCallback<A, E>) + Send + 'static) -> Self {
        Self::from_node(Node::Async(Box::new(move |resume| {
            register(AsyncCallback {
                raw: resume,
                _marker: PhantomData,
            });
        })))
    }

    /// Sleep for the given duration on the runtime timer.
    pub fn sleep(duration: Duration) -> Effect<(), E> {
        Effect::from_node(Node::Async(Box::new(move |resume: Resume| {
            let deadline = std::time::Instant::now() + duration;
            let core = resume.core().clone();
            core.timer().schedule(deadline, resume);
        })))
    }

    /// Give the rest of the current scheduler turn back to other fibers.
    pub fn yield_now() -> Effect<(), E> {
        Effect::from_node(Node::YieldNow)
    }

    /// Run an STM transaction atomically, yielding its result.
    pub fn atomically(stm: Stm<A, E>) -> Self {
        Self::from_node(Node::Commit(Arc::new(stm.node)))
    }

    /// Open a fresh child scope, run the body with it, and close it on exit.
    pub fn scoped(f: impl FnOnce(Scope) -> Effect<A, E> + Send + 'static) -> Self {
        Self::from_node(Node::WithScope(Box::new(move |parent| {
            let child = Scope::child_of(&parent);
            crate::scope::wrap_with_scope(f(child.clone()).node, child)
        })))
    }

    /// Sequencing: run `self`, then the effect built from its value.
    pub fn flat_map<B>(self, f: impl FnOnce(A) -> Effect<B, E> + Send + 'static) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        Effect::from_node(Node::FlatMap(
            Box::new(self.node),
            Box::new(move |v| f(unbox::<A>(v)).node),
        ))
    }

    /// Map the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |a| Effect::succeed(f(a)))
    }

    /// Replace the success value with a constant.
    pub fn as_value<B>(self, b: B) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.map(move |_| b)
    }

    /// Run `self` then `other`, combining the results.
    pub fn zip_with<B, C>(
        self,
        other: Effect<B, E>,
        f: impl FnOnce(A, B) -> C + Send + 'static,
    ) -> Effect<C, E>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |a| other.map(move |b| f(a, b)))
    }

    /// Map the typed error, preserving the cause structure.
    pub fn map_error<E2>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Effect<A, E2>
    where
        E2: Clone + Send + Sync + 'static,
    {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_success: Box::new(Node::SucceedNow),
            on_failure: Box::new(move |c| {
                let mapped = c.map_expected::<E, E2>(&f);
                Node::FailCause(Box::new(move || mapped))
            }),
            typed_only: false,
        })
    }

    /// Recover from typed failures. Defects and interruptions pass through.
    pub fn catch_all<E2>(
        self,
        f: impl FnOnce(E) -> Effect<A, E2> + Send + 'static,
    ) -> Effect<A, E2>
    where
        E2: Clone + Send + Sync + 'static,
    {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_success: Box::new(Node::SucceedNow),
            on_failure: Box::new(move |c| match c.expected::<E>() {
                Some(e) => f(e).node,
                None => Node::FailCause(Box::new(move || c)),
            }),
            typed_only: true,
        })
    }

    /// Catch-all boundary: handle success and the full cause tree.
    pub fn fold_cause<B, E2>(
        self,
        on_success: impl FnOnce(A) -> Effect<B, E2> + Send + 'static,
        on_failure: impl FnOnce(Cause) -> Effect<B, E2> + Send + 'static,
    ) -> Effect<B, E2>
    where
        B: Clone + Send + Sync + 'static,
        E2: Clone + Send + Sync + 'static,
    {
        Effect::from_node(Node::Fold {
            inner: Box::new(self.node),
            on_success: Box::new(move |v| on_success(unbox::<A>(v)).node),
            on_failure: Box::new(move |c| on_failure(c).node),
            typed_only: false,
        })
    }

    /// Reify the outcome as an [`Exit`], never failing.
    pub fn exit(self) -> Effect<Exit<A>, Infallible> {
        self.fold_cause(
            |a| Effect::succeed(Exit::Success(a)),
            |c| Effect::succeed(Exit::Failure(c)),
        )
    }

    /// Run a finalizer on every exit path (success, failure, interrupt).
    ///
    /// The finalizer runs with interruption masked; its own failure is
    /// combined into the aggregate cause rather than replacing it.
    pub fn ensuring<EF>(self, finalizer: Effect<(), EF>) -> Self
    where
        EF: Clone + Send + Sync + 'static,
    {
        Self::from_node(Node::Ensuring {
            inner: Box::new(self.node),
            finalizer: Box::new(move |_kind| finalizer.node),
        })
    }

    /// Like [`Effect::ensuring`], but the finalizer observes how the
    /// region exited.
    pub fn on_exit<EF>(
        self,
        f: impl FnOnce(ExitKind) -> Effect<(), EF> + Send + 'static,
    ) -> Self
    where
        EF: Clone + Send + Sync + 'static,
    {
        Self::from_node(Node::Ensuring {
            inner: Box::new(self.node),
            finalizer: Box::new(move |kind| f(kind).node),
        })
    }

    /// Mask interruption for the duration of this effect.
    ///
    /// Signals received inside the region are latched and applied at the
    /// first checkpoint after it exits.
    pub fn uninterruptible(self) -> Self {
        Self::from_node(Node::Masked(Box::new(self.node)))
    }

    /// Spawn this effect on a new fiber supervised by the current one.
    ///
    /// Returns immediately with a handle; no ordering is guaranteed between
    /// the child and the continuing parent.
    pub fn fork(self) -> Effect<Fiber<A, E>, E> {
        Effect::from_node(fork_node::<A, E>(self.node, false))
    }

    /// Spawn on a disowned fiber: interrupting the parent does not
    /// propagate to it.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, E> {
        Effect::from_node(fork_node::<A, E>(self.node, true))
    }

    /// First of `self` and `other` to complete wins; the loser is
    /// interrupted and its finalizers run before the race returns.
    pub fn race(self, other: Effect<A, E>) -> Effect<A, E> {
        Effect::from_node(race_node(self.node, other.node))
    }

    /// Time-box this effect: `None` if the timer wins and the computation
    /// is interrupted. Built as a race against the timer, not a primitive.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some)
            .race(Effect::<(), E>::sleep(duration).as_value(None))
    }
}

impl Effect<(), Infallible> {
    /// The unit effect.
    pub fn unit() -> Self {
        Self::from_node(Node::SucceedNow(unit_value()))
    }
}

// ============================================================================
// Fork / race plumbing (untyped)
// ============================================================================

fn fork_node<A, E>(inner: Node, daemon: bool) -> Node
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    Node::FlatMap(
        Box::new(Node::Fork {
            inner: Box::new(inner),
            daemon,
        }),
        Box::new(|v| {
            let raw = unbox::<RawFiber>(v);
            Node::SucceedNow(box_value(Fiber::<A, E>::from_raw(raw)))
        }),
    )
}

/// A node that completes with unit once the fiber has an exit.
pub(crate) fn await_done_node(shared: Arc<FiberShared>) -> Node {
    Node::Async(Box::new(move |resume: Resume| {
        shared.on_done(Box::new(move |_exit| {
            resume.deliver(Node::SucceedNow(unit_value()));
        }));
    }))
}

fn race_node(left: Node, right: Node) -> Node {
    Node::FlatMap(
        Box::new(Node::Fork {
            inner: Box::new(left),
            daemon: false,
        }),
        Box::new(move |lv| {
            let lh = unbox::<RawFiber>(lv);
            Node::FlatMap(
                Box::new(Node::Fork {
                    inner: Box::new(right),
                    daemon: false,
                }),
                Box::new(move |rv| {
                    let rh = unbox::<RawFiber>(rv);
                    let (l1, r1) = (lh.clone(), rh.clone());
                    Node::FlatMap(
                        Box::new(Node::Async(Box::new(move |resume: Resume| {
                            let win_l = resume.clone();
                            l1.shared.on_done(Box::new(move |_| {
                                win_l.deliver(Node::SucceedNow(box_value(0usize)));
                            }));
                            r1.shared.on_done(Box::new(move |_| {
                                resume.deliver(Node::SucceedNow(box_value(1usize)));
                            }));
                        }))),
                        Box::new(move |idx| {
                            let (winner, loser) = if unbox::<usize>(idx) == 0 {
                                (lh, rh)
                            } else {
                                (rh, lh)
                            };
                            // Interrupt the loser and wait for its
                            // finalizers before surfacing the winner's exit.
                            Node::FlatMap(
                                Box::new(Node::InterruptSignal(loser.shared.clone())),
                                Box::new(move |_| {
                                    Node::FlatMap(
                                        Box::new(await_done_node(loser.shared)),
                                        Box::new(move |_| {
                                            let exit = winner
                                                .shared
                                                .exit()
                                                .expect("race winner has no exit");
                                            exit_to_node(exit)
                                        }),
                                    )
                                }),
                            )
                        }),
                    )
                }),
            )
        }),
    )
}

// ============================================================================
// Async callback
// ============================================================================

/// Typed one-shot completion handle passed to [`Effect::from_async`]
/// registrations. Cloneable; the first completion wins.
pub struct AsyncCallback<A, E> {
    raw: Resume,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> AsyncCallback<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Complete the suspended effect with a value.
    ///
    /// Returns false if the effect was already completed or interrupted.
    pub fn succeed(&self, a: A) -> bool {
        self.raw.deliver(Node::SucceedNow(box_value(a)))
    }

    /// Complete the suspended effect with a typed failure.
    pub fn fail(&self, e: E) -> bool {
        self.raw
            .deliver(Node::FailCause(Box::new(move || Cause::fail(e))))
    }

    /// Complete the suspended effect with a defect.
    pub fn die(&self, defect: impl Into<Defect>) -> bool {
        let d = defect.into();
        self.raw
            .deliver(Node::FailCause(Box::new(move || Cause::Die(d))))
    }
}

// ============================================================================
// Fiber handle
// ============================================================================

/// Typed handle to a spawned fiber.
pub struct Fiber<A, E = Infallible> {
    pub(crate) raw: RawFiber,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Fiber<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_raw(raw: RawFiber) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    /// The fiber's id.
    pub fn id(&self) -> FiberId {
        self.raw.shared.id()
    }

    /// Wait for the fiber, merge its fiber-scoped references back into the
    /// caller, and surface its exit as this effect's own outcome.
    pub fn join(self) -> Effect<A, E> {
        let shared = self.raw.shared;
        let after = shared.clone();
        Effect::from_node(Node::FlatMap(
            Box::new(await_done_node(shared.clone())),
            Box::new(move |_| {
                Node::FlatMap(
                    Box::new(Node::JoinMerge(shared)),
                    Box::new(move |_| {
                        let exit = after.exit().expect("joined fiber has no exit");
                        exit_to_node(exit)
                    }),
                )
            }),
        ))
    }

    /// Wait for the fiber and return its full [`Exit`] without failing.
    pub fn await_exit(self) -> Effect<Exit<A>, E> {
        let shared = self.raw.shared;
        let after = shared.clone();
        Effect::from_node(Node::FlatMap(
            Box::new(await_done_node(shared)),
            Box::new(move |_| {
                let exit = after.exit().expect("awaited fiber has no exit");
                Node::SucceedNow(box_value(exit.map(unbox::<A>)))
            }),
        ))
    }

    /// Request cancellation and wait for the fiber to wind down, returning
    /// its final exit (which preserves any pre-existing cause).
    pub fn interrupt(self) -> Effect<Exit<A>, E> {
        let shared = self.raw.shared.clone();
        Effect::from_node(Node::FlatMap(
            Box::new(Node::InterruptSignal(shared)),
            Box::new(move |_| self.await_exit().node),
        ))
    }

    /// Peek at the exit without suspending. `None` while still running.
    pub fn poll(&self) -> Option<Exit<A>> {
        self.raw.shared.exit().map(|e| e.map(unbox::<A>))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_box_unbox_round_trip() {
        let v = box_value(41i64);
        assert_eq!(unbox::<i64>(v), 41);
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn test_unbox_mismatch_is_a_bug() {
        let v = box_value("a string");
        let _ = unbox::<i64>(v);
    }

    #[test]
    fn test_exit_to_node_success() {
        let node = exit_to_node(Exit::Success(box_value(5u8)));
        assert!(matches!(node, Node::SucceedNow(_)));
    }

    #[test]
    fn test_descriptions_are_inert() {
        // Constructing a description must not run its closures.
        let _e: Effect<i32, String> = Effect::succeed_with(|| panic!("ran eagerly"));
        let _f: Effect<i32, String> = Effect::fail_with(|| panic!("ran eagerly"));
    }
}
