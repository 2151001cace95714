//! # Scopes and Finalization
//!
//! A [`Scope`] collects finalizers that must run when a region of the
//! program ends, whatever way it ends. Every spawned fiber owns a root scope
//! closed at the fiber boundary; [`Effect::scoped`](crate::Effect::scoped)
//! opens a child scope attached to the current one.
//!
//! Closing is idempotent and total: children close before the scope's own
//! finalizers, finalizers run most-recently-added first, each runs masked,
//! and a finalizer's own failure joins the aggregate cause without stopping
//! the rest. The whole close runs as one masked region, so an interrupt
//! arriving mid-close cannot skip cleanup.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, ExitKind};
use crate::effect::{box_value, unbox, unit_value, Effect, FinalizerFn, Node, Value};

// ============================================================================
// State
// ============================================================================

enum Status {
    Open,
    /// Finalizers have been snapshotted and are running.
    Closing,
    Closed,
}

struct ScopeState {
    status: Status,
    finalizers: Vec<FinalizerFn>,
    children: Vec<Scope>,
    /// Exit the scope was closed with, for late finalizers.
    recorded_kind: Option<ExitKind>,
    /// Aggregate finalizer failure, replayed by an idempotent second close.
    recorded_cause: Option<Cause>,
}

/// A region whose finalizers run exactly once when it closes.
#[derive(Clone)]
pub struct Scope {
    inner: Arc<Mutex<ScopeState>>,
}

impl Scope {
    /// A fresh, unattached scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScopeState {
                status: Status::Open,
                finalizers: Vec::new(),
                children: Vec::new(),
                recorded_kind: None,
                recorded_cause: None,
            })),
        }
    }

    /// A child scope closed by its parent (children first) if still open
    /// when the parent closes.
    pub fn child_of(parent: &Scope) -> Self {
        let child = Scope::new();
        let mut st = parent.inner.lock();
        if matches!(st.status, Status::Open) {
            st.children.push(child.clone());
        }
        child
    }

    /// Register a finalizer given the closing exit.
    ///
    /// If the scope is already closed, the finalizer runs immediately
    /// (masked) with the recorded exit instead of being stored.
    pub fn add_finalizer<E>(
        &self,
        f: impl FnOnce(ExitKind) -> Effect<(), E> + Send + 'static,
    ) -> Effect<()>
    where
        E: Clone + Send + Sync + 'static,
    {
        let scope = self.clone();
        Effect::from_node(Node::Defer(Box::new(move || {
            let mut f = Some(f);
            let kind = {
                let mut st = scope.inner.lock();
                match st.status {
                    Status::Open => {
                        let f = f.take().expect("finalizer consumed once");
                        st.finalizers.push(Box::new(move |kind| f(kind).node));
                        None
                    }
                    // Already draining (or drained): the stored list will
                    // never be consulted again, so run in place.
                    Status::Closing | Status::Closed => {
                        Some(st.recorded_kind.clone().unwrap_or(ExitKind::Success))
                    }
                }
            };
            match kind {
                None => Node::SucceedNow(unit_value()),
                Some(kind) => {
                    let f = f.take().expect("finalizer consumed once");
                    Node::Masked(Box::new(swallow(f(kind).node)))
                }
            }
        })))
    }

    /// Close the scope with the given exit.
    ///
    /// Drains children and finalizers exactly once; a second close replays
    /// the recorded aggregate without running anything.
    pub fn close(&self, kind: ExitKind) -> Effect<()> {
        Effect::from_node(Node::Masked(Box::new(close_node(self.clone(), kind))))
    }

    fn is_closed(&self) -> bool {
        matches!(self.inner.lock().status, Status::Closed)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Close sequencing
// ============================================================================

/// Map any outcome of `node` to unit.
fn swallow(node: Node) -> Node {
    Node::Fold {
        inner: Box::new(node),
        on_success: Box::new(|_| Node::SucceedNow(unit_value())),
        on_failure: Box::new(|_| Node::SucceedNow(unit_value())),
        typed_only: false,
    }
}

/// The close sequence as a node. Built lazily so status is inspected at
/// execution time, not description time.
pub(crate) fn close_node(scope: Scope, kind: ExitKind) -> Node {
    Node::Defer(Box::new(move || {
        let steps = {
            let mut st = scope.inner.lock();
            match st.status {
                Status::Closed => {
                    return match st.recorded_cause.clone() {
                        Some(c) => Node::FailCause(Box::new(move || c)),
                        None => Node::SucceedNow(unit_value()),
                    };
                }
                // Re-entrant close from inside a finalizer: the drain is
                // already in progress above us.
                Status::Closing => return Node::SucceedNow(unit_value()),
                Status::Open => {}
            }
            st.status = Status::Closing;
            st.recorded_kind = Some(kind.clone());

            let children = std::mem::take(&mut st.children);
            let mut finalizers = std::mem::take(&mut st.finalizers);

            let mut steps: VecDeque<Node> = VecDeque::new();
            for child in children {
                if !child.is_closed() {
                    steps.push_back(close_node(child, kind.clone()));
                }
            }
            // Most-recently-added first.
            while let Some(fin) = finalizers.pop() {
                let k = kind.clone();
                steps.push_back(Node::Defer(Box::new(move || fin(k))));
            }
            steps
        };
        run_steps(scope, steps, None)
    }))
}

/// Run close steps in order, folding each outcome into the aggregate so a
/// failing step never stops the ones after it.
fn run_steps(scope: Scope, mut steps: VecDeque<Node>, acc: Option<Cause>) -> Node {
    let step = match steps.pop_front() {
        Some(step) => step,
        None => {
            let mut st = scope.inner.lock();
            st.status = Status::Closed;
            st.recorded_cause = acc.clone();
            return match acc {
                Some(c) => Node::FailCause(Box::new(move || c)),
                None => Node::SucceedNow(unit_value()),
            };
        }
    };
    Node::FlatMap(
        Box::new(Node::Fold {
            inner: Box::new(step),
            on_success: Box::new(|_| Node::SucceedNow(box_value(None::<Cause>))),
            on_failure: Box::new(|c| Node::SucceedNow(box_value(Some(c)))),
            typed_only: false,
        }),
        Box::new(move |outcome: Value| {
            let acc = match (acc, unbox::<Option<Cause>>(outcome)) {
                (a, None) => a,
                (None, Some(b)) => Some(b),
                (Some(a), Some(b)) => Some(Cause::both(a, b)),
            };
            run_steps(scope, steps, acc)
        }),
    )
}

/// Run `body` inside `scope`, closing it on every exit path. The interpreter
/// masks the finalizer frame, so the close sequence cannot be interrupted.
pub(crate) fn wrap_with_scope(body: Node, scope: Scope) -> Node {
    Node::Ensuring {
        inner: Box::new(body),
        finalizer: Box::new(move |kind| close_node(scope, kind)),
    }
}
