//! # Fiber-Scoped References
//!
//! A [`FiberRef`] is a mutable cell whose value is scoped to a fiber rather
//! than shared between them. Reads and writes never contend: each fiber
//! carries its own copy of the value. Forking a fiber snapshots the parent's
//! values; joining a fiber merges the child's final values back into the
//! parent through the reference's combine function.
//!
//! The default combine keeps the child's value — a joined child behaves as
//! a continuation of the parent. `new_with` installs a custom merge (for
//! example summing counters from forked workers).

use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::effect::{box_value, unbox, unit_value, Effect, Node, Value};

/// Merge function applied at join: `(parent_value, child_value) -> merged`.
pub(crate) type CombineFn = dyn Fn(Value, Value) -> Value + Send + Sync;

/// Type-erased identity and semantics of one fiber reference.
pub(crate) struct ErasedRef {
    pub(crate) id: u64,
    pub(crate) initial: Value,
    pub(crate) combine: Arc<CombineFn>,
}

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

impl ErasedRef {
    fn new(initial: Value, combine: Arc<CombineFn>) -> Self {
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            initial,
            combine,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(initial: Value, combine: Arc<CombineFn>) -> Self {
        Self::new(initial, combine)
    }
}

/// A fiber-scoped reference to a value of type `A`.
///
/// Cloning the handle refers to the same underlying reference; the value it
/// resolves to depends on which fiber reads it.
pub struct FiberRef<A> {
    erased: Arc<ErasedRef>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for FiberRef<A> {
    fn clone(&self) -> Self {
        Self {
            erased: self.erased.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> FiberRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// A reference with the given initial value and child-wins join
    /// semantics.
    pub fn new(initial: A) -> Self {
        Self::new_with(initial, |_parent, child| child)
    }

    /// A reference with a custom merge applied when a forked child is
    /// joined back.
    pub fn new_with(initial: A, combine: impl Fn(A, A) -> A + Send + Sync + 'static) -> Self {
        let erased = ErasedRef::new(
            box_value(initial),
            Arc::new(move |p: Value, c: Value| box_value(combine(unbox::<A>(p), unbox::<A>(c)))),
        );
        Self {
            erased: Arc::new(erased),
            _marker: PhantomData,
        }
    }

    /// Read the current fiber's value.
    pub fn get(&self) -> Effect<A> {
        Effect::from_node(Node::GetRef(self.erased.clone()))
    }

    /// Replace the current fiber's value.
    pub fn set(&self, value: A) -> Effect<()> {
        Effect::from_node(Node::SetRef(self.erased.clone(), box_value(value)))
    }

    /// Apply `f` to the current fiber's value.
    pub fn update(&self, f: impl FnOnce(A) -> A + Send + 'static) -> Effect<()> {
        let erased = self.erased.clone();
        self.get().flat_map(move |a| {
            Effect::from_node(Node::SetRef(erased, box_value(f(a))))
        })
    }

    /// Run `inner` with the reference set to `value`, restoring the previous
    /// value afterwards on every exit path.
    pub fn locally<B, E>(&self, value: A, inner: Effect<B, E>) -> Effect<B, E>
    where
        B: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let erased = self.erased.clone();
        let restore_ref = self.erased.clone();
        Effect::from_node(Node::FlatMap(
            Box::new(Node::GetRef(erased.clone())),
            Box::new(move |saved| {
                Node::FlatMap(
                    Box::new(Node::SetRef(erased, box_value(value))),
                    Box::new(move |_| Node::Ensuring {
                        inner: Box::new(inner.node),
                        finalizer: Box::new(move |_exit| {
                            Node::FlatMap(
                                Box::new(Node::SetRef(restore_ref, saved)),
                                Box::new(|_| Node::SucceedNow(unit_value())),
                            )
                        }),
                    }),
                )
            }),
        ))
    }
}

impl<A> FiberRef<A> {
    pub(crate) fn erased(&self) -> &Arc<ErasedRef> {
        &self.erased
    }
}

// Effects built from a FiberRef never fail on their own.
impl<A> FiberRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// `get` widened to an arbitrary error type, for use inside fallible
    /// pipelines.
    pub fn get_with<E>(&self) -> Effect<A, E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let e: Effect<A, Infallible> = self.get();
        Effect::from_node(e.node)
    }
}
