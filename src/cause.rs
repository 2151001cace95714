//! # Failure Algebra
//!
//! This module defines how the runtime reports the outcome of a fiber.
//!
//! ## Taxonomy
//!
//! - [`Cause::Fail`] — an expected, application-modeled error that typed
//!   handlers may recover from.
//! - [`Cause::Die`] — an unexpected defect (a bug): a panic in user code or
//!   an explicit `die`. Propagates past typed handlers.
//! - [`Cause::Interrupt`] — cooperative cancellation, carrying the id of the
//!   fiber that requested it.
//!
//! Causes compose structurally: `Then` records sequential failures (a
//! finalizer failing while a fiber was already failing), `Both` records
//! parallel ones. `Empty` is the identity for both, so no combinator ever
//! fabricates an empty branch.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::fiber::FiberId;

/// Type-erased error payload carried by a [`Cause::Fail`] leaf.
pub type ErasedError = Arc<dyn Any + Send + Sync>;

// ============================================================================
// Defect
// ============================================================================

/// Payload of a [`Cause::Die`] leaf.
///
/// Panic payloads are flattened to their string message when possible so
/// causes stay cloneable and printable.
#[derive(Debug, Clone)]
pub enum Defect {
    /// A human-readable defect message (panics, invariant violations).
    Message(String),
    /// An arbitrary defect value supplied via `Effect::die`.
    Payload(ErasedError),
}

impl Defect {
    /// Render the defect for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Defect::Message(m) => m.clone(),
            Defect::Payload(_) => "non-string defect payload".to_string(),
        }
    }

    /// Downcast a `Payload` defect to a concrete type.
    pub fn downcast<D: Clone + 'static>(&self) -> Option<D> {
        match self {
            Defect::Message(_) => None,
            Defect::Payload(p) => p.downcast_ref::<D>().cloned(),
        }
    }

    /// Convert a panic payload (as produced by `catch_unwind`) into a defect.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            return Defect::Message((*s).to_string());
        }
        if let Some(s) = payload.downcast_ref::<String>() {
            return Defect::Message(s.clone());
        }
        Defect::Message("panicked with a non-string payload".to_string())
    }
}

impl From<String> for Defect {
    fn from(m: String) -> Self {
        Defect::Message(m)
    }
}

impl From<&str> for Defect {
    fn from(m: &str) -> Self {
        Defect::Message(m.to_string())
    }
}

// ============================================================================
// Cause
// ============================================================================

/// A composable tree of failure reasons.
///
/// Immutable; interior nodes share subtrees via `Arc`, so cloning is cheap
/// and the structure is always a tree, never a graph.
#[derive(Debug, Clone)]
pub enum Cause {
    /// No failure. Identity for [`Cause::then`] and [`Cause::both`].
    Empty,
    /// An expected, typed error.
    Fail(ErasedError),
    /// An unexpected defect.
    Die(Defect),
    /// Cooperative interruption requested by the given fiber.
    Interrupt(FiberId),
    /// Sequential composition: the left cause happened, then the right.
    Then(Arc<Cause>, Arc<Cause>),
    /// Parallel composition: both causes happened independently.
    Both(Arc<Cause>, Arc<Cause>),
}

impl Cause {
    /// A cause carrying a typed error value.
    pub fn fail<E: Send + Sync + 'static>(error: E) -> Self {
        Cause::Fail(Arc::new(error))
    }

    /// A cause carrying a defect.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// A cause carrying an arbitrary defect payload.
    pub fn die_with<D: Any + Send + Sync>(payload: D) -> Self {
        Cause::Die(Defect::Payload(Arc::new(payload)))
    }

    /// An interruption cause.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Sequential combination. `Empty` is the identity on either side.
    pub fn then(first: Cause, second: Cause) -> Cause {
        match (first, second) {
            (Cause::Empty, c) | (c, Cause::Empty) => c,
            (a, b) => Cause::Then(Arc::new(a), Arc::new(b)),
        }
    }

    /// Parallel combination. `Empty` is the identity on either side.
    pub fn both(left: Cause, right: Cause) -> Cause {
        match (left, right) {
            (Cause::Empty, c) | (c, Cause::Empty) => c,
            (a, b) => Cause::Both(Arc::new(a), Arc::new(b)),
        }
    }

    /// True when the cause is `Empty`.
    pub fn is_empty(&self) -> bool {
        matches!(self, Cause::Empty)
    }

    /// True when any leaf is an interruption.
    pub fn is_interrupted(&self) -> bool {
        self.any_leaf(&|c| matches!(c, Cause::Interrupt(_)))
    }

    /// True when any leaf is a defect.
    pub fn is_die(&self) -> bool {
        self.any_leaf(&|c| matches!(c, Cause::Die(_)))
    }

    /// True when any leaf is a typed failure.
    pub fn is_failure(&self) -> bool {
        self.any_leaf(&|c| matches!(c, Cause::Fail(_)))
    }

    /// True when every leaf is a typed failure.
    ///
    /// Typed handlers only fire on such causes; defects and interruptions
    /// propagate past them.
    pub fn is_fail_only(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Fail(_) => true,
            Cause::Die(_) | Cause::Interrupt(_) => false,
            Cause::Then(a, b) | Cause::Both(a, b) => a.is_fail_only() && b.is_fail_only(),
        }
    }

    /// The first typed error in the tree, downcast to `E`.
    pub fn expected<E: Clone + 'static>(&self) -> Option<E> {
        match self {
            Cause::Fail(e) => e.downcast_ref::<E>().cloned(),
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.expected::<E>().or_else(|| b.expected::<E>())
            }
            _ => None,
        }
    }

    /// Rebuild the tree, mapping every typed-error leaf downcastable to `E`
    /// through `f`. Structure, defects and interruptions are untouched.
    pub fn map_expected<E: Clone + 'static, E2: Send + Sync + 'static>(
        &self,
        f: &(impl Fn(E) -> E2 + ?Sized),
    ) -> Cause {
        match self {
            Cause::Fail(e) => match e.downcast_ref::<E>() {
                Some(e) => Cause::fail(f(e.clone())),
                None => Cause::Fail(e.clone()),
            },
            Cause::Then(a, b) => Cause::Then(
                Arc::new(a.map_expected::<E, E2>(f)),
                Arc::new(b.map_expected::<E, E2>(f)),
            ),
            Cause::Both(a, b) => Cause::Both(
                Arc::new(a.map_expected::<E, E2>(f)),
                Arc::new(b.map_expected::<E, E2>(f)),
            ),
            other => other.clone(),
        }
    }

    /// All defects in the tree, left to right.
    pub fn defects(&self) -> Vec<Defect> {
        let mut out = Vec::new();
        self.collect(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d.clone());
            }
        });
        out
    }

    /// All interrupting fiber ids in the tree, left to right.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.collect(&mut |c| {
            if let Cause::Interrupt(id) = c {
                out.push(*id);
            }
        });
        out
    }

    fn any_leaf(&self, pred: &dyn Fn(&Cause) -> bool) -> bool {
        match self {
            Cause::Then(a, b) | Cause::Both(a, b) => a.any_leaf(pred) || b.any_leaf(pred),
            leaf => pred(leaf),
        }
    }

    fn collect(&self, visit: &mut dyn FnMut(&Cause)) {
        match self {
            Cause::Then(a, b) | Cause::Both(a, b) => {
                a.collect(visit);
                b.collect(visit);
            }
            leaf => visit(leaf),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => write!(f, "<empty>"),
            Cause::Fail(_) => write!(f, "fail"),
            Cause::Die(d) => write!(f, "die: {}", d.describe()),
            Cause::Interrupt(id) => write!(f, "interrupted by {}", id),
            Cause::Then(a, b) => write!(f, "({} then {})", a, b),
            Cause::Both(a, b) => write!(f, "({} both {})", a, b),
        }
    }
}

// ============================================================================
// Exit
// ============================================================================

/// Terminal outcome of a fiber. Produced exactly once.
#[derive(Debug, Clone)]
pub enum Exit<A> {
    /// The fiber completed with a value.
    Success(A),
    /// The fiber failed; the full cause tree is preserved.
    Failure(Cause),
}

impl<A> Exit<A> {
    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True when the exit is a failure whose cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(c) if c.is_interrupted())
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c) => Some(c),
        }
    }

    /// Map the success value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c) => Exit::Failure(c),
        }
    }

    /// Convert into a `Result`, losing nothing: the error side is the cause.
    pub fn into_result(self) -> Result<A, Cause> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c) => Err(c),
        }
    }

    /// The success value, or `None`.
    pub fn success(self) -> Option<A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }
}

/// The shape of an exit, as observed by finalizers.
///
/// Finalizers receive this instead of the full [`Exit`] so they can branch
/// on success/failure/interruption without capturing the success value.
#[derive(Debug, Clone)]
pub enum ExitKind {
    /// The guarded region completed with a value.
    Success,
    /// The guarded region failed with the given cause.
    Failure(Cause),
}

impl ExitKind {
    /// True for `Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, ExitKind::Success)
    }

    /// True when the triggering cause contains an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExitKind::Failure(c) if c.is_interrupted())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberId;

    #[test]
    fn test_empty_is_identity() {
        let c = Cause::then(Cause::Empty, Cause::fail("boom"));
        assert!(matches!(c, Cause::Fail(_)));
        let c = Cause::both(Cause::die("bug"), Cause::Empty);
        assert!(matches!(c, Cause::Die(_)));
    }

    #[test]
    fn test_expected_downcast() {
        let c = Cause::then(
            Cause::die("bug"),
            Cause::fail::<String>("late".to_string()),
        );
        assert_eq!(c.expected::<String>(), Some("late".to_string()));
        assert_eq!(c.expected::<i32>(), None);
    }

    #[test]
    fn test_fail_only_classification() {
        let fail = Cause::fail(1i32);
        assert!(fail.is_fail_only());

        let mixed = Cause::both(Cause::fail(1i32), Cause::die("bug"));
        assert!(!mixed.is_fail_only());
        assert!(mixed.is_failure());
        assert!(mixed.is_die());
    }

    #[test]
    fn test_interruptors_collected_in_order() {
        let a = FiberId::for_test(1);
        let b = FiberId::for_test(2);
        let c = Cause::then(Cause::interrupt(a), Cause::interrupt(b));
        assert_eq!(c.interruptors(), vec![a, b]);
        assert!(c.is_interrupted());
    }

    #[test]
    fn test_defect_from_panic_payload() {
        let d = Defect::from_panic(Box::new("oops"));
        assert_eq!(d.describe(), "oops");
        let d = Defect::from_panic(Box::new("formatted oops".to_string()));
        assert_eq!(d.describe(), "formatted oops");
        let d = Defect::from_panic(Box::new(42i32));
        assert!(d.describe().contains("non-string"));
    }

    #[test]
    fn test_exit_helpers() {
        let e: Exit<i32> = Exit::Success(7);
        assert!(e.is_success());
        assert_eq!(e.clone().into_result().unwrap(), 7);
        assert_eq!(e.map(|n| n * 2).success(), Some(14));

        let f: Exit<i32> = Exit::Failure(Cause::interrupt(FiberId::for_test(3)));
        assert!(f.is_interrupted());
        assert!(f.cause().is_some());
    }
}
