//! # Fibers and the Effect Interpreter
//!
//! A fiber is a lightweight, cooperatively-scheduled logical thread that
//! interprets one effect description to completion. The interpreter keeps
//! an explicit stack of pending continuations (never the host call stack),
//! so arbitrarily deep `flat_map` chains run in constant native stack
//! depth.
//!
//! ## Turn protocol
//!
//! The scheduler hands a fiber to [`FiberExec::run_turn`] with a step
//! budget. A turn ends in one of three ways:
//!
//! - `Done(exit)` — the fiber finished; its exit was recorded exactly once
//!   and waiters were notified.
//! - `Yielded` — the budget ran out (or the fiber yielded explicitly); it
//!   is immediately runnable again.
//! - `Suspended` — the fiber parked on an async registration or an STM
//!   retry; whatever satisfies the suspension re-queues it.
//!
//! ## Interruption
//!
//! Interruption is a latched signal checked at every interpreter step while
//! the mask counter is zero. A signaled fiber abandons its continuation
//! stack, running the finalizer frames it passes (each masked while it
//! runs), and exits with an `Interrupt` cause — combined with `Then` into
//! any cause it was already failing with.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect, Exit, ExitKind};
use crate::effect::{unit_value, Cont, FailCont, FinalizerFn, Node, Value};
use crate::fiber_ref::ErasedRef;
use crate::scheduler::SchedulerCore;
use crate::scope::Scope;
use crate::stm;

// ============================================================================
// Identity
// ============================================================================

/// Unique fiber identity: a monotonic sequence number plus the creation
/// time, used for ordering and interrupt attribution.
#[derive(Debug, Clone, Copy)]
pub struct FiberId {
    seq: u64,
    started_at: Instant,
}

static NEXT_FIBER_SEQ: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    pub(crate) fn next() -> Self {
        Self {
            seq: NEXT_FIBER_SEQ.fetch_add(1, Ordering::Relaxed),
            started_at: Instant::now(),
        }
    }

    /// The raw sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// When the fiber was created.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    #[cfg(test)]
    pub(crate) fn for_test(seq: u64) -> Self {
        Self {
            seq,
            started_at: Instant::now(),
        }
    }
}

impl PartialEq for FiberId {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for FiberId {}

impl std::hash::Hash for FiberId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.seq.hash(state);
    }
}

impl PartialOrd for FiberId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FiberId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.seq)
    }
}

// ============================================================================
// Shared fiber state
// ============================================================================

/// One-shot callback invoked with the fiber's exit.
pub(crate) type DoneWaiter = Box<dyn FnOnce(Exit<Value>) + Send>;

/// State of the fiber's single async resume slot.
pub(crate) enum ResumeSlot {
    /// No suspension pending; stale deliveries are dropped.
    Idle,
    /// An async registration is running on the owning worker.
    Registering,
    /// The fiber is parked, waiting for a delivery.
    Waiting,
    /// A node was delivered and will resume the fiber.
    Delivered(Node),
}

struct SharedState {
    exit: Option<Exit<Value>>,
    waiters: Vec<DoneWaiter>,
    interrupter: Option<FiberId>,
    children: HashMap<u64, Weak<FiberShared>>,
    resume: ResumeSlot,
    /// Bumped on every new suspension so stale resumes can be refused.
    resume_epoch: u64,
    final_refs: Option<FiberRefs>,
}

/// Cross-thread view of a fiber: exit cell, interrupt signal, supervision
/// links and the async resume slot. The execution state itself
/// ([`FiberExec`]) is owned by at most one worker at a time.
pub(crate) struct FiberShared {
    id: FiberId,
    state: Mutex<SharedState>,
    interrupted: AtomicBool,
    /// Mirror of the interpreter's mask counter, so an interrupter can tell
    /// whether a parked fiber may be woken with a cancellation.
    mask_depth: AtomicU32,
}

impl FiberShared {
    pub(crate) fn new(id: FiberId) -> Self {
        Self {
            id,
            state: Mutex::new(SharedState {
                exit: None,
                waiters: Vec::new(),
                interrupter: None,
                children: HashMap::new(),
                resume: ResumeSlot::Idle,
                resume_epoch: 0,
                final_refs: None,
            }),
            interrupted: AtomicBool::new(false),
            mask_depth: AtomicU32::new(0),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn exit(&self) -> Option<Exit<Value>> {
        self.state.lock().exit.clone()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().exit.is_some()
    }

    pub(crate) fn interrupt_requested(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn interrupter(&self) -> Option<FiberId> {
        self.state.lock().interrupter
    }

    /// Register a completion callback; runs immediately if already done.
    pub(crate) fn on_done(&self, waiter: DoneWaiter) {
        let exit = {
            let mut st = self.state.lock();
            match &st.exit {
                Some(exit) => exit.clone(),
                None => {
                    st.waiters.push(waiter);
                    return;
                }
            }
        };
        waiter(exit);
    }

    /// Record the exit exactly once and notify waiters. A second call is a
    /// defect in the interpreter and is ignored.
    fn complete(&self, exit: Exit<Value>, final_refs: FiberRefs) {
        let waiters = {
            let mut st = self.state.lock();
            if st.exit.is_some() {
                return;
            }
            st.exit = Some(exit.clone());
            st.final_refs = Some(final_refs);
            st.children.clear();
            st.resume = ResumeSlot::Idle;
            mem::take(&mut st.waiters)
        };
        for w in waiters {
            w(exit.clone());
        }
    }

    pub(crate) fn final_refs(&self) -> Option<FiberRefs> {
        self.state.lock().final_refs.clone()
    }

    pub(crate) fn add_child(&self, child: &Arc<FiberShared>) {
        let mut st = self.state.lock();
        if st.exit.is_some() {
            return;
        }
        st.children.retain(|_, w| w.strong_count() > 0);
        st.children.insert(child.id.seq, Arc::downgrade(child));
    }

    /// Latch the interrupt signal, fan it out to live children, and wake
    /// the fiber if it is parked and currently interruptible.
    pub(crate) fn signal_interrupt(&self, by: FiberId, core: &Arc<SchedulerCore>) {
        if self.is_done() {
            return;
        }
        let children: Vec<Arc<FiberShared>> = {
            let mut st = self.state.lock();
            if st.interrupter.is_none() {
                st.interrupter = Some(by);
            }
            st.children.values().filter_map(Weak::upgrade).collect()
        };
        self.interrupted.store(true, Ordering::Release);
        for child in children {
            child.signal_interrupt(by, core);
        }
        if self.mask_depth.load(Ordering::Acquire) == 0 {
            let woken = {
                let mut st = self.state.lock();
                match st.resume {
                    // Parked: deliver the cancellation and re-queue.
                    ResumeSlot::Waiting => {
                        st.resume =
                            ResumeSlot::Delivered(Node::FailCause(Box::new(move || {
                                Cause::interrupt(by)
                            })));
                        true
                    }
                    // Mid-registration: the owning worker's park check
                    // consumes this without a wake.
                    ResumeSlot::Registering => {
                        st.resume =
                            ResumeSlot::Delivered(Node::FailCause(Box::new(move || {
                                Cause::interrupt(by)
                            })));
                        false
                    }
                    ResumeSlot::Idle | ResumeSlot::Delivered(_) => false,
                }
            };
            if woken {
                core.wake(self.id);
            }
        }
    }

    /// Open a new suspension epoch and return it. Called by the owning
    /// worker before an async registration or STM park.
    pub(crate) fn begin_suspension(&self, slot: ResumeSlot) -> u64 {
        let mut st = self.state.lock();
        st.resume_epoch += 1;
        st.resume = slot;
        st.resume_epoch
    }

    /// Take a delivered resumption, if one is pending for this epoch.
    pub(crate) fn take_delivery(&self) -> Option<Node> {
        let mut st = self.state.lock();
        if matches!(st.resume, ResumeSlot::Delivered(_)) {
            match mem::replace(&mut st.resume, ResumeSlot::Idle) {
                ResumeSlot::Delivered(n) => Some(n),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    /// Transition `Registering` → `Waiting` if nothing was delivered
    /// synchronously. Returns the delivered node otherwise.
    pub(crate) fn park_or_take(&self) -> Option<Node> {
        let mut st = self.state.lock();
        match mem::replace(&mut st.resume, ResumeSlot::Waiting) {
            ResumeSlot::Delivered(n) => {
                st.resume = ResumeSlot::Idle;
                Some(n)
            }
            _ => None,
        }
    }

    fn deliver(&self, epoch: u64, node: Node, core: &Arc<SchedulerCore>) -> bool {
        let (accepted, parked) = {
            let mut st = self.state.lock();
            if st.resume_epoch != epoch || st.exit.is_some() {
                (false, false)
            } else {
                match st.resume {
                    ResumeSlot::Registering => {
                        st.resume = ResumeSlot::Delivered(node);
                        (true, false)
                    }
                    ResumeSlot::Waiting => {
                        st.resume = ResumeSlot::Delivered(node);
                        (true, true)
                    }
                    ResumeSlot::Idle | ResumeSlot::Delivered(_) => (false, false),
                }
            }
        };
        if parked {
            core.wake(self.id);
        }
        accepted
    }
}

// ============================================================================
// Resume handle
// ============================================================================

/// One-shot, cloneable resumption handle for a suspended fiber.
///
/// Carries the suspension epoch it was created for; deliveries against a
/// later suspension (or after completion) are refused, so a stale timer or
/// STM wakeup can never resume the wrong wait.
pub(crate) struct Resume {
    target: Arc<FiberShared>,
    core: Arc<SchedulerCore>,
    epoch: u64,
    fired: Arc<AtomicBool>,
}

impl Clone for Resume {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            core: self.core.clone(),
            epoch: self.epoch,
            fired: self.fired.clone(),
        }
    }
}

impl Resume {
    pub(crate) fn new(target: Arc<FiberShared>, core: Arc<SchedulerCore>, epoch: u64) -> Self {
        Self {
            target,
            core,
            epoch,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SchedulerCore> {
        &self.core
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Deliver the resumption node. The first delivery wins.
    pub(crate) fn deliver(&self, node: Node) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.target.deliver(self.epoch, node, &self.core)
    }
}

/// Untyped handle to a spawned fiber, boxed into effect values.
#[derive(Clone)]
pub(crate) struct RawFiber {
    pub(crate) shared: Arc<FiberShared>,
    pub(crate) core: Arc<SchedulerCore>,
}

// ============================================================================
// Fiber-scoped references
// ============================================================================

/// Per-fiber map of fiber-reference values.
///
/// Forking snapshots the whole map (cheap `Arc` clones); joining merges the
/// child's final values back through each reference's combine function.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
    entries: HashMap<u64, RefEntry>,
}

#[derive(Clone)]
struct RefEntry {
    value: Value,
    initial: Value,
    combine: Arc<crate::fiber_ref::CombineFn>,
}

impl FiberRefs {
    pub(crate) fn get(&self, r: &ErasedRef) -> Value {
        self.entries
            .get(&r.id)
            .map(|e| e.value.clone())
            .unwrap_or_else(|| r.initial.clone())
    }

    pub(crate) fn set(&mut self, r: &ErasedRef, value: Value) {
        self.entries.insert(
            r.id,
            RefEntry {
                value,
                initial: r.initial.clone(),
                combine: r.combine.clone(),
            },
        );
    }

    pub(crate) fn merge_child(&mut self, child: &FiberRefs) {
        for (id, centry) in &child.entries {
            let parent_value = self
                .entries
                .get(id)
                .map(|e| e.value.clone())
                .unwrap_or_else(|| centry.initial.clone());
            let merged = (centry.combine)(parent_value, centry.value.clone());
            self.entries.insert(
                *id,
                RefEntry {
                    value: merged,
                    initial: centry.initial.clone(),
                    combine: centry.combine.clone(),
                },
            );
        }
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// A frame on the explicit continuation stack.
pub(crate) enum Frame {
    /// Apply on success; discarded on failure.
    Continue(Cont),
    /// Error boundary from a `Fold` node.
    Fold {
        on_success: Cont,
        on_failure: FailCont,
        typed_only: bool,
    },
    /// Finalizer from an `Ensuring` node; runs on every exit path.
    Finalizer(FinalizerFn),
    /// Exiting a masked region.
    RestoreMask,
}

enum Step {
    Eval(Node),
    Apply(Value),
    Unwind(Cause),
    Parked,
}

/// Outcome of one scheduler turn.
pub(crate) enum TurnResult {
    Done(Exit<Value>),
    Yielded,
    Suspended,
}

/// The execution state of one fiber: current step, continuation stack,
/// fiber-reference map, root scope and interrupt mask. Owned by at most one
/// worker at a time.
pub(crate) struct FiberExec {
    pub(crate) shared: Arc<FiberShared>,
    step: Step,
    stack: Vec<Frame>,
    refs: FiberRefs,
    scope: Scope,
    mask: u32,
    interrupt_observed: bool,
}

fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, Cause> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|p| Cause::Die(Defect::from_panic(p)))
}

impl FiberExec {
    pub(crate) fn new(
        shared: Arc<FiberShared>,
        node: Node,
        refs: FiberRefs,
        scope: Scope,
    ) -> Self {
        Self {
            shared,
            step: Step::Eval(node),
            stack: Vec::new(),
            refs,
            scope,
            mask: 0,
            interrupt_observed: false,
        }
    }

    pub(crate) fn resume_with(&mut self, node: Node) {
        self.step = Step::Eval(node);
    }

    fn set_mask(&mut self, mask: u32) {
        self.mask = mask;
        self.shared.mask_depth.store(mask, Ordering::Release);
    }

    /// Interpret for at most `budget` steps.
    pub(crate) fn run_turn(&mut self, core: &Arc<SchedulerCore>, budget: usize) -> TurnResult {
        let mut ops = 0usize;
        loop {
            // Interrupt checkpoint: latched signal, zero mask, not yet
            // acted upon.
            if self.mask == 0
                && !self.interrupt_observed
                && self.shared.interrupt_requested()
            {
                self.interrupt_observed = true;
                let by = self.shared.interrupter().unwrap_or_else(|| self.shared.id());
                self.step = match mem::replace(&mut self.step, Step::Parked) {
                    Step::Unwind(c) if c.is_interrupted() => Step::Unwind(c),
                    Step::Unwind(c) => {
                        Step::Unwind(Cause::then(c, Cause::interrupt(by)))
                    }
                    _ => Step::Unwind(Cause::interrupt(by)),
                };
            }

            if ops >= budget {
                return TurnResult::Yielded;
            }
            ops += 1;

            match mem::replace(&mut self.step, Step::Parked) {
                Step::Eval(node) => {
                    if let Some(result) = self.eval(node, core) {
                        return result;
                    }
                }
                Step::Apply(value) => {
                    if let Some(result) = self.apply(value) {
                        return result;
                    }
                }
                Step::Unwind(cause) => {
                    if let Some(result) = self.unwind(cause) {
                        return result;
                    }
                }
                Step::Parked => {
                    // A parked fiber must be resumed through its slot.
                    return self.finish(Exit::Failure(Cause::die(
                        "fiber executed without a pending step",
                    )));
                }
            }
        }
    }

    fn eval(&mut self, node: Node, core: &Arc<SchedulerCore>) -> Option<TurnResult> {
        match node {
            Node::SucceedNow(v) => self.step = Step::Apply(v),
            Node::Sync(f) => match guarded(f) {
                Ok(v) => self.step = Step::Apply(v),
                Err(c) => self.step = Step::Unwind(c),
            },
            Node::FailCause(f) => match guarded(f) {
                Ok(c) => self.step = Step::Unwind(c),
                Err(c) => self.step = Step::Unwind(c),
            },
            Node::Defer(f) => match guarded(f) {
                Ok(n) => self.step = Step::Eval(n),
                Err(c) => self.step = Step::Unwind(c),
            },
            Node::FlatMap(inner, k) => {
                self.stack.push(Frame::Continue(k));
                self.step = Step::Eval(*inner);
            }
            Node::Fold {
                inner,
                on_success,
                on_failure,
                typed_only,
            } => {
                self.stack.push(Frame::Fold {
                    on_success,
                    on_failure,
                    typed_only,
                });
                self.step = Step::Eval(*inner);
            }
            Node::Ensuring { inner, finalizer } => {
                self.stack.push(Frame::Finalizer(finalizer));
                self.step = Step::Eval(*inner);
            }
            Node::Masked(inner) => {
                self.set_mask(self.mask + 1);
                self.stack.push(Frame::RestoreMask);
                self.step = Step::Eval(*inner);
            }
            Node::YieldNow => {
                self.step = Step::Apply(unit_value());
                return Some(TurnResult::Yielded);
            }
            Node::Async(register) => {
                let epoch = self.shared.begin_suspension(ResumeSlot::Registering);
                let resume = Resume::new(self.shared.clone(), core.clone(), epoch);
                if let Err(c) = guarded(move || register(resume)) {
                    // Registration itself blew up: abandon the suspension.
                    self.shared.begin_suspension(ResumeSlot::Idle);
                    self.step = Step::Unwind(c);
                    return None;
                }
                match self.shared.park_or_take() {
                    Some(n) => self.step = Step::Eval(n),
                    None => return Some(TurnResult::Suspended),
                }
            }
            Node::Fork { inner, daemon } => {
                let raw = core.spawn_fiber(
                    *inner,
                    Some((&self.shared, &self.refs)),
                    daemon,
                );
                self.step = Step::Apply(Arc::new(raw));
            }
            Node::GetRef(r) => {
                let v = self.refs.get(&r);
                self.step = Step::Apply(v);
            }
            Node::SetRef(r, v) => {
                self.refs.set(&r, v);
                self.step = Step::Apply(unit_value());
            }
            Node::JoinMerge(child) => {
                if let Some(child_refs) = child.final_refs() {
                    self.refs.merge_child(&child_refs);
                }
                self.step = Step::Apply(unit_value());
            }
            Node::InterruptSignal(target) => {
                target.signal_interrupt(self.shared.id(), core);
                self.step = Step::Apply(unit_value());
            }
            Node::WithScope(f) => {
                let scope = self.scope.clone();
                match guarded(move || f(scope)) {
                    Ok(n) => self.step = Step::Eval(n),
                    Err(c) => self.step = Step::Unwind(c),
                }
            }
            Node::Commit(stm_node) => match stm::commit_step(&stm_node, self, core) {
                stm::CommitStep::Done(v) => self.step = Step::Apply(v),
                stm::CommitStep::Failed(c) => self.step = Step::Unwind(c),
                stm::CommitStep::Blocked => return Some(TurnResult::Suspended),
                stm::CommitStep::Resume(n) => self.step = Step::Eval(n),
            },
        }
        None
    }

    fn apply(&mut self, value: Value) -> Option<TurnResult> {
        match self.stack.pop() {
            None => return Some(self.finish(Exit::Success(value))),
            Some(Frame::Continue(k)) | Some(Frame::Fold { on_success: k, .. }) => {
                match guarded(move || k(value)) {
                    Ok(n) => self.step = Step::Eval(n),
                    Err(c) => self.step = Step::Unwind(c),
                }
            }
            Some(Frame::Finalizer(fin)) => {
                let fin_node = match guarded(move || fin(ExitKind::Success)) {
                    Ok(n) => n,
                    Err(c) => Node::FailCause(Box::new(move || c)),
                };
                self.step = Step::Eval(Node::Fold {
                    inner: Box::new(Node::Masked(Box::new(fin_node))),
                    on_success: Box::new(move |_| Node::SucceedNow(value)),
                    on_failure: Box::new(move |c| Node::FailCause(Box::new(move || c))),
                    typed_only: false,
                });
            }
            Some(Frame::RestoreMask) => {
                self.set_mask(self.mask - 1);
                self.step = Step::Apply(value);
            }
        }
        None
    }

    fn unwind(&mut self, cause: Cause) -> Option<TurnResult> {
        match self.stack.pop() {
            None => return Some(self.finish(Exit::Failure(cause))),
            Some(Frame::Continue(_)) => self.step = Step::Unwind(cause),
            Some(Frame::Fold {
                on_failure,
                typed_only,
                ..
            }) => {
                if typed_only && !cause.is_fail_only() {
                    self.step = Step::Unwind(cause);
                } else {
                    match guarded(move || on_failure(cause)) {
                        Ok(n) => self.step = Step::Eval(n),
                        Err(c) => self.step = Step::Unwind(c),
                    }
                }
            }
            Some(Frame::Finalizer(fin)) => {
                let kind = ExitKind::Failure(cause.clone());
                let fin_node = match guarded(move || fin(kind)) {
                    Ok(n) => n,
                    Err(c) => Node::FailCause(Box::new(move || c)),
                };
                let refail = cause.clone();
                self.step = Step::Eval(Node::Fold {
                    inner: Box::new(Node::Masked(Box::new(fin_node))),
                    on_success: Box::new(move |_| {
                        Node::FailCause(Box::new(move || refail))
                    }),
                    on_failure: Box::new(move |c2| {
                        Node::FailCause(Box::new(move || Cause::both(cause, c2)))
                    }),
                    typed_only: false,
                });
            }
            Some(Frame::RestoreMask) => {
                self.set_mask(self.mask - 1);
                self.step = Step::Unwind(cause);
            }
        }
        None
    }

    fn finish(&mut self, exit: Exit<Value>) -> TurnResult {
        // A signal that raced with completion is still preserved in the
        // cause, never silently dropped. A signal the fiber already acted
        // on (and possibly recovered from) is not appended twice.
        let exit = match exit {
            Exit::Failure(c)
                if self.shared.interrupt_requested()
                    && !self.interrupt_observed
                    && !c.is_interrupted() =>
            {
                let by = self.shared.interrupter().unwrap_or_else(|| self.shared.id());
                Exit::Failure(Cause::then(c, Cause::interrupt(by)))
            }
            other => other,
        };
        self.shared
            .complete(exit.clone(), mem::take(&mut self.refs));
        TurnResult::Done(exit)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fiber_id_ordering() {
        let a = FiberId::next();
        let b = FiberId::next();
        assert!(a < b);
        assert_ne!(a, b);
        assert_eq!(format!("{}", a), format!("Fiber({})", a.seq()));
    }

    #[test]
    fn test_shared_exit_is_one_shot() {
        let shared = FiberShared::new(FiberId::next());
        shared.complete(Exit::Success(unit_value()), FiberRefs::default());
        shared.complete(
            Exit::Failure(Cause::die("second exit must be ignored")),
            FiberRefs::default(),
        );
        assert!(shared.exit().expect("exit recorded").is_success());
    }

    #[test]
    fn test_on_done_after_completion_fires_immediately() {
        use std::sync::atomic::AtomicBool;
        let shared = FiberShared::new(FiberId::next());
        shared.complete(Exit::Success(unit_value()), FiberRefs::default());

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        shared.on_done(Box::new(move |_| fired2.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stale_epoch_delivery_refused() {
        let shared = FiberShared::new(FiberId::next());
        let first = shared.begin_suspension(ResumeSlot::Waiting);
        // A new suspension supersedes the first.
        let _second = shared.begin_suspension(ResumeSlot::Waiting);

        let mut st = shared.state.lock();
        assert_ne!(st.resume_epoch, first);
        // Stale delivery must not overwrite the live slot.
        drop(st);
        let accepted = {
            let st = shared.state.lock();
            st.resume_epoch == first
        };
        assert!(!accepted);
    }

    #[test]
    fn test_fiber_refs_merge_uses_combine() {
        let r = ErasedRef::for_test(
            Arc::new(0i64),
            Arc::new(|p: Value, c: Value| {
                let p = *p.downcast_ref::<i64>().unwrap();
                let c = *c.downcast_ref::<i64>().unwrap();
                Arc::new(p + c) as Value
            }),
        );
        let mut parent = FiberRefs::default();
        parent.set(&r, Arc::new(10i64));

        let mut child = parent.clone();
        child.set(&r, Arc::new(32i64));

        parent.merge_child(&child);
        let v = parent.get(&r);
        assert_eq!(*v.downcast_ref::<i64>().unwrap(), 42);
    }
}
