//! # Software Transactional Memory
//!
//! Optimistic, versioned transactions over [`TRef`] cells. A transaction is
//! a cloneable, re-runnable description ([`Stm`]); committing it (via
//! [`Effect::atomically`](crate::Effect::atomically)) runs attempts against
//! a private journal until one validates.
//!
//! ## Attempt protocol
//!
//! Each attempt starts with an empty journal. Reads consult the journal
//! first, then snapshot the committed cell (recording its version); writes
//! stay in the journal. At the end, a single global commit mutex guards
//! validate-and-apply: if any read version moved, the attempt is discarded
//! and re-run — conflicts never surface as errors.
//!
//! ## Blocking retry
//!
//! `retry` parks the fiber until a cell it read is committed by another
//! transaction. The read set is re-validated under the commit mutex before
//! waiters are registered, so a commit that lands between the attempt and
//! the park re-runs immediately instead of being lost.

use std::any::Any;
use std::collections::HashMap;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::{Cause, Defect};
use crate::effect::{box_value, unbox, unit_value, Node, Value};
use crate::fiber::{FiberExec, Resume, ResumeSlot};
use crate::scheduler::SchedulerCore;

/// The one place the engine requires true mutual exclusion: all
/// validate-and-apply sections serialize through this lock.
static COMMIT: Mutex<()> = Mutex::new(());

// ============================================================================
// Cells
// ============================================================================

static NEXT_CELL_ID: AtomicU64 = AtomicU64::new(1);

/// A parked transaction waiting for one of its read cells to change.
struct TxWaiter {
    resume: Resume,
    node: Arc<StmNode>,
}

struct CellState {
    value: Value,
    version: u64,
    waiters: Vec<TxWaiter>,
}

/// Type-erased versioned cell shared by all clones of a [`TRef`].
pub(crate) struct TCellErased {
    id: u64,
    state: Mutex<CellState>,
}

impl TCellErased {
    fn new(value: Value) -> Self {
        Self {
            id: NEXT_CELL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(CellState {
                value,
                version: 0,
                waiters: Vec::new(),
            }),
        }
    }
}

// ============================================================================
// Transaction descriptions
// ============================================================================

/// Closed node set for the STM interpreter. Everything is `Arc`-shared and
/// `Fn`-based so the same description can be attempted any number of times.
#[derive(Clone)]
pub(crate) enum StmNode {
    SucceedNow(Value),
    Succeed(Arc<dyn Fn() -> Value + Send + Sync>),
    FailCause(Arc<dyn Fn() -> Cause + Send + Sync>),
    Read(Arc<TCellErased>),
    Write(Arc<TCellErased>, Value),
    FlatMap(Arc<StmNode>, Arc<dyn Fn(Value) -> StmNode + Send + Sync>),
    /// Abandon the attempt and block until a read cell changes.
    Retry,
}

/// A composable transactional computation yielding `A` or failing with `E`.
///
/// `Stm` values are inert descriptions; nothing touches a cell until the
/// transaction is committed with `Effect::atomically`.
pub struct Stm<A, E = Infallible> {
    pub(crate) node: StmNode,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> Stm<A, E>
where
    A: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn from_node(node: StmNode) -> Self {
        Self {
            node,
            _marker: PhantomData,
        }
    }

    /// A transaction that succeeds with the given value.
    pub fn succeed(a: A) -> Self {
        Self::from_node(StmNode::SucceedNow(box_value(a)))
    }

    /// A transaction that re-evaluates `f` on every attempt.
    pub fn succeed_with(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_node(StmNode::Succeed(Arc::new(move || box_value(f()))))
    }

    /// A transaction that fails with the given error.
    pub fn fail(e: E) -> Self {
        Self::from_node(StmNode::FailCause(Arc::new(move || {
            Cause::fail(e.clone())
        })))
    }

    /// Abandon this attempt and block until a cell in the read set changes.
    pub fn retry() -> Self {
        Self::from_node(StmNode::Retry)
    }

    /// Retry unless the condition holds. Re-evaluated on every attempt when
    /// placed inside a `flat_map`.
    pub fn check(condition: bool) -> Stm<(), E> {
        if condition {
            Stm::from_node(StmNode::SucceedNow(unit_value()))
        } else {
            Stm::from_node(StmNode::Retry)
        }
    }

    /// Sequencing within the same journal: multi-cell transactions commit
    /// all-or-nothing.
    pub fn flat_map<B>(self, f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        Stm::from_node(StmNode::FlatMap(
            Arc::new(self.node),
            Arc::new(move |v| f(unbox::<A>(v)).node),
        ))
    }

    /// Transform the result.
    pub fn map<B>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Pair with another transaction in the same journal.
    pub fn zip<B>(self, other: Stm<B, E>) -> Stm<(A, B), E>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.flat_map(move |a| other.clone().map(move |b| (a.clone(), b)))
    }
}

// ============================================================================
// TRef
// ============================================================================

/// A transactional reference: the unit of shared state in the STM engine.
pub struct TRef<A> {
    cell: Arc<TCellErased>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TRef<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> TRef<A>
where
    A: Clone + Send + Sync + 'static,
{
    pub fn new(initial: A) -> Self {
        Self {
            cell: Arc::new(TCellErased::new(box_value(initial))),
            _marker: PhantomData,
        }
    }

    /// Read the cell inside a transaction.
    pub fn read<E>(&self) -> Stm<A, E>
    where
        E: Clone + Send + Sync + 'static,
    {
        Stm::from_node(StmNode::Read(self.cell.clone()))
    }

    /// Write the cell inside a transaction.
    pub fn write<E>(&self, value: A) -> Stm<(), E>
    where
        E: Clone + Send + Sync + 'static,
    {
        Stm::from_node(StmNode::FlatMap(
            Arc::new(StmNode::Write(self.cell.clone(), box_value(value))),
            Arc::new(|_| StmNode::SucceedNow(unit_value())),
        ))
    }

    /// Apply `f` to the cell inside a transaction.
    pub fn update<E>(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), E>
    where
        E: Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        self.read().flat_map(move |a| this.write(f(a)))
    }

    /// Apply `f`, writing the new value and yielding the extra result.
    pub fn modify<B, E>(&self, f: impl Fn(A) -> (A, B) + Send + Sync + 'static) -> Stm<B, E>
    where
        B: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        self.read().flat_map(move |a| {
            let (next, out) = f(a);
            this.write(next).map(move |_| out.clone())
        })
    }

    /// Non-transactional snapshot of the committed value.
    pub fn snapshot(&self) -> A {
        unbox::<A>(self.cell.state.lock().value.clone())
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.cell.state.lock().waiters.len()
    }
}

// ============================================================================
// Journal and attempts
// ============================================================================

struct JournalEntry {
    cell: Arc<TCellErased>,
    read_version: u64,
    value: Value,
    written: bool,
}

/// Per-attempt view of the cells a transaction has touched.
#[derive(Default)]
struct Journal {
    entries: HashMap<u64, JournalEntry>,
}

impl Journal {
    fn read(&mut self, cell: &Arc<TCellErased>) -> Value {
        if let Some(entry) = self.entries.get(&cell.id) {
            return entry.value.clone();
        }
        let (value, version) = {
            let st = cell.state.lock();
            (st.value.clone(), st.version)
        };
        self.entries.insert(
            cell.id,
            JournalEntry {
                cell: cell.clone(),
                read_version: version,
                value: value.clone(),
                written: false,
            },
        );
        value
    }

    fn write(&mut self, cell: &Arc<TCellErased>, value: Value) {
        if let Some(entry) = self.entries.get_mut(&cell.id) {
            entry.value = value;
            entry.written = true;
            return;
        }
        let version = cell.state.lock().version;
        self.entries.insert(
            cell.id,
            JournalEntry {
                cell: cell.clone(),
                read_version: version,
                value,
                written: true,
            },
        );
    }

    /// All read versions still current. Callers hold the commit lock.
    fn validate(&self) -> bool {
        self.entries
            .values()
            .all(|e| e.cell.state.lock().version == e.read_version)
    }
}

enum Attempt {
    Done(Value),
    Failed(Cause),
    Retry,
}

fn run_attempt(root: &Arc<StmNode>, journal: &mut Journal) -> Attempt {
    let mut current: StmNode = (**root).clone();
    let mut stack: Vec<Arc<dyn Fn(Value) -> StmNode + Send + Sync>> = Vec::new();
    loop {
        let value = match current {
            StmNode::SucceedNow(v) => v,
            StmNode::Succeed(f) => match guard(|| f()) {
                Ok(v) => v,
                Err(c) => return Attempt::Failed(c),
            },
            StmNode::FailCause(f) => {
                return match guard(|| f()) {
                    Ok(c) => Attempt::Failed(c),
                    Err(c) => Attempt::Failed(c),
                }
            }
            StmNode::Read(cell) => journal.read(&cell),
            StmNode::Write(cell, v) => {
                journal.write(&cell, v);
                unit_value()
            }
            StmNode::FlatMap(inner, k) => {
                stack.push(k);
                current = (*inner).clone();
                continue;
            }
            StmNode::Retry => return Attempt::Retry,
        };
        match stack.pop() {
            Some(k) => match guard(|| k(value)) {
                Ok(next) => current = next,
                Err(c) => return Attempt::Failed(c),
            },
            None => return Attempt::Done(value),
        }
    }
}

fn guard<T>(f: impl FnOnce() -> T) -> Result<T, Cause> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|p: Box<dyn Any + Send>| {
        Cause::Die(Defect::from_panic(p))
    })
}

/// Validate and apply under the commit lock. Returns false when a read
/// version moved, discarding the attempt.
fn try_commit(journal: &Journal) -> bool {
    let mut woken: Vec<TxWaiter> = Vec::new();
    {
        let _commit = COMMIT.lock();
        if !journal.validate() {
            return false;
        }
        for entry in journal.entries.values() {
            if entry.written {
                let mut st = entry.cell.state.lock();
                st.value = entry.value.clone();
                st.version += 1;
                woken.append(&mut st.waiters);
            }
        }
    }
    // Outside the lock: waking re-queues fibers through the scheduler.
    for waiter in woken {
        waiter.resume.deliver(Node::Commit(waiter.node));
    }
    true
}

/// Outcome of a retry park attempt.
enum RetryWait {
    /// Read set already stale; re-run immediately.
    Stale,
    /// Waiters registered and the fiber parked.
    Parked,
    /// Something landed in the resume slot before the park did. Commit
    /// wakes re-run; anything else (a cancellation) must not be dropped.
    Delivered(Node),
}

/// Park the fiber until a read cell is committed-written.
fn block_on_retry(
    root: &Arc<StmNode>,
    journal: &Journal,
    exec: &mut FiberExec,
    core: &Arc<SchedulerCore>,
) -> RetryWait {
    {
        let _commit = COMMIT.lock();
        if !journal.validate() {
            return RetryWait::Stale;
        }
        let epoch = exec.shared.begin_suspension(ResumeSlot::Registering);
        let resume = Resume::new(exec.shared.clone(), core.clone(), epoch);
        for entry in journal.entries.values() {
            let mut st = entry.cell.state.lock();
            // Entries whose resume already fired are dead weight on cells
            // that never get written; drop them while we are here.
            st.waiters.retain(|w| !w.resume.is_fired());
            st.waiters.push(TxWaiter {
                resume: resume.clone(),
                node: root.clone(),
            });
        }
    }
    // A commit or an interrupt may have landed between unlock and park;
    // take it now rather than sleeping through it.
    match exec.shared.park_or_take() {
        Some(n) => RetryWait::Delivered(n),
        None => RetryWait::Parked,
    }
}

/// Outcome of driving one `Commit` node for the interpreter.
pub(crate) enum CommitStep {
    Done(Value),
    Failed(Cause),
    Blocked,
    /// A node was delivered while parking; the interpreter evaluates it.
    Resume(Node),
}

/// Run attempts until one commits, fails on a consistent read set, or
/// blocks on `retry`. An empty-read-set retry parks forever, matching
/// `Effect::never`.
pub(crate) fn commit_step(
    root: &Arc<StmNode>,
    exec: &mut FiberExec,
    core: &Arc<SchedulerCore>,
) -> CommitStep {
    loop {
        let mut journal = Journal::default();
        match run_attempt(root, &mut journal) {
            Attempt::Done(v) => {
                if try_commit(&journal) {
                    return CommitStep::Done(v);
                }
            }
            Attempt::Failed(c) => {
                // Failures surface only from a consistent view; a torn read
                // re-runs instead.
                let consistent = {
                    let _commit = COMMIT.lock();
                    journal.validate()
                };
                if consistent {
                    return CommitStep::Failed(c);
                }
            }
            Attempt::Retry => match block_on_retry(root, &journal, exec, core) {
                RetryWait::Stale => {}
                RetryWait::Parked => return CommitStep::Blocked,
                RetryWait::Delivered(n) => return CommitStep::Resume(n),
            },
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
