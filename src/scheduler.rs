//! # Work-Stealing Effect Scheduler
//!
//! M:N cooperative scheduler: each worker thread owns a local deque of
//! runnable fibers, new and woken fibers land in a global injection queue,
//! and idle workers steal from their peers.
//!
//! ## Ownership protocol
//!
//! A fiber's execution state lives in the registry while the fiber is
//! queued or parked, and is removed while a worker runs a turn — at most
//! one worker ever holds it. Wakeups that arrive mid-turn are caught by the
//! worker's post-turn recheck under the registry lock, so a fiber can
//! neither be lost nor run twice.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_deque::{Injector, Stealer, Worker as Deque};
use parking_lot::Mutex;

use crate::cause::Exit;
use crate::config::RuntimeConfig;
use crate::effect::{unbox, Effect, Fiber, Node, Value};
use crate::fiber::{FiberExec, FiberId, FiberRefs, FiberShared, RawFiber, TurnResult};
use crate::log;
use crate::scope::{self, Scope};
use crate::supervisor::Supervisor;
use crate::timer::Timer;

// ============================================================================
// Core
// ============================================================================

/// Registry slot for a fiber not currently running a turn.
enum FiberSlot {
    /// Queued (or about to be queued) for execution.
    Ready(FiberExec),
    /// Suspended; a delivery to its resume slot re-queues it.
    Parked(FiberExec),
    /// A worker holds the execution state for the current turn.
    Running,
}

/// Shared heart of the runtime: queues, fiber registry, timer wheel and
/// supervision hooks. Everything a fiber or worker needs reaches it through
/// an `Arc<SchedulerCore>`.
pub(crate) struct SchedulerCore {
    config: RuntimeConfig,
    global_queue: Injector<u64>,
    fibers: Mutex<HashMap<u64, FiberSlot>>,
    stealers: Vec<Stealer<u64>>,
    shutdown: AtomicBool,
    timer: Timer,
    supervisors: Vec<Arc<dyn Supervisor>>,
}

impl SchedulerCore {
    pub(crate) fn timer(&self) -> &Timer {
        &self.timer
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Create a fiber for `node`, link it to its parent unless daemon, and
    /// queue it for execution.
    pub(crate) fn spawn_fiber(
        self: &Arc<Self>,
        node: Node,
        parent: Option<(&Arc<FiberShared>, &FiberRefs)>,
        daemon: bool,
    ) -> RawFiber {
        let id = FiberId::next();
        let shared = Arc::new(FiberShared::new(id));

        let refs = match parent {
            Some((parent_shared, parent_refs)) => {
                if !daemon {
                    parent_shared.add_child(&shared);
                }
                parent_refs.clone()
            }
            None => FiberRefs::default(),
        };

        let scope = Scope::new();
        let wrapped = scope::wrap_with_scope(node, scope.clone());
        let exec = FiberExec::new(shared.clone(), wrapped, refs, scope);

        for sup in &self.supervisors {
            sup.on_start(id);
        }

        self.fibers.lock().insert(id.seq(), FiberSlot::Ready(exec));
        self.global_queue.push(id.seq());

        RawFiber {
            shared,
            core: self.clone(),
        }
    }

    /// Move a parked fiber (whose resume slot was just filled) back onto
    /// the run queue. A no-op for running fibers: the owning worker's
    /// post-turn recheck picks the delivery up.
    pub(crate) fn wake(&self, id: FiberId) {
        let mut fibers = self.fibers.lock();
        let seq = id.seq();
        match fibers.remove(&seq) {
            Some(FiberSlot::Parked(mut exec)) => {
                if let Some(node) = exec.shared.clone().take_delivery() {
                    exec.resume_with(node);
                    fibers.insert(seq, FiberSlot::Ready(exec));
                    drop(fibers);
                    for sup in &self.supervisors {
                        sup.on_resume(id);
                    }
                    self.global_queue.push(seq);
                } else {
                    // Spurious wake; leave it parked.
                    fibers.insert(seq, FiberSlot::Parked(exec));
                }
            }
            Some(other) => {
                fibers.insert(seq, other);
            }
            None => {}
        }
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    id: usize,
    core: Arc<SchedulerCore>,
}

impl Worker {
    fn run_loop(self, local: Deque<u64>) {
        loop {
            if self.core.is_shutting_down() {
                break;
            }

            if let Some(seq) = self.find_work(&local) {
                self.run_fiber(seq, &local);
            } else {
                thread::yield_now();
            }
        }
    }

    /// Local queue, then the global queue, then peers.
    fn find_work(&self, local: &Deque<u64>) -> Option<u64> {
        if let Some(seq) = local.pop() {
            return Some(seq);
        }

        loop {
            match self.core.global_queue.steal_batch_and_pop(local) {
                crossbeam_deque::Steal::Success(seq) => return Some(seq),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }

        for (i, stealer) in self.core.stealers.iter().enumerate() {
            if i == self.id {
                continue;
            }
            loop {
                match stealer.steal() {
                    crossbeam_deque::Steal::Success(seq) => return Some(seq),
                    crossbeam_deque::Steal::Empty => break,
                    crossbeam_deque::Steal::Retry => continue,
                }
            }
        }

        None
    }

    /// Run one turn of the fiber, then hand it back to the registry (or
    /// retire it).
    fn run_fiber(&self, seq: u64, local: &Deque<u64>) {
        let mut exec = {
            let mut fibers = self.core.fibers.lock();
            match fibers.remove(&seq) {
                Some(FiberSlot::Ready(exec)) => {
                    fibers.insert(seq, FiberSlot::Running);
                    exec
                }
                Some(other) => {
                    // Parked or already running: not ours this turn.
                    fibers.insert(seq, other);
                    return;
                }
                None => return,
            }
        };

        let id = exec.shared.id();
        let budget = self.core.config.scheduler.step_budget;

        match exec.run_turn(&self.core, budget) {
            TurnResult::Done(exit) => {
                self.core.fibers.lock().remove(&seq);
                if log::would_log(log::LogLevel::Debug) {
                    log::debug(format!("{} done (success={})", id, exit.is_success()));
                }
                let unit_exit = exit.map(|_| ());
                for sup in &self.core.supervisors {
                    sup.on_end(id, &unit_exit);
                }
            }
            TurnResult::Yielded => {
                let mut fibers = self.core.fibers.lock();
                fibers.insert(seq, FiberSlot::Ready(exec));
                drop(fibers);
                local.push(seq);
            }
            TurnResult::Suspended => {
                // Recheck under the registry lock: a delivery that raced
                // with the end of this turn must not strand the fiber.
                let mut fibers = self.core.fibers.lock();
                match exec.shared.clone().take_delivery() {
                    Some(node) => {
                        exec.resume_with(node);
                        fibers.insert(seq, FiberSlot::Ready(exec));
                        drop(fibers);
                        local.push(seq);
                    }
                    None => {
                        fibers.insert(seq, FiberSlot::Parked(exec));
                        drop(fibers);
                        for sup in &self.core.supervisors {
                            sup.on_suspend(id);
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Handle to a running scheduler: worker threads, timer and registry.
/// Dropping it shuts the runtime down and joins the workers.
pub struct Runtime {
    core: Arc<SchedulerCore>,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// A runtime with default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// A runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Spawn a root fiber and return its handle without waiting.
    pub fn spawn<A, E>(&self, effect: Effect<A, E>) -> Fiber<A, E>
    where
        A: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let raw = self.core.spawn_fiber(effect.node, None, true);
        Fiber::from_raw(raw)
    }

    /// Run an effect to completion on the runtime, blocking the calling
    /// thread, and return its full exit.
    pub fn block_on<A, E>(&self, effect: Effect<A, E>) -> Exit<A>
    where
        A: Clone + Send + Sync + 'static,
        E: Clone + Send + Sync + 'static,
    {
        let raw = self.core.spawn_fiber(effect.node, None, true);
        let (tx, rx) = crossbeam_channel::bounded::<Exit<Value>>(1);
        raw.shared.on_done(Box::new(move |exit| {
            let _ = tx.send(exit);
        }));
        let exit = rx.recv().expect("runtime workers exited before the fiber");
        exit.map(unbox::<A>)
    }

    /// Number of fibers currently registered (runnable or parked).
    pub fn fiber_count(&self) -> usize {
        self.core.fibers.lock().len()
    }

    /// Request shutdown without waiting for workers.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        self.core.timer.shutdown();
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Builder for a [`Runtime`]: configuration plus supervision hooks.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    supervisors: Vec<Arc<dyn Supervisor>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Register a lifecycle observer. Hooks run inline on scheduler
    /// threads and must be cheap.
    pub fn supervisor(mut self, sup: Arc<dyn Supervisor>) -> Self {
        self.supervisors.push(sup);
        self
    }

    pub fn build(self) -> Runtime {
        log::set_level(self.config.log_level);
        log::set_format(self.config.log_format);
        let num_workers = self.config.scheduler.num_workers.max(1);

        let mut deques = Vec::with_capacity(num_workers);
        let mut stealers = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let deque = Deque::new_fifo();
            stealers.push(deque.stealer());
            deques.push(deque);
        }

        let core = Arc::new(SchedulerCore {
            config: self.config,
            global_queue: Injector::new(),
            fibers: Mutex::new(HashMap::new()),
            stealers,
            shutdown: AtomicBool::new(false),
            timer: Timer::new(),
            supervisors: self.supervisors,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for (i, deque) in deques.into_iter().enumerate() {
            let worker = Worker {
                id: i,
                core: core.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("ichor-worker-{}", i))
                .spawn(move || worker.run_loop(deque))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        log::debug(format!("runtime started with {} workers", num_workers));
        Runtime { core, workers }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cause::ExitKind;
    use crate::fiber_ref::FiberRef;
    use crate::queue::TQueue;
    use crate::stm::{Stm, TRef};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::{Duration, Instant};

    fn runtime() -> Runtime {
        Runtime::builder().num_workers(2).build()
    }

    #[test]
    fn test_block_on_pure_chain() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32>::succeed(20)
                .map(|n| n + 1)
                .flat_map(|n| Effect::succeed(n * 2)),
        );
        assert_eq!(exit.success(), Some(42));
    }

    #[test]
    fn test_typed_failure_and_recovery() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32, String>::fail("boom".to_string())
                .catch_all(|e| Effect::<u32, Infallible>::succeed(e.len() as u32)),
        );
        assert_eq!(exit.success(), Some(4));
    }

    #[test]
    fn test_defect_is_not_caught_by_catch_all() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32, String>::die("invariant broken")
                .catch_all(|_| Effect::<u32, Infallible>::succeed(0)),
        );
        match exit {
            Exit::Failure(c) => assert!(c.is_die()),
            Exit::Success(_) => panic!("defect must pass the typed handler"),
        }
    }

    #[test]
    fn test_panic_becomes_defect() {
        let rt = runtime();
        let exit = rt.block_on(Effect::<u32>::succeed_with(|| panic!("kaboom")));
        match exit {
            Exit::Failure(c) => {
                assert!(c.is_die());
                assert!(c.defects().iter().any(|d| d.describe().contains("kaboom")));
            }
            Exit::Success(_) => panic!("panic must surface as a defect"),
        }
    }

    #[test]
    fn test_deep_flat_map_chain_runs_in_constant_stack() {
        let rt = runtime();
        let mut eff = Effect::<u64>::succeed(0);
        for _ in 0..100_000 {
            eff = eff.flat_map(|n| Effect::succeed(n + 1));
        }
        assert_eq!(rt.block_on(eff).success(), Some(100_000));
    }

    #[test]
    fn test_fork_join_equals_direct_run() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32>::succeed(21)
                .map(|n| n * 2)
                .fork()
                .flat_map(|fiber| fiber.join()),
        );
        assert_eq!(exit.success(), Some(42));
    }

    #[test]
    fn test_join_surfaces_child_failure() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32, String>::fail("child went wrong".to_string())
                .fork()
                .flat_map(|fiber| fiber.join()),
        );
        match exit {
            Exit::Failure(c) => {
                assert_eq!(c.expected::<String>(), Some("child went wrong".to_string()))
            }
            Exit::Success(_) => panic!("child failure must propagate through join"),
        }
    }

    #[test]
    fn test_finalizers_run_in_reverse_order_on_success() {
        let rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let exit = rt.block_on(
            Effect::<u32>::succeed(1)
                .ensuring(Effect::<(), Infallible>::succeed_with(move || {
                    o1.lock().push("inner")
                }))
                .ensuring(Effect::<(), Infallible>::succeed_with(move || {
                    o2.lock().push("outer")
                })),
        );
        assert_eq!(exit.success(), Some(1));
        assert_eq!(*order.lock(), vec!["inner", "outer"]);
    }

    #[test]
    fn test_finalizer_runs_exactly_once_on_failure() {
        let rt = runtime();
        let runs = Arc::new(AtomicU32::new(0));
        let r = runs.clone();
        let exit = rt.block_on(
            Effect::<u32, String>::fail("nope".to_string()).ensuring(
                Effect::<(), Infallible>::succeed_with(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            ),
        );
        assert!(!exit.is_success());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupt_runs_finalizer_and_reports_interrupted() {
        let rt = runtime();
        let cleaned = Arc::new(AtomicBool::new(false));
        let c = cleaned.clone();
        let exit = rt.block_on(
            Effect::<u32>::never()
                .ensuring(Effect::<(), Infallible>::succeed_with(move || {
                    c.store(true, Ordering::SeqCst);
                }))
                .fork()
                .flat_map(|fiber| {
                    Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                        .flat_map(move |_| fiber.interrupt())
                }),
        );
        let inner = exit.success().expect("interrupt returns the child's exit");
        assert!(inner.is_interrupted());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_uninterruptible_region_completes_before_interrupt_lands() {
        let rt = runtime();
        let reached = Arc::new(AtomicBool::new(false));
        let r = reached.clone();
        let exit = rt.block_on(
            Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                .flat_map(move |_| {
                    Effect::succeed_with(move || r.store(true, Ordering::SeqCst))
                })
                .uninterruptible()
                .fork()
                .flat_map(|fiber| {
                    Effect::<(), Infallible>::sleep(Duration::from_millis(5))
                        .flat_map(move |_| fiber.interrupt())
                }),
        );
        let inner = exit.success().expect("interrupt returns the child's exit");
        assert!(inner.is_interrupted());
        // The masked region ran to its end despite the pending signal.
        assert!(reached.load(Ordering::SeqCst));
    }

    #[test]
    fn test_race_first_wins_and_loser_is_cleaned_up() {
        let rt = runtime();
        let loser_cleaned = Arc::new(AtomicBool::new(false));
        let lc = loser_cleaned.clone();
        let fast = Effect::<u32>::sleep(Duration::from_millis(5)).as_value(1u32);
        let slow = Effect::<u32>::sleep(Duration::from_secs(10))
            .as_value(2u32)
            .ensuring(Effect::<(), Infallible>::succeed_with(move || {
                lc.store(true, Ordering::SeqCst);
            }));
        let started = Instant::now();
        let exit = rt.block_on(fast.race(slow));
        assert_eq!(exit.success(), Some(1));
        // The race waited for the loser's finalizer, not its sleep.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(loser_cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeout_returns_none_for_slow_effect() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32>::sleep(Duration::from_secs(10))
                .as_value(7u32)
                .timeout(Duration::from_millis(20)),
        );
        assert_eq!(exit.success(), Some(None));
    }

    #[test]
    fn test_timeout_returns_some_for_fast_effect() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32>::succeed(7).timeout(Duration::from_secs(10)),
        );
        assert_eq!(exit.success(), Some(Some(7)));
    }

    #[test]
    fn test_sleep_actually_waits() {
        let rt = runtime();
        let started = Instant::now();
        let exit = rt.block_on(Effect::<()>::sleep(Duration::from_millis(40)));
        assert!(exit.is_success());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_scoped_finalizer_runs_at_scope_end() {
        let rt = runtime();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());
        let exit = rt.block_on(Effect::<u32>::scoped(move |scope| {
            scope
                .add_finalizer(move |_: ExitKind| {
                    Effect::<(), Infallible>::succeed_with(move || {
                        o1.lock().push("closed")
                    })
                })
                .flat_map(move |_| {
                    Effect::succeed_with(move || {
                        o2.lock().push("body");
                        5u32
                    })
                })
        }));
        assert_eq!(exit.success(), Some(5));
        assert_eq!(*order.lock(), vec!["body", "closed"]);
    }

    #[test]
    fn test_fiber_ref_is_isolated_per_fiber_and_merged_on_join() {
        let rt = runtime();
        let sum = FiberRef::new_with(0u64, |p, c| p + c);
        let child_ref = sum.clone();
        let read_back = sum.clone();
        let exit = rt.block_on(
            sum.set(10)
                .flat_map(move |_| {
                    child_ref
                        .update(|n| n + 32)
                        .fork()
                        .flat_map(|fiber| fiber.join())
                })
                .flat_map(move |_| read_back.get()),
        );
        // Child forked at 10, wrote 42; combine sums parent 10 + child 42.
        assert_eq!(exit.success(), Some(52));
    }

    #[test]
    fn test_fiber_ref_default_combine_takes_child_value() {
        let rt = runtime();
        let label = FiberRef::new("parent".to_string());
        let child_ref = label.clone();
        let read_back = label.clone();
        let exit = rt.block_on(
            child_ref
                .set("child".to_string())
                .fork()
                .flat_map(|fiber| fiber.join())
                .flat_map(move |_| read_back.get()),
        );
        assert_eq!(exit.success(), Some("child".to_string()));
    }

    #[test]
    fn test_fiber_ref_locally_overrides_and_restores() {
        let rt = runtime();
        let level = FiberRef::new(1u32);
        let inner_ref = level.clone();
        let after_ref = level.clone();
        let exit = rt.block_on(
            level
                .locally(7, inner_ref.get())
                .flat_map(move |seen| {
                    after_ref.get().map(move |restored| (seen, restored))
                }),
        );
        assert_eq!(exit.success(), Some((7, 1)));
    }

    #[test]
    fn test_fiber_ref_locally_restores_after_failure() {
        let rt = runtime();
        let level = FiberRef::new(1u32);
        let read_back = level.clone();
        let exit = rt.block_on(
            level
                .locally(7, Effect::<u32, String>::fail("inner failed".to_string()))
                .catch_all(move |_| read_back.get_with::<Infallible>()),
        );
        // The override was rolled back before the handler read the value.
        assert_eq!(exit.success(), Some(1));
    }

    #[test]
    fn test_stm_counter_is_serializable_under_contention() {
        let rt = Runtime::builder().num_workers(4).build();
        let counter = TRef::new(0u64);
        let per_fiber = 100u64;
        let fibers = 8usize;

        let mut forks: Vec<Fiber<(), Infallible>> = Vec::new();
        for _ in 0..fibers {
            let c = counter.clone();
            let mut eff = Effect::<(), Infallible>::unit();
            for _ in 0..per_fiber {
                let c2 = c.clone();
                eff = eff.flat_map(move |_| Effect::atomically(c2.update(|n| n + 1)));
            }
            forks.push(rt.spawn(eff));
        }
        for fiber in forks {
            assert!(rt.block_on(fiber.join()).is_success());
        }
        assert_eq!(counter.snapshot(), per_fiber * fibers as u64);
    }

    #[test]
    fn test_stm_transfer_preserves_total_balance() {
        let rt = Runtime::builder().num_workers(4).build();
        let a = TRef::new(500i64);
        let b = TRef::new(500i64);

        let transfer = |from: TRef<i64>, to: TRef<i64>, amount: i64| {
            from.read().flat_map(move |balance: i64| {
                let from = from.clone();
                let to = to.clone();
                Stm::<(), Infallible>::check(balance >= amount).flat_map(move |_| {
                    let to = to.clone();
                    from.write(balance - amount)
                        .flat_map(move |_| to.update(move |t| t + amount))
                })
            })
        };

        let mut fibers = Vec::new();
        for i in 0..20 {
            let (from, to) = if i % 2 == 0 {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            fibers.push(rt.spawn(Effect::atomically(transfer(from, to, 25))));
        }
        for fiber in fibers {
            assert!(rt.block_on(fiber.join()).is_success());
        }
        assert_eq!(a.snapshot() + b.snapshot(), 1000);
    }

    #[test]
    fn test_blocked_taker_resumes_when_offer_commits() {
        let rt = runtime();
        let q: TQueue<u32> = TQueue::bounded(4);
        let taker_q = q.clone();
        let offer_q = q.clone();

        let exit = rt.block_on(
            Effect::atomically(taker_q.take())
                .fork()
                .flat_map(move |taker| {
                    // The taker blocks on an empty queue; the offer wakes it.
                    Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                        .flat_map(move |_| Effect::atomically(offer_q.offer(99)))
                        .flat_map(move |_| taker.join())
                }),
        );
        assert_eq!(exit.success(), Some(99));
    }

    #[test]
    fn test_bounded_queue_offer_blocks_until_capacity() {
        let rt = runtime();
        let q: TQueue<u32> = TQueue::bounded(1);
        let fill_q = q.clone();
        let offer_q = q.clone();
        let take_q = q.clone();

        let exit = rt.block_on(
            Effect::atomically(fill_q.offer(1))
                .flat_map(move |_| {
                    // Queue is full: this offer must wait for the take.
                    Effect::atomically(offer_q.offer(2)).fork()
                })
                .flat_map(move |blocked| {
                    Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                        .flat_map(move |_| Effect::atomically(take_q.take()))
                        .flat_map(move |first| {
                            blocked.join().map(move |_| first)
                        })
                }),
        );
        assert_eq!(exit.success(), Some(1));
        assert_eq!(q.size(), 1);
    }

    #[test]
    fn test_interrupt_reaches_fiber_blocked_in_stm_retry() {
        let rt = runtime();
        // A wide read set stretches the waiter-registration window, so the
        // interrupt lands at every stage of the park across iterations:
        // before the commit starts, mid-registration, and fully parked.
        for _ in 0..16 {
            let cells: Vec<TRef<u64>> = (0..256).map(|_| TRef::new(0)).collect();
            let mut stm = Stm::<u64, Infallible>::succeed(0);
            for cell in &cells {
                let c = cell.clone();
                stm = stm.flat_map(move |_| c.read());
            }
            let stm = stm.flat_map(|_| Stm::<u64, Infallible>::retry());
            let exit = rt.block_on(
                Effect::atomically(stm)
                    .fork()
                    .flat_map(|fiber| fiber.interrupt()),
            );
            let inner = exit.success().expect("interrupt returns the child's exit");
            assert!(inner.is_interrupted());
        }
    }

    #[test]
    fn test_spent_retry_waiters_are_purged_on_reregistration() {
        let rt = runtime();
        let gate = TRef::new(0u32);
        let side = TRef::new(0u32);

        // Reads both cells and blocks until the gate opens. The wake comes
        // from the gate write, leaving a spent entry behind on `side`.
        let wait_for_gate = {
            let (gate, side) = (gate.clone(), side.clone());
            move || {
                let side = side.clone();
                gate.read().flat_map(move |g: u32| {
                    side.read().flat_map(move |_| {
                        Stm::<(), Infallible>::check(g > 0).map(move |_| g)
                    })
                })
            }
        };

        let exit = rt.block_on(
            Effect::atomically(wait_for_gate())
                .fork()
                .flat_map({
                    let gate = gate.clone();
                    move |fiber| {
                        Effect::<(), Infallible>::sleep(Duration::from_millis(20))
                            .flat_map(move |_| Effect::atomically(gate.update(|_| 1)))
                            .flat_map(move |_| fiber.join())
                    }
                }),
        );
        assert_eq!(exit.success(), Some(1));
        assert_eq!(side.waiter_count(), 1);

        // The next transaction to park on `side` drops the spent entry as
        // it registers its own.
        let blocked = rt.spawn(Effect::atomically(side.read().flat_map(
            |s: u32| Stm::<(), Infallible>::check(s > 0).map(move |_| s),
        )));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(side.waiter_count(), 1);

        assert!(rt
            .block_on(Effect::atomically(side.write::<Infallible>(1)))
            .is_success());
        assert_eq!(rt.block_on(blocked.join()).success(), Some(1));
    }

    #[test]
    fn test_yield_now_lets_siblings_progress() {
        let rt = Runtime::builder().num_workers(1).build();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let exit = rt.block_on(
            Effect::<(), Infallible>::succeed_with(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .fork()
            .flat_map(|fiber| {
                Effect::<(), Infallible>::yield_now().flat_map(move |_| fiber.join())
            }),
        );
        assert!(exit.is_success());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cause_records_both_failure_and_interrupt() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32, String>::sleep(Duration::from_secs(10))
                .flat_map(|_| Effect::<u32, String>::fail("late".to_string()))
                .fork()
                .flat_map(|fiber| {
                    Effect::<(), String>::sleep(Duration::from_millis(10))
                        .flat_map(move |_| fiber.interrupt())
                }),
        );
        let inner = exit.success().expect("interrupt returns the child's exit");
        match inner {
            Exit::Failure(c) => assert!(c.is_interrupted()),
            Exit::Success(_) => panic!("interrupted sleeper cannot succeed"),
        }
    }

    #[test]
    fn test_recovered_interrupt_is_not_appended_to_later_failure() {
        let rt = runtime();
        let exit = rt.block_on(
            Effect::<u32>::never()
                .fold_cause(
                    |v| Effect::<u32, String>::succeed(v),
                    |_| Effect::<u32, String>::fail("after recovery".to_string()),
                )
                .fork()
                .flat_map(|fiber| {
                    Effect::<(), String>::sleep(Duration::from_millis(20))
                        .flat_map(move |_| fiber.interrupt())
                }),
        );
        let inner = exit.success().expect("interrupt returns the child's exit");
        match inner {
            Exit::Failure(c) => {
                // The handler consumed the cancellation; its own failure
                // stands alone.
                assert_eq!(c.expected::<String>(), Some("after recovery".to_string()));
                assert!(!c.is_interrupted());
            }
            Exit::Success(_) => panic!("recovery path must surface its own failure"),
        }
    }

    #[test]
    fn test_supervisor_sees_start_and_end() {
        struct Counting {
            started: AtomicUsize,
            ended: AtomicUsize,
        }
        impl Supervisor for Counting {
            fn on_start(&self, _id: FiberId) {
                self.started.fetch_add(1, Ordering::SeqCst);
            }
            fn on_end(&self, _id: FiberId, _exit: &Exit<()>) {
                self.ended.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counting = Arc::new(Counting {
            started: AtomicUsize::new(0),
            ended: AtomicUsize::new(0),
        });
        let rt = Runtime::builder()
            .num_workers(2)
            .supervisor(counting.clone())
            .build();
        let exit = rt.block_on(
            Effect::<u32>::succeed(1)
                .fork()
                .flat_map(|fiber| fiber.join()),
        );
        assert!(exit.is_success());
        assert!(counting.started.load(Ordering::SeqCst) >= 2);
        assert!(counting.ended.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_many_fibers_all_complete() {
        let rt = Runtime::builder().num_workers(4).build();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut fibers = Vec::new();
        for _ in 0..200 {
            let c = counter.clone();
            fibers.push(rt.spawn(Effect::<(), Infallible>::succeed_with(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })));
        }
        for fiber in fibers {
            assert!(rt.block_on(fiber.join()).is_success());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);
    }
}
