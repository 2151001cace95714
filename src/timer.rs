//! # Timer Thread
//!
//! A single dedicated thread drives all `sleep` and `timeout` deadlines
//! from a binary heap, sleeping exactly until the earliest one. Firing a
//! deadline delivers into the owning fiber's resume slot; a fiber that was
//! interrupted or re-suspended in the meantime simply refuses the stale
//! delivery.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::effect::{unit_value, Node};
use crate::fiber::Resume;

struct Entry {
    deadline: Instant,
    resume: Resume,
}

// Min-heap on deadline.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.deadline.cmp(&self.deadline)
    }
}

struct TimerState {
    heap: BinaryHeap<Entry>,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    tick: Condvar,
}

/// Handle to the timer thread.
pub(crate) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(crate) fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            tick: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("ichor-timer".to_string())
            .spawn(move || run(thread_shared))
            .expect("failed to spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Register a deadline for the given resume handle.
    pub(crate) fn schedule(&self, deadline: Instant, resume: Resume) {
        let mut st = self.shared.state.lock();
        st.heap.push(Entry { deadline, resume });
        self.shared.tick.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
        }
        self.shared.tick.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn run(shared: Arc<TimerShared>) {
    let mut st = shared.state.lock();
    loop {
        if st.shutdown {
            return;
        }
        let now = Instant::now();
        match st.heap.peek() {
            Some(entry) if entry.deadline <= now => {
                let entry = st.heap.pop().expect("peeked entry present");
                // Deliver outside the lock: it may re-queue a fiber.
                drop(st);
                entry.resume.deliver(Node::SucceedNow(unit_value()));
                st = shared.state.lock();
            }
            Some(entry) => {
                let deadline = entry.deadline;
                shared.tick.wait_until(&mut st, deadline);
            }
            None => {
                shared.tick.wait(&mut st);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_heap_orders_by_earliest_deadline() {
        let now = Instant::now();
        let mut heap: BinaryHeap<std::cmp::Reverse<Instant>> = BinaryHeap::new();
        heap.push(std::cmp::Reverse(now + Duration::from_secs(3)));
        heap.push(std::cmp::Reverse(now + Duration::from_secs(1)));
        heap.push(std::cmp::Reverse(now + Duration::from_secs(2)));
        assert_eq!(heap.pop().map(|r| r.0), Some(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_shutdown_joins_thread() {
        let timer = Timer::new();
        timer.shutdown();
        assert!(timer.thread.lock().is_none());
    }
}
