//! # Fiber Supervision
//!
//! Observability hooks over fiber lifecycles. A [`Supervisor`] is notified
//! as fibers start, park, resume and end; it never alters control flow.
//! Hooks run inline on scheduler threads and must be cheap.

use crate::cause::Exit;
use crate::fiber::FiberId;
use crate::log::{self, debug, would_log, LogLevel};

/// Lifecycle observer registered on the runtime builder.
pub trait Supervisor: Send + Sync {
    /// A fiber was created and queued.
    fn on_start(&self, _id: FiberId) {}

    /// A fiber parked on an async wait or STM retry.
    fn on_suspend(&self, _id: FiberId) {}

    /// A parked fiber was re-queued.
    fn on_resume(&self, _id: FiberId) {}

    /// A fiber completed with the given exit.
    fn on_end(&self, _id: FiberId, _exit: &Exit<()>) {}
}

/// Supervisor that emits a debug log line per transition.
pub struct LogSupervisor;

impl Supervisor for LogSupervisor {
    fn on_start(&self, id: FiberId) {
        if would_log(LogLevel::Debug) {
            debug(format!("{} started", id));
        }
    }

    fn on_suspend(&self, id: FiberId) {
        if would_log(LogLevel::Debug) {
            debug(format!("{} suspended", id));
        }
    }

    fn on_resume(&self, id: FiberId) {
        if would_log(LogLevel::Debug) {
            debug(format!("{} resumed", id));
        }
    }

    fn on_end(&self, id: FiberId, exit: &Exit<()>) {
        if !would_log(LogLevel::Debug) {
            return;
        }
        match exit {
            Exit::Success(_) => debug(format!("{} completed", id)),
            Exit::Failure(cause) => log::debug(format!("{} failed: {}", id, cause)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hooks_are_no_ops() {
        struct Silent;
        impl Supervisor for Silent {}
        let s = Silent;
        s.on_start(FiberId::for_test(1));
        s.on_suspend(FiberId::for_test(1));
        s.on_resume(FiberId::for_test(1));
        s.on_end(FiberId::for_test(1), &Exit::Success(()));
    }
}
