//! # Ichor Effect Runtime
//!
//! A structured-concurrency runtime built around lazily-described effects:
//!
//! - **Effects**: immutable descriptions of computations, composed with
//!   `flat_map`, `fold_cause`, `race` and friends; nothing runs until a
//!   [`Runtime`] interprets them
//! - **Fibers**: cooperative logical threads interpreted on an explicit
//!   continuation stack, scheduled M:N over worker threads with
//!   work-stealing
//! - **Interruption**: latched cancellation signals, checked at interpreter
//!   checkpoints, maskable with `uninterruptible`, always running
//!   finalizers on the way out
//! - **Scopes**: finalizer regions closed exactly once on every exit path
//! - **FiberRefs**: fiber-scoped state, snapshotted on fork and merged on
//!   join
//! - **STM**: optimistic transactions over [`TRef`] cells with blocking
//!   retry and a transactional queue
//!
//! ## Technical Standards
//!
//! - **Work Stealing**: Chase-Lev deque per
//!   [crossbeam-deque](https://docs.rs/crossbeam-deque)
//! - **Wakeups**: MPMC channels per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//!
//! ## Example
//!
//! ```rust,ignore
//! use ichor::{Effect, Runtime};
//!
//! let rt = Runtime::new();
//! let exit = rt.block_on(
//!     Effect::<u32>::succeed(20).map(|n| n + 22),
//! );
//! assert_eq!(exit.success(), Some(42));
//! ```

#![warn(rust_2018_idioms)]

pub mod cause;
pub mod config;
pub mod effect;
pub mod fiber;
pub mod fiber_ref;
pub mod log;
pub mod queue;
pub mod scheduler;
pub mod scope;
pub mod stm;
pub mod supervisor;
mod timer;

// Re-exports
pub use cause::{Cause, Defect, Exit, ExitKind};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder, SchedulerConfig};
pub use effect::{AsyncCallback, Effect, Fiber};
pub use fiber::FiberId;
pub use fiber_ref::FiberRef;
pub use queue::TQueue;
pub use scheduler::{Runtime, RuntimeBuilder};
pub use scope::Scope;
pub use stm::{Stm, TRef};
pub use supervisor::{LogSupervisor, Supervisor};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Start a runtime with default configuration.
pub fn init() -> Runtime {
    Runtime::new()
}

/// Start a runtime configured from `ICHOR_*` environment variables.
pub fn init_from_env() -> Runtime {
    Runtime::with_config(RuntimeConfig::from_env())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_builds_a_working_runtime() {
        let rt = init();
        let exit = rt.block_on(Effect::<u32>::succeed(20).map(|n| n + 22));
        assert_eq!(exit.success(), Some(42));
    }
}
