//! loopexec - executors bound to message loops and priority-aware threads
//!
//! Work is funneled onto a single loop thread in deadline order, run inline
//! on the caller, or spread over small elastic and scheduled pools. Every
//! executor shares one lifecycle contract: `shutdown`, `is_terminated`,
//! `await_termination`.
//!
//! # Quick Start
//!
//! ```no_run
//! use loopexec::prelude::*;
//! use std::time::Duration;
//!
//! let executors = Executors::with_spawned_main(Config::default())?;
//!
//! // runs on the "work" loop thread
//! let answer = executors.background()?.submit(|| 6 * 7)?;
//! assert_eq!(answer.get()?, 42);
//!
//! let tick = executors.scheduled()?.schedule_at_fixed_rate(
//!     || println!("tick"),
//!     Duration::ZERO,
//!     Duration::from_millis(100),
//! )?;
//! tick.cancel(false);
//!
//! executors.shutdown();
//! executors.await_termination(Duration::from_secs(1));
//! # Ok::<(), loopexec::Error>(())
//! ```
//!
//! # Pieces
//!
//! - **Worker threads**: named threads with a scheduling class, an OS nice
//!   value and a one-shot interrupt hook
//! - **Loopers**: single-threaded deadline queues with quit / quit-safely
//! - **Loop executor**: scheduled executor adapter over one looper
//! - **Immediate executor**: runs work inline, terminates once quiescent
//! - **Pools**: elastic handoff pool and a fixed scheduled pool
//! - **Registry**: the named executors, built once from a [`Config`]

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod looper;
pub mod prelude;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod thread;

pub use config::{Config, ConfigBuilder, PeriodicPolicy};
pub use error::{Error, Result, TaskError};
pub use executor::{
    Executor, ExecutorExt, ImmediateExecutor, Lifecycle, LoopExecutor, ScheduledExecutor,
    ScheduledPool, WorkerPool,
};
pub use looper::Looper;
pub use registry::Executors;
pub use task::{fatal, ScheduledHandle, TaskHandle, TaskState};
pub use thread::{thread_hook, Priority, ThreadFactory, WorkerThread};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_executors_through_trait_objects() {
        let executors = Executors::with_spawned_main(Config::default()).unwrap();
        let members: Vec<Box<dyn Executor>> = vec![
            Box::new(executors.main()),
            Box::new(ImmediateExecutor::new()),
            Box::new(executors.io().unwrap()),
        ];

        for executor in &members {
            assert_eq!(executor.submit(|| 1 + 1).unwrap().get().unwrap(), 2);
        }
        for executor in &members {
            executor.shutdown();
            assert!(executor.await_termination(Duration::from_secs(2)));
            assert_eq!(executor.lifecycle(), Lifecycle::Terminated);
        }
    }
}
