//! Executor contracts and their implementations.
//!
//! - [`LoopExecutor`] funnels work onto one [`Looper`](crate::looper::Looper)
//! - [`ImmediateExecutor`] runs work on the caller's thread
//! - [`WorkerPool`] grows worker threads on demand for short blocking jobs
//! - [`ScheduledPool`] runs delayed and periodic jobs on a fixed set of workers

pub mod immediate;
pub mod loop_executor;
pub mod pool;
pub mod scheduled_pool;
pub(crate) mod scheduling;

pub use immediate::ImmediateExecutor;
pub use loop_executor::LoopExecutor;
pub use pool::WorkerPool;
pub use scheduled_pool::ScheduledPool;

use crate::error::Result;
use crate::task::{self, Job, ScheduledHandle, TaskHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Active,
    ShuttingDown,
    Terminated,
}

/// Contract shared by every executor in this crate.
pub trait Executor: Send + Sync {
    /// Submits `job`, failing with `Error::Rejected` once shut down.
    fn execute(&self, job: Job) -> Result<()>;

    /// Stops accepting work. Work already accepted still runs. Idempotent.
    fn shutdown(&self);

    /// Like `shutdown`, and returns whatever jobs were accepted but never
    /// started, if the executor is able to tell.
    fn shutdown_now(&self) -> Vec<Job>;

    fn is_shutdown(&self) -> bool;

    fn is_terminated(&self) -> bool;

    /// Blocks the calling thread until terminated or until `timeout` has
    /// elapsed. Returns whether termination was observed.
    fn await_termination(&self, timeout: Duration) -> bool;

    fn lifecycle(&self) -> Lifecycle {
        if self.is_terminated() {
            Lifecycle::Terminated
        } else if self.is_shutdown() {
            Lifecycle::ShuttingDown
        } else {
            Lifecycle::Active
        }
    }
}

/// Convenience submission for any executor, including trait objects.
pub trait ExecutorExt: Executor {
    fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(Box::new(f))
    }

    /// Submits `f` and returns a handle to its result.
    ///
    /// Panics are captured into the handle; fatal ones keep unwinding on
    /// the executing thread after being recorded.
    fn submit<F, T>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (task, handle) = task::task(f);
        self.execute(Box::new(move || {
            if let Some(failure) = task.run() {
                task::panic_handler::rethrow_if_fatal(&failure);
            }
        }))?;
        Ok(handle)
    }
}

impl<E: Executor + ?Sized> ExecutorExt for E {}

/// Executors that can run work after a delay.
pub trait ScheduledExecutor: Executor {
    fn schedule<F, T>(&self, f: F, delay: Duration) -> Result<ScheduledHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;

    /// Runs `f` first after `initial_delay`, then every `period` measured
    /// from the previous start.
    fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static;

    /// Runs `f` first after `initial_delay`, then `delay` after each run
    /// completes.
    fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static;
}
