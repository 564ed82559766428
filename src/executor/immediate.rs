use super::Executor;
use crate::error::{Error, Result};
use crate::task::Job;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    running: usize,
    shutdown: bool,
}

/// Runs every job synchronously on the thread that submits it.
///
/// Termination means "shut down and nothing is mid-flight": a job that is
/// still running on some caller's thread keeps the executor alive until it
/// returns, even after `shutdown`.
#[derive(Debug, Default)]
pub struct ImmediateExecutor {
    state: Mutex<State>,
    quiescent: Condvar,
}

impl ImmediateExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs currently executing on caller threads.
    pub fn running_count(&self) -> usize {
        self.state.lock().running
    }

    fn enter(&self) -> Result<InFlight<'_>> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(Error::Rejected);
        }
        state.running += 1;
        Ok(InFlight { executor: self })
    }
}

// decrements even when the job unwinds back into the caller
struct InFlight<'a> {
    executor: &'a ImmediateExecutor,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.executor.state.lock();
        state.running -= 1;
        if state.running == 0 && state.shutdown {
            self.executor.quiescent.notify_all();
        }
    }
}

impl Executor for ImmediateExecutor {
    /// Runs `job` before returning. A panic in `job` propagates to the caller.
    fn execute(&self, job: Job) -> Result<()> {
        let _in_flight = self.enter()?;
        job();
        Ok(())
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        if state.running == 0 {
            self.quiescent.notify_all();
        }
    }

    fn shutdown_now(&self) -> Vec<Job> {
        self.shutdown();
        Vec::new()
    }

    fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.state.lock();
        state.shutdown && state.running == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !(state.shutdown && state.running == 0) {
            match deadline {
                Some(deadline) => {
                    if self.quiescent.wait_until(&mut state, deadline).timed_out() {
                        return state.shutdown && state.running == 0;
                    }
                }
                None => self.quiescent.wait(&mut state),
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorExt, Lifecycle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_on_caller_thread() {
        let executor = ImmediateExecutor::new();
        let caller = std::thread::current().id();
        let handle = executor.submit(move || std::thread::current().id() == caller).unwrap();
        assert!(handle.is_done());
        assert!(handle.get().unwrap());
    }

    #[test]
    fn test_sequential_jobs_then_shutdown() {
        let executor = ImmediateExecutor::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            executor
                .spawn(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(executor.running_count(), 0);
        assert!(!executor.is_terminated());

        executor.shutdown();
        assert!(executor.is_terminated());
        assert!(executor.await_termination(Duration::ZERO));
    }

    #[test]
    fn test_rejects_after_shutdown() {
        let executor = ImmediateExecutor::new();
        executor.shutdown();
        executor.shutdown();
        assert!(matches!(executor.spawn(|| {}), Err(Error::Rejected)));
        assert!(executor.shutdown_now().is_empty());
    }

    #[test]
    fn test_panic_reaches_caller() {
        let executor = ImmediateExecutor::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            executor.spawn(|| panic!("caller sees this")).unwrap();
        }));
        assert!(result.is_err());
        assert_eq!(executor.running_count(), 0);
    }

    #[test]
    fn test_termination_waits_for_in_flight() {
        let executor = Arc::new(ImmediateExecutor::new());
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(0);
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);

        let runner = {
            let executor = executor.clone();
            std::thread::spawn(move || {
                executor
                    .spawn(move || {
                        let _ = started_tx.send(());
                        let _ = release_rx.recv();
                    })
                    .unwrap();
            })
        };

        started_rx.recv().unwrap();
        executor.shutdown();
        assert_eq!(executor.lifecycle(), Lifecycle::ShuttingDown);
        assert!(!executor.await_termination(Duration::from_millis(30)));

        let waiter = {
            let executor = executor.clone();
            std::thread::spawn(move || executor.await_termination(Duration::from_secs(2)))
        };
        release_tx.send(()).unwrap();

        assert!(waiter.join().unwrap());
        runner.join().unwrap();
        assert_eq!(executor.lifecycle(), Lifecycle::Terminated);
    }
}
