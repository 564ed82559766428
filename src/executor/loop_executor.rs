use super::scheduling::{self, Cadence};
use super::{Executor, ScheduledExecutor};
use crate::config::PeriodicPolicy;
use crate::error::{Error, Result};
use crate::looper::Looper;
use crate::task::{ErrorSink, Job, ScheduledHandle};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ACTIVE: u8 = 0;
const SHUTTING_DOWN: u8 = 1;

/// Scheduled executor bound to a single [`Looper`].
///
/// Everything submitted runs sequentially on the looper's thread in
/// deadline order; equal deadlines run in submission order. Several
/// executors may share one looper, but shutting any of them down quits it.
pub struct LoopExecutor {
    looper: Arc<Looper>,
    state: AtomicU8,
    sink: Arc<ErrorSink>,
    periodic: PeriodicPolicy,
    warned_periodic: AtomicBool,
}

impl LoopExecutor {
    pub fn new(looper: Arc<Looper>) -> Self {
        Self::with_policy(looper, PeriodicPolicy::default())
    }

    pub fn with_policy(looper: Arc<Looper>, periodic: PeriodicPolicy) -> Self {
        let sink = Arc::new(ErrorSink::new(looper.name()));
        Self {
            looper,
            state: AtomicU8::new(ACTIVE),
            sink,
            periodic,
            warned_periodic: AtomicBool::new(false),
        }
    }

    pub fn looper(&self) -> &Arc<Looper> {
        &self.looper
    }

    pub fn periodic_policy(&self) -> PeriodicPolicy {
        self.periodic
    }

    /// Number of task failures reported on the loop thread so far.
    pub fn failure_count(&self) -> usize {
        self.sink.failure_count()
    }

    /// True when called from the looper's own thread.
    pub fn in_loop(&self) -> bool {
        self.looper.is_current_thread()
    }

    // only the caller that flips ACTIVE -> SHUTTING_DOWN gets true
    fn begin_shutdown(&self) -> bool {
        self.state
            .compare_exchange(ACTIVE, SHUTTING_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn check_active(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Rejected);
        }
        Ok(())
    }

    fn schedule_repeating<F>(&self, f: F, initial_delay: Duration, cadence: Cadence) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.check_active()?;
        let cadence = cadence.validate()?;

        match self.periodic {
            PeriodicPolicy::Repeat => Ok(scheduling::schedule_periodic(
                &self.looper,
                &self.sink,
                f,
                initial_delay,
                cadence,
            )),
            PeriodicPolicy::OneShot => {
                if !self.warned_periodic.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        looper = %self.looper.name(),
                        "periodic scheduling runs only once on this executor"
                    );
                }
                let mut f = f;
                self.schedule(move || f(), initial_delay)
            }
        }
    }
}

impl Executor for LoopExecutor {
    fn execute(&self, job: Job) -> Result<()> {
        self.schedule(job, Duration::ZERO).map(|_| ())
    }

    /// Quits the looper once the work that is already due has run.
    fn shutdown(&self) {
        if self.begin_shutdown() {
            tracing::debug!(looper = %self.looper.name(), "shutting down");
            self.looper.quit_safely();
        }
    }

    /// Same as `shutdown`; queued work is not reported back.
    fn shutdown_now(&self) -> Vec<Job> {
        self.shutdown();
        Vec::new()
    }

    fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::Acquire) != ACTIVE
    }

    fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.looper.has_exited()
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        self.looper.await_exit(timeout) && self.is_shutdown()
    }
}

impl ScheduledExecutor for LoopExecutor {
    fn schedule<F, T>(&self, f: F, delay: Duration) -> Result<ScheduledHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.check_active()?;
        Ok(scheduling::schedule_once(&self.looper, &self.sink, f, delay))
    }

    fn schedule_at_fixed_rate<F>(
        &self,
        f: F,
        initial_delay: Duration,
        period: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_repeating(f, initial_delay, Cadence::FixedRate(period))
    }

    fn schedule_with_fixed_delay<F>(
        &self,
        f: F,
        initial_delay: Duration,
        delay: Duration,
    ) -> Result<ScheduledHandle<()>>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_repeating(f, initial_delay, Cadence::FixedDelay(delay))
    }
}

impl std::fmt::Debug for LoopExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopExecutor")
            .field("looper", &self.looper.name())
            .field("lifecycle", &self.lifecycle())
            .field("periodic", &self.periodic)
            .finish()
    }
}
