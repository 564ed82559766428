use super::scheduling::{self, Cadence};
use super::{Executor, ScheduledExecutor};
use crate::error::{Error, Result};
use crate::scheduler::{DelayKey, DelayQueue, PostError, Scheduler};
use crate::task::panic_handler::{self, Fatal};
use crate::task::{ErrorSink, Job, ScheduledHandle};
use crate::thread::{self, Interrupter, ThreadFactory, WorkerHandle};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    job: Job,
    periodic: bool,
}

struct State {
    jobs: DelayQueue<Entry>,
    workers: HashMap<usize, WorkerHandle>,
    live: usize,
    next_id: usize,
    shutdown: bool,
}

struct Core {
    factory: ThreadFactory,
    core_threads: usize,
    state: Mutex<State>,
    available: Condvar,
    terminated: Condvar,
    sink: Arc<ErrorSink>,
    completed: AtomicU64,
}

/// Fixed set of workers sharing one deadline queue.
///
/// Workers are started on first submission. Periodic tasks repeat for real
/// here, unlike on a [`LoopExecutor`](super::LoopExecutor) with the default
/// policy.
pub struct ScheduledPool {
    core: Arc<Core>,
}

impl ScheduledPool {
    pub fn new(factory: ThreadFactory, core_threads: usize) -> Result<Self> {
        if core_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }

        let sink = Arc::new(ErrorSink::new(factory.name()));
        Ok(Self {
            core: Arc::new(Core {
                factory,
                core_threads,
                state: Mutex::new(State {
                    jobs: DelayQueue::new(),
                    workers: HashMap::new(),
                    live: 0,
                    next_id: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
                terminated: Condvar::new(),
                sink,
                completed: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.core.factory.name()
    }

    pub fn core_threads(&self) -> usize {
        self.core.core_threads
    }

    pub fn pool_size(&self) -> usize {
        self.core.state.lock().live
    }

    /// Jobs waiting for their deadline or for a free worker.
    pub fn queued(&self) -> usize {
        self.core.state.lock().jobs.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.core.completed.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> usize {
        self.core.sink.failure_count()
    }

    fn prestart(&self) -> Result<()> {
        let mut state = self.core.state.lock();
        if state.shutdown {
            return Err(Error::Rejected);
        }
        self.core.fill(&mut state)
    }
}

impl Core {
    // caller holds the state lock
    fn fill(self: &Arc<Self>, state: &mut State) -> Result<()> {
        while state.live < self.core_threads {
            let id = state.next_id;
            let core = self.clone();
            let handle = self.factory.spawn(move |_| core.work(id))?;

            state.next_id += 1;
            state.live += 1;
            state.workers.insert(id, handle);
        }
        Ok(())
    }

    fn work(self: &Arc<Self>, id: usize) {
        let _exit = WorkerExit { core: self, id };

        while let Some(job) = self.next_job() {
            thread::clear_hook();
            thread::interrupted();
            let result = panic_handler::catch(job);
            self.completed.fetch_add(1, Ordering::Relaxed);

            match result {
                Ok(()) => {}
                Err(info) if info.fatal => std::panic::resume_unwind(Box::new(Fatal(info.message))),
                Err(info) => {
                    tracing::warn!(pool = %self.factory.name(), message = %info.message, "job panicked");
                }
            }
        }
    }

    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some((_, entry)) = state.jobs.pop_due(Instant::now()) {
                // let another worker look at the new head
                if !state.jobs.is_empty() {
                    self.available.notify_one();
                }
                return Some(entry.job);
            }
            if state.shutdown && state.jobs.is_empty() {
                return None;
            }
            match state.jobs.next_deadline() {
                Some(deadline) => {
                    self.available.wait_until(&mut state, deadline);
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    fn enqueue(&self, job: Job, deadline: Instant, periodic: bool) -> std::result::Result<DelayKey, PostError> {
        let mut state = self.state.lock();
        if state.shutdown {
            return Err(PostError(job));
        }

        let wake = state.jobs.next_deadline().map_or(true, |next| deadline < next);
        let key = state.jobs.push(Entry { job, periodic }, deadline);
        drop(state);

        if wake {
            self.available.notify_one();
        }
        Ok(key)
    }

    /// Stops accepting work and drops pending repetitions. Returns false if
    /// already shut down.
    fn begin_shutdown(&self) -> bool {
        let repetitions = {
            let mut state = self.state.lock();
            if state.shutdown {
                return false;
            }
            state.shutdown = true;
            if state.live == 0 {
                self.terminated.notify_all();
            }
            state.jobs.drain_where(|entry| entry.periodic)
        };
        self.available.notify_all();
        tracing::debug!(
            pool = %self.factory.name(),
            dropped = repetitions.len(),
            "shutting down"
        );
        drop(repetitions);
        true
    }

    fn interrupters(&self) -> Vec<Interrupter> {
        self.state
            .lock()
            .workers
            .values()
            .map(|w| w.interrupter().clone())
            .collect()
    }
}

impl Scheduler for Core {
    fn post_at(&self, job: Job, deadline: Instant) -> std::result::Result<DelayKey, PostError> {
        self.enqueue(job, deadline, false)
    }

    fn post_repeating_at(&self, job: Job, deadline: Instant) -> std::result::Result<DelayKey, PostError> {
        self.enqueue(job, deadline, true)
    }

    fn remove(&self, key: &DelayKey) -> bool {
        let entry = self.state.lock().jobs.remove(key);
        entry.is_some()
    }
}

struct WorkerExit<'a> {
    core: &'a Arc<Core>,
    id: usize,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.core.state.lock();
        state.workers.remove(&self.id);
        state.live -= 1;

        if state.shutdown {
            if state.live == 0 {
                self.core.terminated.notify_all();
            }
        } else if let Err(e) = self.core.fill(&mut state) {
            tracing::error!(pool = %self.core.factory.name(), error = %e, "failed to replace worker");
        }
    }
}

impl Executor for ScheduledPool {
    fn execute(&self, job: Job) -> Result<()> {
        self.schedule(job, Duration::ZERO).map(|_| ())
    }

    /// Queued one-shot jobs still run at their deadline; periodic tasks
    /// stop repeating.
    fn shutdown(&self) {
        self.core.begin_shutdown();
    }

    fn shutdown_now(&self) -> Vec<Job> {
        self.core.begin_shutdown();
        let drained: Vec<Job> = {
            let mut state = self.core.state.lock();
            state.jobs.drain().into_iter().map(|entry| entry.job).collect()
        };
        for interrupter in self.core.interrupters() {
            interrupter.interrupt();
        }
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.core.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.core.state.lock();
        state.shutdown && state.live == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.core.state.lock();
        while !(state.shutdown && state.live == 0) {
            match deadline {
                Some(deadline) => {
                    if self.core.terminated.wait_until(&mut state, deadline).timed_out() {
                        return state.shutdown && state.live == 0;
                    }
                }
                None => self.core.terminated.wait(&mut state),
            }
        }
        true
    }
}

impl ScheduledExecutor for ScheduledPool {
    fn schedule<F, T>(&self, f: F, delay: Duration) -> Result<ScheduledHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.prestart()?;
        Ok(scheduling::schedule_once(&self.core, &self.core.sink, f, delay))
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
        let cadence = Cadence::FixedRate(period).validate()?;
        self.prestart()?;
        Ok(scheduling::schedule_periodic(&self.core, &self.core.sink, f, initial_delay, cadence))
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
        let cadence = Cadence::FixedDelay(delay).validate()?;
        self.prestart()?;
        Ok(scheduling::schedule_periodic(&self.core, &self.core.sink, f, initial_delay, cadence))
    }
}

impl Drop for ScheduledPool {
    fn drop(&mut self) {
        self.core.begin_shutdown();
    }
}

impl std::fmt::Debug for ScheduledPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledPool")
            .field("name", &self.name())
            .field("core_threads", &self.core.core_threads)
            .field("pool_size", &self.pool_size())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::TaskState;
    use crate::thread::Priority;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::AtomicUsize;

    fn pool(threads: usize) -> ScheduledPool {
        let factory = ThreadFactory::new("sche-test", Priority::Normal, 0, true);
        ScheduledPool::new(factory, threads).unwrap()
    }

    fn wait_for(count: &AtomicUsize, at_least: usize) {
        let start = Instant::now();
        while count.load(Ordering::SeqCst) < at_least && start.elapsed() < Duration::from_secs(3) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_workers_start_lazily() {
        let pool = pool(3);
        assert_eq!(pool.pool_size(), 0);

        let handle = pool.schedule(|| 5, Duration::from_millis(10)).unwrap();
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(handle.get().unwrap(), 5);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_deadline_order_on_single_worker() {
        let pool = pool(1);
        let order = Arc::new(PlMutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (tag, delay) in [("c", 60u64), ("a", 10), ("b", 30)] {
            let order = order.clone();
            handles.push(
                pool.schedule(move || order.lock().push(tag), Duration::from_millis(delay))
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*order.lock(), vec!["a", "b", "c"]);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_fixed_rate_repeats_until_cancelled() {
        let pool = pool(2);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = pool
            .schedule_at_fixed_rate(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                Duration::ZERO,
                Duration::from_millis(10),
            )
            .unwrap();

        wait_for(&runs, 5);
        assert!(runs.load(Ordering::SeqCst) >= 5);
        assert!(handle.is_periodic());

        assert!(handle.cancel(false));
        std::thread::sleep(Duration::from_millis(30));
        let settled = runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(runs.load(Ordering::SeqCst), settled);
        assert!(matches!(handle.wait(), Err(Error::Cancelled)));

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_fixed_delay_spacing() {
        let pool = pool(1);
        let stamps = Arc::new(PlMutex::new(Vec::new()));
        let recorder = stamps.clone();
        let handle = pool
            .schedule_with_fixed_delay(
                move || {
                    recorder.lock().push(Instant::now());
                    std::thread::sleep(Duration::from_millis(10));
                },
                Duration::ZERO,
                Duration::from_millis(20),
            )
            .unwrap();

        let start = Instant::now();
        while stamps.lock().len() < 3 && start.elapsed() < Duration::from_secs(3) {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.cancel(false);

        let stamps = stamps.lock();
        assert!(stamps.len() >= 3);
        for pair in stamps.windows(2) {
            // 10ms of work plus 20ms of delay between starts
            assert!(pair[1] - pair[0] >= Duration::from_millis(30));
        }
        drop(stamps);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_periodic_failure_stops_repetition() {
        let pool = pool(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = pool
            .schedule_at_fixed_rate(
                move || {
                    if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                        panic!("third run fails");
                    }
                },
                Duration::ZERO,
                Duration::from_millis(5),
            )
            .unwrap();

        assert!(matches!(
            handle.wait_timeout(Duration::from_secs(3)),
            Err(Error::TaskFailed(TaskError::Panicked(_)))
        ));
        assert_eq!(handle.state(), TaskState::Failed);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(pool.failure_count(), 1);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_runs_delayed_one_shots_and_drops_repetitions() {
        let pool = pool(2);
        let one_shot = pool.schedule(|| "ran", Duration::from_millis(40)).unwrap();
        let periodic = pool
            .schedule_at_fixed_rate(|| {}, Duration::from_millis(40), Duration::from_millis(10))
            .unwrap();

        pool.shutdown();
        assert!(matches!(pool.schedule(|| (), Duration::ZERO), Err(Error::Rejected)));
        assert!(periodic.is_cancelled());

        assert_eq!(one_shot.get().unwrap(), "ran");
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert!(pool.is_terminated());
    }

    #[test]
    fn test_shutdown_now_returns_pending() {
        let pool = pool(1);
        let later = pool.schedule(|| (), Duration::from_secs(30)).unwrap();
        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 1);
        drop(drained);
        assert!(later.is_cancelled());
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_cancelled_job_leaves_queue() {
        let pool = pool(1);
        let handle = pool.schedule(|| (), Duration::from_secs(30)).unwrap();
        assert_eq!(pool.queued(), 1);
        assert!(handle.cancel(false));
        assert_eq!(pool.queued(), 0);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_rejects_zero_period() {
        let pool = pool(1);
        assert!(matches!(
            pool.schedule_with_fixed_delay(|| {}, Duration::ZERO, Duration::ZERO),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(pool.pool_size(), 0);
    }
}
