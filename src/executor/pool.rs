use super::Executor;
use crate::error::{Error, Result};
use crate::task::panic_handler::{self, Fatal};
use crate::task::Job;
use crate::thread::{self, Interrupter, ThreadFactory, WorkerHandle};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct PoolState {
    workers: HashMap<usize, WorkerHandle>,
    live: usize,
    largest: usize,
    next_id: usize,
    shutdown: bool,
}

struct Shared {
    factory: ThreadFactory,
    max_threads: usize,
    keep_alive: Duration,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    // dropped on shutdown so idle workers wake up
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    state: Mutex<PoolState>,
    terminated: Condvar,
    active: AtomicUsize,
    completed: AtomicU64,
}

/// Elastic pool for short, possibly blocking jobs.
///
/// Starts with no threads. A job is handed to an idle worker through a small
/// bounded queue; when the queue is full a new worker is started for it, up
/// to `max_threads`, and past that the job is rejected. Workers that stay
/// idle for `keep_alive` retire.
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(
        factory: ThreadFactory,
        max_threads: usize,
        queue_capacity: usize,
        keep_alive: Duration,
    ) -> Result<Self> {
        if max_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }
        if queue_capacity == 0 {
            return Err(Error::config("queue capacity must be > 0"));
        }
        if keep_alive.is_zero() {
            return Err(Error::config("keep_alive must be > 0"));
        }

        let (jobs_tx, jobs_rx) = bounded(queue_capacity);
        let (close_tx, close_rx) = bounded(0);

        Ok(Self {
            shared: Arc::new(Shared {
                factory,
                max_threads,
                keep_alive,
                jobs_tx,
                jobs_rx,
                close_tx: Mutex::new(Some(close_tx)),
                close_rx,
                state: Mutex::new(PoolState {
                    workers: HashMap::new(),
                    live: 0,
                    largest: 0,
                    next_id: 0,
                    shutdown: false,
                }),
                terminated: Condvar::new(),
                active: AtomicUsize::new(0),
                completed: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.factory.name()
    }

    pub fn max_threads(&self) -> usize {
        self.shared.max_threads
    }

    /// Worker threads currently alive.
    pub fn pool_size(&self) -> usize {
        self.shared.state.lock().live
    }

    pub fn largest_pool_size(&self) -> usize {
        self.shared.state.lock().largest
    }

    /// Workers currently running a job.
    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Jobs waiting in the handoff queue.
    pub fn queued(&self) -> usize {
        self.shared.jobs_rx.len()
    }

    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }
}

impl Shared {
    // caller holds the state lock
    fn add_worker(self: &Arc<Self>, state: &mut PoolState, first: Option<Job>) -> Result<()> {
        let id = state.next_id;
        let shared = self.clone();
        let handle = self
            .factory
            .spawn(move |_| shared.work(id, first))?;

        state.next_id += 1;
        state.live += 1;
        state.largest = state.largest.max(state.live);
        state.workers.insert(id, handle);
        Ok(())
    }

    fn work(self: &Arc<Self>, id: usize, first: Option<Job>) {
        let _exit = WorkerExit { shared: self, id };

        if let Some(job) = first {
            self.run_job(job);
        }
        while let Some(job) = self.next_job() {
            self.run_job(job);
        }
    }

    fn next_job(&self) -> Option<Job> {
        loop {
            // read the flag before the queue: every accepted job is already queued
            if self.state.lock().shutdown {
                return self.jobs_rx.try_recv().ok();
            }

            select! {
                recv(self.jobs_rx) -> job => {
                    if let Ok(job) = job {
                        return Some(job);
                    }
                }
                recv(self.close_rx) -> _ => {}
                default(self.keep_alive) => {
                    // a job racing with retirement is picked up by WorkerExit
                    if self.jobs_rx.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    fn run_job(&self, job: Job) {
        // hooks and interrupts belong to the previous job
        thread::clear_hook();
        thread::interrupted();

        self.active.fetch_add(1, Ordering::Relaxed);
        let result = panic_handler::catch(job);
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if let Err(info) = result {
            if info.fatal {
                tracing::error!(pool = %self.factory.name(), message = %info.message, "fatal job failure");
                std::panic::resume_unwind(Box::new(Fatal(info.message)));
            }
            tracing::warn!(pool = %self.factory.name(), message = %info.message, "job panicked");
        }
    }

    fn interrupters(&self) -> Vec<Interrupter> {
        self.state
            .lock()
            .workers
            .values()
            .map(|w| w.interrupter().clone())
            .collect()
    }

    fn begin_shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            if state.live == 0 {
                self.terminated.notify_all();
            }
        }
        self.close_tx.lock().take();
        tracing::debug!(pool = %self.factory.name(), "shutting down");
    }
}

// runs on the worker thread, also while unwinding from a fatal job
struct WorkerExit<'a> {
    shared: &'a Arc<Shared>,
    id: usize,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.workers.remove(&self.id);
        state.live -= 1;
        let last = state.live == 0;
        if last && state.shutdown {
            self.shared.terminated.notify_all();
        }
        // a queued job lost its worker; start a replacement
        if last && !state.shutdown && !self.shared.jobs_rx.is_empty() {
            if let Err(e) = self.shared.add_worker(&mut state, None) {
                tracing::error!(pool = %self.shared.factory.name(), error = %e, "failed to replace worker");
            }
        }
    }
}

impl Executor for WorkerPool {
    fn execute(&self, job: Job) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.shutdown {
            return Err(Error::Rejected);
        }

        // nobody would drain the queue, so the job goes straight to a new worker
        if state.live == 0 {
            return shared.add_worker(&mut state, Some(job));
        }

        match shared.jobs_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                if state.live >= shared.max_threads {
                    drop(state);
                    drop(job);
                    tracing::warn!(pool = %shared.factory.name(), max = shared.max_threads, "pool saturated");
                    return Err(Error::Rejected);
                }
                shared.add_worker(&mut state, Some(job))
            }
            // the pool owns both ends, so this cannot happen while we are alive
            Err(TrySendError::Disconnected(_)) => Err(Error::Rejected),
        }
    }

    fn shutdown(&self) {
        self.shared.begin_shutdown();
    }

    /// Hands back queued jobs and interrupts running workers.
    fn shutdown_now(&self) -> Vec<Job> {
        self.shared.begin_shutdown();
        let drained: Vec<Job> = self.shared.jobs_rx.try_iter().collect();
        for interrupter in self.shared.interrupters() {
            interrupter.interrupt();
        }
        drained
    }

    fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    fn is_terminated(&self) -> bool {
        let state = self.shared.state.lock();
        state.shutdown && state.live == 0
    }

    fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.shared.state.lock();
        while !(state.shutdown && state.live == 0) {
            match deadline {
                Some(deadline) => {
                    if self.shared.terminated.wait_until(&mut state, deadline).timed_out() {
                        return state.shutdown && state.live == 0;
                    }
                }
                None => self.shared.terminated.wait(&mut state),
            }
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.begin_shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name())
            .field("pool_size", &self.pool_size())
            .field("active", &self.active_count())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutorExt;
    use crate::thread::Priority;
    use std::collections::HashSet;

    fn pool(max_threads: usize, keep_alive: Duration) -> WorkerPool {
        let factory = ThreadFactory::new("elas-test", Priority::Normal, 0, true);
        WorkerPool::new(factory, max_threads, 1, keep_alive).unwrap()
    }

    #[test]
    fn test_starts_empty_and_grows() {
        let pool = pool(4, Duration::from_secs(5));
        assert_eq!(pool.pool_size(), 0);

        let handle = pool.submit(|| 7).unwrap();
        assert_eq!(handle.get().unwrap(), 7);
        assert_eq!(pool.pool_size(), 1);

        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert_eq!(pool.pool_size(), 0);
    }

    #[test]
    fn test_blocking_jobs_get_their_own_threads() {
        let pool = pool(8, Duration::from_secs(5));
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (name_tx, name_rx) = crossbeam_channel::unbounded::<String>();

        for _ in 0..4 {
            let release_rx = release_rx.clone();
            let name_tx = name_tx.clone();
            pool.spawn(move || {
                let name = std::thread::current().name().unwrap_or_default().to_string();
                let _ = name_tx.send(name);
                let _ = release_rx.recv();
            })
            .unwrap();
        }

        // at most one job may sit in the handoff queue behind the others
        let mut names = HashSet::new();
        for _ in 0..3 {
            names.insert(name_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.starts_with("elas-test-")));
        assert!(pool.largest_pool_size() >= 3);

        for _ in 0..4 {
            release_tx.send(()).unwrap();
        }
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert_eq!(pool.completed_count(), 4);
    }

    #[test]
    fn test_rejects_past_max_threads() {
        let pool = pool(1, Duration::from_secs(5));
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);

        {
            let release_rx = release_rx.clone();
            pool.spawn(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        }
        started_rx.recv().unwrap();

        // one slot in the queue, then nowhere to go
        pool.spawn(|| {}).unwrap();
        assert!(matches!(pool.spawn(|| {}), Err(Error::Rejected)));

        release_tx.send(()).unwrap();
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_idle_workers_retire() {
        let pool = pool(4, Duration::from_millis(30));
        pool.submit(|| ()).unwrap().get().unwrap();

        let start = Instant::now();
        while pool.pool_size() > 0 && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.pool_size(), 0);

        // and come back on demand
        assert_eq!(pool.submit(|| 1).unwrap().get().unwrap(), 1);
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = pool(2, Duration::from_secs(5));
        pool.spawn(|| panic!("job failed")).unwrap();
        assert_eq!(pool.submit(|| "still up").unwrap().get().unwrap(), "still up");
        pool.shutdown();
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_now_returns_queued_and_interrupts() {
        let pool = pool(1, Duration::from_secs(5));
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let (result_tx, result_rx) = crossbeam_channel::bounded::<bool>(1);

        pool.spawn(move || {
            let _ = started_tx.send(());
            let interrupted = crate::thread::sleep(Duration::from_secs(10)).is_err();
            let _ = result_tx.send(interrupted);
        })
        .unwrap();
        started_rx.recv().unwrap();
        pool.spawn(|| {}).unwrap();

        let drained = pool.shutdown_now();
        assert_eq!(drained.len(), 1);
        assert!(result_rx.recv_timeout(Duration::from_secs(2)).unwrap());
        assert!(pool.await_termination(Duration::from_secs(2)));
        assert!(matches!(pool.spawn(|| {}), Err(Error::Rejected)));
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = pool(1, Duration::from_secs(5));
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        let first = pool
            .submit(move || {
                let _ = gate_rx.recv();
                1
            })
            .unwrap();
        let second = pool.submit(|| 2).unwrap();

        pool.shutdown();
        assert!(!pool.is_terminated());
        gate_tx.send(()).unwrap();

        assert_eq!(first.get().unwrap(), 1);
        assert_eq!(second.get().unwrap(), 2);
        assert!(pool.await_termination(Duration::from_secs(2)));
    }

    #[cfg(all(target_os = "linux", target_pointer_width = "64"))]
    #[test]
    fn test_failed_spawn_leaves_nothing_queued() {
        let factory = ThreadFactory::new("elas-huge", Priority::Normal, 0, true)
            .with_stack_size(Some(1 << 47));
        let pool = WorkerPool::new(factory, 2, 1, Duration::from_secs(5)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let result = pool.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(matches!(result, Err(Error::Spawn(_))));
        assert_eq!(pool.queued(), 0);
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_invalid_sizes() {
        let factory = || ThreadFactory::new("bad", Priority::Normal, 0, true);
        assert!(WorkerPool::new(factory(), 0, 1, Duration::from_secs(1)).is_err());
        assert!(WorkerPool::new(factory(), 1, 0, Duration::from_secs(1)).is_err());
        assert!(WorkerPool::new(factory(), 1, 1, Duration::ZERO).is_err());
    }
}
