//! Named executors wired together from one [`Config`].
//!
//! [`Executors`] is an explicit context: build it once at startup next to the
//! main looper and pass it to whoever needs to submit work. For code that
//! cannot thread a reference through, [`init`] parks one instance in a
//! process-wide slot that [`current`] hands out.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::executor::{Executor, ImmediateExecutor, LoopExecutor, ScheduledPool, WorkerPool};
use crate::looper::Looper;
use crate::thread::{self, ThreadFactory};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct Executors {
    config: Config,
    main_looper: Arc<Looper>,
    foreground: Arc<LoopExecutor>,
    immediate: Arc<ImmediateExecutor>,
    background: OnceCell<Arc<LoopExecutor>>,
    elastic: OnceCell<Arc<WorkerPool>>,
    scheduled: OnceCell<Arc<ScheduledPool>>,
}

impl Executors {
    /// Wires the executors around an existing main looper, which is renamed
    /// to `config.main_name`.
    pub fn new(config: Config, main_looper: Arc<Looper>) -> Result<Self> {
        config.validate()?;
        main_looper.set_name(config.main_name.clone());

        let foreground = Arc::new(LoopExecutor::with_policy(
            main_looper.clone(),
            config.loop_periodic,
        ));

        Ok(Self {
            config,
            main_looper,
            foreground,
            immediate: Arc::new(ImmediateExecutor::new()),
            background: OnceCell::new(),
            elastic: OnceCell::new(),
            scheduled: OnceCell::new(),
        })
    }

    /// Like [`Executors::new`], but spawns a dedicated thread for the main
    /// looper. Useful for services that have no UI loop of their own.
    pub fn with_spawned_main(config: Config) -> Result<Self> {
        config.validate()?;
        let factory = ThreadFactory::new(
            config.main_name.clone(),
            config.io_priority,
            config.io_os_priority,
            false,
        )
        .with_stack_size(config.stack_size);
        let looper = Looper::spawn(&factory)?;
        Self::new(config, looper)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn main_looper(&self) -> &Arc<Looper> {
        &self.main_looper
    }

    /// Loop executor on the main looper.
    pub fn foreground(&self) -> &Arc<LoopExecutor> {
        &self.foreground
    }

    /// Loop executor on the "work" looper. The first call spawns that
    /// looper's thread and blocks until it is ready.
    pub fn background(&self) -> Result<&Arc<LoopExecutor>> {
        self.background.get_or_try_init(|| {
            let looper = Looper::spawn(&self.work_factory())?;
            looper.set_name(self.config.work_name.clone());
            tracing::debug!(looper = %looper.name(), "background looper started");
            Ok(Arc::new(LoopExecutor::with_policy(looper, self.config.loop_periodic)))
        })
    }

    pub fn immediate(&self) -> &Arc<ImmediateExecutor> {
        &self.immediate
    }

    /// Elastic pool for short blocking jobs.
    pub fn elastic(&self) -> Result<&Arc<WorkerPool>> {
        self.elastic
            .get_or_try_init(|| self.new_elastic().map(Arc::new))
    }

    /// Scheduled pool for delayed and periodic jobs.
    pub fn scheduled(&self) -> Result<&Arc<ScheduledPool>> {
        self.scheduled.get_or_try_init(|| {
            let factory = ThreadFactory::new(
                self.config.scheduled_name.clone(),
                self.config.io_priority,
                self.config.io_os_priority,
                true,
            )
            .with_stack_size(self.config.stack_size);
            ScheduledPool::new(factory, self.config.scheduled_core_threads).map(Arc::new)
        })
    }

    /// Fresh loop executor on the main looper. Shutting it down quits the
    /// main looper for everyone.
    pub fn main(&self) -> LoopExecutor {
        LoopExecutor::with_policy(self.main_looper.clone(), self.config.loop_periodic)
    }

    /// Fresh elastic pool configured like [`Executors::elastic`].
    pub fn io(&self) -> Result<WorkerPool> {
        self.new_elastic()
    }

    /// See [`thread::thread_hook`].
    pub fn thread_hook<F>(&self, hook: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        thread::thread_hook(hook)
    }

    /// Shuts down every member that has been started.
    pub fn shutdown(&self) {
        for executor in self.members() {
            executor.shutdown();
        }
    }

    /// Waits for every started member within one shared `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        self.members().into_iter().all(|executor| {
            let left = deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
            executor.await_termination(left)
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.members().into_iter().all(|executor| executor.is_terminated())
    }

    fn members(&self) -> Vec<&dyn Executor> {
        let mut members: Vec<&dyn Executor> = vec![
            self.foreground.as_ref() as &dyn Executor,
            self.immediate.as_ref() as &dyn Executor,
        ];
        if let Some(background) = self.background.get() {
            members.push(background.as_ref());
        }
        if let Some(elastic) = self.elastic.get() {
            members.push(elastic.as_ref());
        }
        if let Some(scheduled) = self.scheduled.get() {
            members.push(scheduled.as_ref());
        }
        members
    }

    fn work_factory(&self) -> ThreadFactory {
        ThreadFactory::new(
            self.config.work_name.clone(),
            self.config.work_priority,
            self.config.work_os_priority,
            false,
        )
        .with_stack_size(self.config.stack_size)
    }

    fn new_elastic(&self) -> Result<WorkerPool> {
        let factory = ThreadFactory::new(
            self.config.elastic_name.clone(),
            self.config.io_priority,
            self.config.io_os_priority,
            true,
        )
        .with_stack_size(self.config.stack_size);
        WorkerPool::new(
            factory,
            self.config.pool_max_threads,
            self.config.pool_queue_capacity,
            self.config.keep_alive,
        )
    }
}

impl std::fmt::Debug for Executors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executors")
            .field("main_looper", &self.main_looper.name())
            .field("background", &self.background.get().is_some())
            .field("elastic", &self.elastic.get().is_some())
            .field("scheduled", &self.scheduled.get().is_some())
            .finish()
    }
}

static GLOBAL: RwLock<Option<Arc<Executors>>> = RwLock::new(None);

/// Builds the process-wide executors around `main_looper`.
pub fn init(config: Config, main_looper: Arc<Looper>) -> Result<Arc<Executors>> {
    let mut slot = GLOBAL.write();
    if slot.is_some() {
        return Err(Error::AlreadyInitialized);
    }

    let executors = Arc::new(Executors::new(config, main_looper)?);
    *slot = Some(executors.clone());
    Ok(executors)
}

pub fn current() -> Result<Arc<Executors>> {
    GLOBAL.read().clone().ok_or(Error::NotInitialized)
}

/// Empties the process-wide slot and shuts its executors down. The returned
/// instance can still be awaited.
pub fn shutdown() -> Result<Arc<Executors>> {
    let executors = GLOBAL.write().take().ok_or(Error::NotInitialized)?;
    executors.shutdown();
    Ok(executors)
}
