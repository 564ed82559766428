// managed worker threads
use super::priority::{self, Priority};
use crate::error::{Error, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

/// One-shot callback run just before a worker is interrupted.
pub type Hook = Box<dyn FnOnce() + Send + 'static>;

type Body = Box<dyn FnOnce(&WorkerContext) + Send + 'static>;

struct Shared {
    name: String,
    priority: Priority,
    os_priority: i32,
    hook: Mutex<Option<Hook>>,
    interrupted: AtomicBool,
    thread: OnceCell<Thread>,
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Shared>>> = RefCell::new(None);
}

/// Capability handed to the body of a worker thread.
///
/// It is `!Send`: only code running on the worker itself can attach an
/// interrupt hook, so a foreign thread can never race the owner for the slot.
pub struct WorkerContext {
    shared: Arc<Shared>,
    _not_send: PhantomData<*const ()>,
}

impl WorkerContext {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    pub fn os_priority(&self) -> i32 {
        self.shared.os_priority
    }

    /// Attaches `hook`, replacing (and dropping) any previous one.
    pub fn set_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.shared.hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_hook(&self) -> bool {
        self.shared.hook.lock().take().is_some()
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            shared: self.shared.clone(),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    /// Returns the interruption flag and clears it.
    pub fn interrupted(&self) -> bool {
        self.shared.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("name", &self.shared.name)
            .field("priority", &self.shared.priority)
            .field("os_priority", &self.shared.os_priority)
            .finish()
    }
}

/// Cloneable handle used by other threads to interrupt a worker.
#[derive(Clone)]
pub struct Interrupter {
    shared: Arc<Shared>,
}

impl Interrupter {
    /// Runs the attached hook (if any) exactly once, then raises the
    /// interruption flag and unparks the worker.
    ///
    /// A panicking hook unwinds into the caller and the flag stays down.
    pub fn interrupt(&self) {
        let hook = self.shared.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.shared.interrupted.store(true, Ordering::Release);
        if let Some(thread) = self.shared.thread.get() {
            thread.unpark();
        }
        tracing::trace!(thread = %self.shared.name, "interrupted");
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::Acquire)
    }

    pub fn has_hook(&self) -> bool {
        self.shared.hook.lock().is_some()
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("name", &self.shared.name)
            .finish()
    }
}

/// A not yet started worker thread.
pub struct WorkerThread {
    shared: Arc<Shared>,
    stack_size: Option<usize>,
    body: Body,
}

impl WorkerThread {
    pub fn new<S, F>(name: S, priority: Priority, os_priority: i32, body: F) -> Self
    where
        S: Into<String>,
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                priority,
                os_priority,
                hook: Mutex::new(None),
                interrupted: AtomicBool::new(false),
                thread: OnceCell::new(),
            }),
            stack_size: None,
            body: Box::new(body),
        }
    }

    pub fn with_stack_size(mut self, size: Option<usize>) -> Self {
        self.stack_size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn priority(&self) -> Priority {
        self.shared.priority
    }

    pub fn os_priority(&self) -> i32 {
        self.shared.os_priority
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            shared: self.shared.clone(),
        }
    }

    pub fn start(self) -> io::Result<WorkerHandle> {
        let mut builder = thread::Builder::new().name(self.shared.name.clone());
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }

        let interrupter = self.interrupter();
        let shared = self.shared;
        let body = self.body;
        let join = builder.spawn(move || run_entry(shared, body))?;

        Ok(WorkerHandle { join, interrupter })
    }
}

impl std::fmt::Debug for WorkerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThread")
            .field("name", &self.shared.name)
            .field("priority", &self.shared.priority)
            .field("os_priority", &self.shared.os_priority)
            .finish()
    }
}

fn run_entry(shared: Arc<Shared>, body: Body) {
    let _ = shared.thread.set(thread::current());

    // undo whatever priority was inherited from the spawning thread
    match priority::current_os_priority() {
        Ok(current) if current != shared.os_priority => {
            match priority::set_current_os_priority(shared.os_priority) {
                Ok(()) => tracing::debug!(
                    thread = %shared.name,
                    from = current,
                    to = shared.os_priority,
                    "adjusted os priority"
                ),
                Err(e) => tracing::warn!(
                    thread = %shared.name,
                    wanted = shared.os_priority,
                    error = %e,
                    "failed to set os priority"
                ),
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(thread = %shared.name, error = %e, "failed to read os priority"),
    }

    CURRENT.with(|current| *current.borrow_mut() = Some(shared.clone()));
    tracing::debug!(thread = %shared.name, priority = ?shared.priority, "worker started");

    let context = WorkerContext {
        shared,
        _not_send: PhantomData,
    };
    body(&context);

    CURRENT.with(|current| current.borrow_mut().take());
}

/// Join handle of a started worker.
pub struct WorkerHandle {
    join: JoinHandle<()>,
    interrupter: Interrupter,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        self.interrupter.name()
    }

    pub fn thread(&self) -> &Thread {
        self.join.thread()
    }

    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    pub fn interrupt(&self) {
        self.interrupter.interrupt();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> thread::Result<()> {
        self.join.join()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Attaches a one-shot interrupt hook to the calling worker thread.
///
/// Returns `false` when the calling thread was not started by this crate.
pub fn thread_hook<F>(hook: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    CURRENT.with(|current| match current.borrow().as_ref() {
        Some(shared) => {
            *shared.hook.lock() = Some(Box::new(hook));
            true
        }
        None => false,
    })
}

/// Detaches the calling worker's interrupt hook without running it.
pub fn clear_hook() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map_or(false, |shared| shared.hook.lock().take().is_some())
    })
}

/// Interrupter for the calling thread, if it is a managed worker.
pub fn current_interrupter() -> Option<Interrupter> {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map(|shared| Interrupter {
                shared: shared.clone(),
            })
    })
}

pub fn current_name() -> Option<String> {
    CURRENT.with(|current| current.borrow().as_ref().map(|s| s.name.clone()))
}

pub fn is_managed() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

pub fn is_interrupted() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map_or(false, |s| s.interrupted.load(Ordering::Acquire))
    })
}

/// Test-and-clear of the calling worker's interruption flag.
pub fn interrupted() -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .map_or(false, |s| s.interrupted.swap(false, Ordering::AcqRel))
    })
}

/// Sleeps for `duration`, returning early with `Error::Interrupted` if the
/// calling worker gets interrupted. The flag is cleared when that happens.
pub fn sleep(duration: Duration) -> Result<()> {
    let deadline = crate::scheduler::deadline_after(duration);
    loop {
        if interrupted() {
            return Err(Error::Interrupted);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        if is_managed() {
            thread::park_timeout(deadline - now);
        } else {
            thread::sleep(deadline - now);
        }
    }
}
