//! Single-threaded cooperative message loop.
//!
//! A [`Looper`] owns a deadline-ordered queue of jobs that is drained by
//! exactly one thread: either a thread that called [`Looper::prepare`] and
//! then [`Looper::run_loop`], or a worker started with [`Looper::spawn`].

use crate::error::{Error, Result};
use crate::scheduler::{deadline_after, PostError, Scheduler};
use crate::scheduler::delay_queue::{DelayKey, DelayQueue};
use crate::task::Job;
use crate::thread::{ThreadFactory, WorkerHandle};
use crossbeam_channel::bounded;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Identifies a posted message until it is dispatched or removed.
pub type MessageId = DelayKey;

thread_local! {
    static MY_LOOPER: RefCell<Option<Arc<Looper>>> = RefCell::new(None);
}

struct Queue {
    messages: DelayQueue<Job>,
    quitting: bool,
    exited: bool,
}

pub struct Looper {
    name: Mutex<String>,
    thread: ThreadId,
    queue: Mutex<Queue>,
    wake: Condvar,
    exit: Condvar,
    worker: Mutex<Option<WorkerHandle>>,
}

impl Looper {
    fn new(name: String) -> Self {
        Self {
            name: Mutex::new(name),
            thread: thread::current().id(),
            queue: Mutex::new(Queue {
                messages: DelayQueue::new(),
                quitting: false,
                exited: false,
            }),
            wake: Condvar::new(),
            exit: Condvar::new(),
            worker: Mutex::new(None),
        }
    }

    /// Binds a new looper to the calling thread.
    pub fn prepare<S: Into<String>>(name: S) -> Result<Arc<Looper>> {
        MY_LOOPER.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                return Err(Error::looper("only one looper may be bound per thread"));
            }
            let looper = Arc::new(Looper::new(name.into()));
            *slot = Some(looper.clone());
            Ok(looper)
        })
    }

    /// Looper bound to the calling thread, if any.
    pub fn my_looper() -> Option<Arc<Looper>> {
        MY_LOOPER.with(|slot| slot.borrow().clone())
    }

    /// Dispatches messages on the calling thread until the bound looper quits.
    pub fn run_loop() -> Result<()> {
        let looper = Self::my_looper().ok_or_else(|| Error::looper("no looper bound to this thread"))?;
        looper.dispatch();
        Ok(())
    }

    /// Starts a thread from `factory` that prepares a looper and loops on it.
    ///
    /// Blocks until the new looper is ready to accept messages.
    pub fn spawn(factory: &ThreadFactory) -> Result<Arc<Looper>> {
        let (ready_tx, ready_rx) = bounded::<Result<Arc<Looper>>>(1);

        let handle = factory.spawn(move |ctx| {
            let looper = match Looper::prepare(ctx.name()) {
                Ok(looper) => looper,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if ready_tx.send(Ok(looper.clone())).is_err() {
                return;
            }
            drop(ready_tx);
            looper.dispatch();
        })?;

        let looper = ready_rx
            .recv()
            .map_err(|_| Error::looper("looper thread exited before it was ready"))??;
        *looper.worker.lock() = Some(handle);

        tracing::debug!(looper = %looper.name(), "looper ready");
        Ok(looper)
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Renames the looper for diagnostics.
    pub fn set_name<S: Into<String>>(&self, name: S) {
        *self.name.lock() = name.into();
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub fn post(&self, job: Job) -> std::result::Result<MessageId, PostError> {
        self.post_at(job, Instant::now())
    }

    pub fn post_delayed(&self, job: Job, delay: Duration) -> std::result::Result<MessageId, PostError> {
        self.post_at(job, deadline_after(delay))
    }

    /// Queues `job` to run at `deadline`. Once the looper is quitting or
    /// gone the job is handed back instead.
    pub fn post_at(&self, job: Job, deadline: Instant) -> std::result::Result<MessageId, PostError> {
        let mut queue = self.queue.lock();
        if queue.quitting || queue.exited {
            return Err(PostError(job));
        }

        let wake = queue.messages.next_deadline().map_or(true, |next| deadline < next);
        let id = queue.messages.push(job, deadline);
        drop(queue);

        if wake {
            self.wake.notify_one();
        }
        Ok(id)
    }

    /// Removes a message that has not been dispatched yet.
    pub fn remove(&self, id: &MessageId) -> bool {
        let job = self.queue.lock().messages.remove(id);
        job.is_some()
    }

    pub fn has_message(&self, id: &MessageId) -> bool {
        self.queue.lock().messages.contains(id)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().messages.len()
    }

    /// Stops the loop once every message already due has been dispatched.
    /// Messages scheduled for later are dropped.
    pub fn quit_safely(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            if queue.quitting {
                return;
            }
            queue.quitting = true;
            queue.messages.drain_after(Instant::now())
        };
        self.wake.notify_all();
        tracing::debug!(looper = %self.name(), dropped = dropped.len(), "quitting safely");
        drop(dropped);
    }

    /// Stops the loop after the message currently running, dropping
    /// everything still queued.
    pub fn quit(&self) {
        let dropped = {
            let mut queue = self.queue.lock();
            queue.quitting = true;
            queue.messages.drain()
        };
        self.wake.notify_all();
        tracing::debug!(looper = %self.name(), dropped = dropped.len(), "quitting");
        drop(dropped);
    }

    pub fn is_quitting(&self) -> bool {
        self.queue.lock().quitting
    }

    /// True once the loop has returned and, for spawned loopers, the thread
    /// has finished.
    pub fn has_exited(&self) -> bool {
        if !self.queue.lock().exited {
            return false;
        }
        self.worker
            .lock()
            .as_ref()
            .map_or(true, |worker| worker.is_finished())
    }

    /// Waits up to `timeout` for the loop to exit.
    pub fn await_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        {
            let mut queue = self.queue.lock();
            while !queue.exited {
                match deadline {
                    Some(deadline) => {
                        if self.exit.wait_until(&mut queue, deadline).timed_out() && !queue.exited {
                            return false;
                        }
                    }
                    None => self.exit.wait(&mut queue),
                }
            }
        }

        // the loop has returned; reap the thread so that it is really gone
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::warn!(looper = %self.name(), "looper thread panicked");
            }
        }
        true
    }

    fn dispatch(self: &Arc<Self>) {
        let _exit = ExitGuard { looper: self };

        loop {
            let job = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some((_, job)) = queue.messages.pop_due(Instant::now()) {
                        break job;
                    }
                    if queue.quitting {
                        return;
                    }
                    match queue.messages.next_deadline() {
                        Some(deadline) => {
                            self.wake.wait_until(&mut queue, deadline);
                        }
                        None => self.wake.wait(&mut queue),
                    }
                }
            };
            // hooks and interrupts belong to the previous job
            crate::thread::clear_hook();
            crate::thread::interrupted();
            job();
        }
    }
}

impl Scheduler for Looper {
    fn post_at(&self, job: Job, deadline: Instant) -> std::result::Result<MessageId, PostError> {
        Looper::post_at(self, job, deadline)
    }

    fn remove(&self, key: &MessageId) -> bool {
        Looper::remove(self, key)
    }
}

impl std::fmt::Debug for Looper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Looper")
            .field("name", &self.name())
            .field("thread", &self.thread)
            .field("pending", &self.pending())
            .finish()
    }
}

/// Marks the looper as exited even if a job unwinds through the loop.
struct ExitGuard<'a> {
    looper: &'a Arc<Looper>,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        let leftover = {
            let mut queue = self.looper.queue.lock();
            queue.quitting = true;
            queue.exited = true;
            queue.messages.drain()
        };
        self.looper.exit.notify_all();

        MY_LOOPER.with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                slot.take();
            }
        });

        if thread::panicking() {
            tracing::error!(looper = %self.looper.name(), "looper thread is unwinding");
        } else {
            tracing::debug!(looper = %self.looper.name(), "looper exited");
        }
        drop(leftover);
    }
}
