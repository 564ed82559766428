//! Cancellable, awaitable task handles.
//!
//! A submitted unit of work is split in two halves sharing one state cell:
//! the [`Task`] that an executor runs, and the [`TaskHandle`] given back to
//! the caller.

use super::panic_handler;
use crate::error::{Error, Result, TaskError};
use crate::thread::{self, Interrupter};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

enum Slot<T> {
    Pending,
    Running,
    Completed(T),
    Failed(TaskError),
    Cancelled,
    // completed, value moved out by `take`
    Taken,
}

impl<T> Slot<T> {
    fn state(&self) -> TaskState {
        match self {
            Slot::Pending => TaskState::Pending,
            Slot::Running => TaskState::Running,
            Slot::Completed(_) | Slot::Taken => TaskState::Completed,
            Slot::Failed(_) => TaskState::Failed,
            Slot::Cancelled => TaskState::Cancelled,
        }
    }
}

type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

struct State<T> {
    slot: Slot<T>,
    runner: Option<Interrupter>,
    on_cancel: Option<CancelCallback>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T> Inner<T> {
    /// Pending -> Running. Only one caller ever wins.
    fn begin(&self) -> bool {
        let mut state = self.state.lock();
        match state.slot {
            Slot::Pending => {
                state.slot = Slot::Running;
                state.runner = thread::current_interrupter();
                true
            }
            _ => false,
        }
    }

    /// Running -> Completed/Failed, unless cancelled in the meantime.
    fn finish(&self, result: std::result::Result<T, TaskError>) -> Option<TaskError> {
        let mut state = self.state.lock();
        state.runner = None;
        state.on_cancel = None;
        if !matches!(state.slot, Slot::Running) {
            return None;
        }

        let failure = match result {
            Ok(value) => {
                state.slot = Slot::Completed(value);
                None
            }
            Err(e) => {
                state.slot = Slot::Failed(e.clone());
                Some(e)
            }
        };
        drop(state);
        self.done.notify_all();
        failure
    }

    /// Running -> Pending between two runs of a periodic task.
    fn reset(&self) -> bool {
        let mut state = self.state.lock();
        state.runner = None;
        match state.slot {
            Slot::Running => {
                state.slot = Slot::Pending;
                true
            }
            _ => false,
        }
    }

    fn fail(&self, error: TaskError) -> bool {
        let mut state = self.state.lock();
        if state.slot.state().is_terminal() {
            return false;
        }
        state.slot = Slot::Failed(error);
        state.runner = None;
        state.on_cancel = None;
        drop(state);
        self.done.notify_all();
        true
    }

    fn cancel(&self, may_interrupt: bool) -> bool {
        let (runner, callback) = {
            let mut state = self.state.lock();
            match state.slot {
                Slot::Pending | Slot::Running => {}
                _ => return false,
            }
            let was_running = matches!(state.slot, Slot::Running);
            state.slot = Slot::Cancelled;
            let runner = if was_running && may_interrupt {
                state.runner.take()
            } else {
                None
            };
            (runner, state.on_cancel.take())
        };

        self.done.notify_all();
        if let Some(callback) = callback {
            callback();
        }
        if let Some(runner) = runner {
            runner.interrupt();
        }
        true
    }
}

/// Caller side of a submitted task.
pub struct TaskHandle<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TaskHandle<T> {
    /// Cancels the task if it has not completed yet.
    ///
    /// A pending task will never run. A running task keeps running, but its
    /// result is discarded; with `may_interrupt` its worker thread is also
    /// interrupted.
    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.lock().slot.state()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Blocks until the task reaches a terminal state.
    pub fn wait(&self) -> Result<()> {
        let state = self.wait_terminal(None)?;
        settled(&state.slot)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let state = self.wait_terminal(Instant::now().checked_add(timeout))?;
        settled(&state.slot)
    }

    /// Blocks until the task finishes and moves its result out.
    ///
    /// Works for results that cannot be cloned. Once taken, `get` and `take`
    /// on this handle or any clone of it return `Error::ResultTaken`.
    pub fn take(&self) -> Result<T> {
        let mut state = self.wait_terminal(None)?;
        take_value(&mut state.slot)
    }

    pub fn take_timeout(&self, timeout: Duration) -> Result<T> {
        let mut state = self.wait_terminal(Instant::now().checked_add(timeout))?;
        take_value(&mut state.slot)
    }

    fn wait_terminal(&self, deadline: Option<Instant>) -> Result<MutexGuard<'_, State<T>>> {
        let mut state = self.inner.state.lock();
        while !state.slot.state().is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut state, deadline).timed_out()
                        && !state.slot.state().is_terminal()
                    {
                        return Err(Error::Timeout);
                    }
                }
                None => self.inner.done.wait(&mut state),
            }
        }
        Ok(state)
    }

    /// Sets the callback fired when the task gets cancelled. Dropped
    /// silently once the task completes.
    pub(crate) fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        if !state.slot.state().is_terminal() {
            state.on_cancel = Some(Box::new(callback));
        }
    }

    pub(crate) fn fail(&self, error: TaskError) -> bool {
        self.inner.fail(error)
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Blocks until the task finishes and returns its result.
    ///
    /// Must not be called from the thread that is supposed to run the task.
    pub fn get(&self) -> Result<T> {
        let state = self.wait_terminal(None)?;
        outcome(&state.slot).map(T::clone)
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let state = self.wait_terminal(Instant::now().checked_add(timeout))?;
        outcome(&state.slot).map(T::clone)
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.state())
            .finish()
    }
}

fn outcome<T>(slot: &Slot<T>) -> Result<&T> {
    match slot {
        Slot::Completed(value) => Ok(value),
        Slot::Failed(e) => Err(Error::TaskFailed(e.clone())),
        Slot::Cancelled => Err(Error::Cancelled),
        Slot::Taken => Err(Error::ResultTaken),
        Slot::Pending | Slot::Running => Err(Error::Timeout),
    }
}

fn settled<T>(slot: &Slot<T>) -> Result<()> {
    match slot {
        Slot::Taken => Ok(()),
        slot => outcome(slot).map(|_| ()),
    }
}

fn take_value<T>(slot: &mut Slot<T>) -> Result<T> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Completed(value) => Ok(value),
        other => {
            let error = outcome(&other).err().unwrap_or(Error::ResultTaken);
            *slot = other;
            Err(error)
        }
    }
}

/// Executor side of a one-shot task.
///
/// Dropping a task that never ran cancels it, so waiters are released when
/// an executor discards queued work.
pub struct Task<T> {
    inner: Arc<Inner<T>>,
    func: Option<Box<dyn FnOnce() -> T + Send + 'static>>,
}

impl<T> Task<T> {
    /// Runs the body if the task is still pending. Returns the failure, if
    /// any, so the executor can hand it to its error sink.
    pub fn run(mut self) -> Option<TaskError> {
        let func = self.func.take()?;
        if !self.inner.begin() {
            return None;
        }

        let result = panic_handler::catch(func).map_err(TaskError::Panicked);
        self.inner.finish(result)
    }

    pub fn handle(&self) -> TaskHandle<T> {
        TaskHandle {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if self.func.is_some() {
            self.inner.cancel(false);
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.inner.state.lock().slot.state())
            .finish()
    }
}

/// Executor side of a repeating task. The handle stays `Pending` between
/// runs and never completes normally.
pub struct PeriodicTask {
    inner: Arc<Inner<()>>,
    func: Box<dyn FnMut() + Send + 'static>,
}

impl PeriodicTask {
    /// Runs one occurrence. `Ok(true)` means the task should be scheduled
    /// again; `Ok(false)` means it was cancelled; `Err` is the failure that
    /// ended it.
    pub fn run_and_reset(&mut self) -> std::result::Result<bool, TaskError> {
        if !self.inner.begin() {
            return Ok(false);
        }

        match panic_handler::catch(&mut self.func) {
            Ok(()) => Ok(self.inner.reset()),
            Err(info) => {
                let error = TaskError::Panicked(info);
                match self.inner.finish(Err(error.clone())) {
                    Some(e) => Err(e),
                    None => Ok(false),
                }
            }
        }
    }

    pub fn handle(&self) -> TaskHandle<()> {
        TaskHandle {
            inner: self.inner.clone(),
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.inner.cancel(false);
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("state", &self.inner.state.lock().slot.state())
            .finish()
    }
}

fn new_inner<T>() -> Arc<Inner<T>> {
    Arc::new(Inner {
        state: Mutex::new(State {
            slot: Slot::Pending,
            runner: None,
            on_cancel: None,
        }),
        done: Condvar::new(),
    })
}

/// Wraps `f` into a runnable task and its handle.
pub fn task<F, T>(f: F) -> (Task<T>, TaskHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
{
    let inner = new_inner();
    let handle = TaskHandle {
        inner: inner.clone(),
    };
    let task = Task {
        inner,
        func: Some(Box::new(f)),
    };
    (task, handle)
}

pub fn periodic<F>(f: F) -> (PeriodicTask, TaskHandle<()>)
where
    F: FnMut() + Send + 'static,
{
    let inner = new_inner();
    let handle = TaskHandle {
        inner: inner.clone(),
    };
    let task = PeriodicTask {
        inner,
        func: Box::new(f),
    };
    (task, handle)
}
