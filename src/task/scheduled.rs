use super::handle::{TaskHandle, TaskState};
use crate::error::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Handle for delayed and periodic work.
///
/// For periodic tasks the deadline moves forward after each run.
pub struct ScheduledHandle<T> {
    handle: TaskHandle<T>,
    deadline: Arc<Mutex<Instant>>,
    periodic: bool,
}

impl<T> Clone for ScheduledHandle<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            deadline: self.deadline.clone(),
            periodic: self.periodic,
        }
    }
}

impl<T> ScheduledHandle<T> {
    pub(crate) fn new(handle: TaskHandle<T>, deadline: Instant, periodic: bool) -> Self {
        Self {
            handle,
            deadline: Arc::new(Mutex::new(deadline)),
            periodic,
        }
    }

    pub(crate) fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock() = deadline;
    }

    pub fn deadline(&self) -> Instant {
        *self.deadline.lock()
    }

    /// Time left until the next run, zero once the deadline has passed.
    pub fn delay(&self) -> Duration {
        self.deadline().saturating_duration_since(Instant::now())
    }

    pub fn is_periodic(&self) -> bool {
        self.periodic
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.handle.cancel(may_interrupt)
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    pub fn wait(&self) -> Result<()> {
        self.handle.wait()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.handle.wait_timeout(timeout)
    }

    /// Moves the result out; see [`TaskHandle::take`].
    pub fn take(&self) -> Result<T> {
        self.handle.take()
    }

    pub fn take_timeout(&self, timeout: Duration) -> Result<T> {
        self.handle.take_timeout(timeout)
    }

    pub fn task_handle(&self) -> &TaskHandle<T> {
        &self.handle
    }
}

impl<T: Clone> ScheduledHandle<T> {
    pub fn get(&self) -> Result<T> {
        self.handle.get()
    }

    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        self.handle.get_timeout(timeout)
    }
}

impl<T> std::fmt::Debug for ScheduledHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("state", &self.state())
            .field("delay", &self.delay())
            .field("periodic", &self.periodic)
            .finish()
    }
}
