use super::priority::Priority;
use super::worker::{WorkerContext, WorkerHandle, WorkerThread};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Builds named, priority-configured worker threads.
///
/// In multi-instance mode every thread gets a `-N` suffix from a counter
/// shared by all threads this factory creates.
#[derive(Debug)]
pub struct ThreadFactory {
    name: String,
    priority: Priority,
    os_priority: i32,
    multi: bool,
    stack_size: Option<usize>,
    counter: AtomicUsize,
}

impl ThreadFactory {
    pub fn new<S: Into<String>>(name: S, priority: Priority, os_priority: i32, multi: bool) -> Self {
        Self {
            name: name.into(),
            priority,
            os_priority,
            multi,
            stack_size: None,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_stack_size(mut self, size: Option<usize>) -> Self {
        self.stack_size = size;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn os_priority(&self) -> i32 {
        self.os_priority
    }

    pub fn is_multi(&self) -> bool {
        self.multi
    }

    /// Number of threads created so far.
    pub fn created(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub fn new_thread<F>(&self, body: F) -> WorkerThread
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        let number = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = if self.multi {
            format!("{}-{}", self.name, number)
        } else {
            self.name.clone()
        };

        WorkerThread::new(name, self.priority, self.os_priority, body)
            .with_stack_size(self.stack_size)
    }

    pub fn spawn<F>(&self, body: F) -> io::Result<WorkerHandle>
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        self.new_thread(body).start()
    }
}
