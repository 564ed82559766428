//! Units of work and the handles returned for them.

pub mod handle;
pub mod panic_handler;
pub mod scheduled;

pub use handle::{periodic, task, PeriodicTask, Task, TaskHandle, TaskState};
pub use panic_handler::{fatal, ErrorSink, PanicInfo};
pub use scheduled::ScheduledHandle;

/// Type-erased unit of work as stored in executor queues.
pub type Job = Box<dyn FnOnce() + Send + 'static>;
