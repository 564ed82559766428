pub use crate::config::{Config, ConfigBuilder, PeriodicPolicy};
pub use crate::error::{Error, Result, TaskError};
pub use crate::executor::{
    Executor, ExecutorExt, ImmediateExecutor, LoopExecutor, ScheduledExecutor, ScheduledPool,
    WorkerPool,
};
pub use crate::looper::Looper;
pub use crate::registry::Executors;
pub use crate::task::{fatal, ScheduledHandle, TaskHandle, TaskState};
pub use crate::thread::{thread_hook, Priority, ThreadFactory};
