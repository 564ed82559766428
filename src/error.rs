use crate::task::panic_handler::PanicInfo;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("executor already shut down")]
    Rejected,

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out waiting for task")]
    Timeout,

    #[error("task result was already taken")]
    ResultTaken,

    #[error("task failed: {0}")]
    TaskFailed(TaskError),

    #[error("looper was terminated")]
    LoopTerminated,

    #[error("thread interrupted")]
    Interrupted,

    #[error("looper error: {0}")]
    Looper(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("executors not initialized")]
    NotInitialized,

    #[error("already initialized")]
    AlreadyInitialized,
}

impl Error {
    pub fn looper<S: Into<String>>(msg: S) -> Self {
        Error::Looper(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Failure captured inside a task handle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    #[error("{0}")]
    Panicked(PanicInfo),

    /// The bound loop had already exited when the task was posted.
    #[error("looper was terminated before the task could run")]
    LoopTerminated,
}

impl TaskError {
    /// Fatal failures are rethrown on the loop thread instead of being
    /// left for `get`.
    pub fn is_fatal(&self) -> bool {
        match self {
            TaskError::Panicked(info) => info.fatal,
            TaskError::LoopTerminated => false,
        }
    }
}

impl From<TaskError> for Error {
    fn from(err: TaskError) -> Self {
        Error::TaskFailed(err)
    }
}
