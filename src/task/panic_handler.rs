use crate::error::TaskError;
use std::any::Any;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Panic payload marking a failure as unrecoverable.
#[derive(Debug, Clone)]
pub struct Fatal(pub String);

/// Aborts the current task with a failure the error sink will rethrow on the
/// loop thread instead of leaving it for `get`.
pub fn fatal<S: Into<String>>(msg: S) -> ! {
    std::panic::panic_any(Fatal(msg.into()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicInfo {
    pub message: String,
    pub fatal: bool,
}

impl PanicInfo {
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        if let Some(f) = payload.downcast_ref::<Fatal>() {
            return Self {
                message: f.0.clone(),
                fatal: true,
            };
        }

        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        Self {
            message,
            fatal: false,
        }
    }
}

impl std::fmt::Display for PanicInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fatal {
            write!(f, "fatal: {}", self.message)
        } else {
            write!(f, "panicked: {}", self.message)
        }
    }
}

/// Resumes unwinding with a `Fatal` payload if `error` is fatal.
pub fn rethrow_if_fatal(error: &TaskError) {
    if let TaskError::Panicked(info) = error {
        if info.fatal {
            resume_unwind(Box::new(Fatal(info.message.clone())));
        }
    }
}

/// Runs `f`, turning a panic into a `PanicInfo`.
pub fn catch<F, R>(f: F) -> Result<R, PanicInfo>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(PanicInfo::from_payload)
}

/// Fixed sink for failures that surface on an executor's own thread.
///
/// Fatal task failures are rethrown right here, crashing the calling
/// execution context. Everything else is logged and counted; callers still
/// see the failure through the task handle.
#[derive(Debug)]
pub struct ErrorSink {
    name: String,
    failures: AtomicUsize,
}

impl ErrorSink {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn report(&self, error: &TaskError) {
        self.failures.fetch_add(1, Ordering::Relaxed);

        match error {
            TaskError::Panicked(info) if info.fatal => {
                tracing::error!(executor = %self.name, message = %info.message, "fatal task failure");
                rethrow_if_fatal(error);
            }
            TaskError::Panicked(info) => {
                tracing::debug!(executor = %self.name, message = %info.message, "task panicked");
            }
            TaskError::LoopTerminated => {
                tracing::error!(executor = %self.name, "post failed: looper was terminated");
            }
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_success() {
        assert_eq!(catch(|| 42).unwrap(), 42);
    }

    #[test]
    fn test_catch_panic_message() {
        let info = catch(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(info.message, "boom 7");
        assert!(!info.fatal);
    }

    #[test]
    fn test_fatal_is_classified() {
        let info = catch(|| fatal("disk gone")).unwrap_err();
        assert_eq!(info.message, "disk gone");
        assert!(info.fatal);
        assert!(TaskError::Panicked(info).is_fatal());
    }

    #[test]
    fn test_sink_swallows_ordinary_failures() {
        let sink = ErrorSink::new("test");
        sink.report(&TaskError::Panicked(PanicInfo {
            message: "x".into(),
            fatal: false,
        }));
        sink.report(&TaskError::LoopTerminated);
        assert_eq!(sink.failure_count(), 2);
    }

    #[test]
    fn test_sink_rethrows_fatal() {
        let sink = ErrorSink::new("test");
        let result = catch(|| {
            sink.report(&TaskError::Panicked(PanicInfo {
                message: "unrecoverable".into(),
                fatal: true,
            }))
        });

        let info = result.unwrap_err();
        assert!(info.fatal);
        assert_eq!(info.message, "unrecoverable");
    }
}
