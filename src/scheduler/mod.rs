//! Deadline bookkeeping shared by the loop-bound and pooled executors.

pub mod delay_queue;

pub use delay_queue::{DelayKey, DelayQueue};

use crate::task::Job;
use std::time::{Duration, Instant};

/// Job handed back by a target that no longer accepts work.
pub struct PostError(pub Job);

impl std::fmt::Debug for PostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PostError(..)")
    }
}

/// Something that runs jobs at absolute deadlines.
pub trait Scheduler: Send + Sync {
    fn post_at(&self, job: Job, deadline: Instant) -> Result<DelayKey, PostError>;

    /// Posts the next occurrence of a periodic job. Targets that treat
    /// repetitions differently at shutdown override this.
    fn post_repeating_at(&self, job: Job, deadline: Instant) -> Result<DelayKey, PostError> {
        self.post_at(job, deadline)
    }

    /// Withdraws a job that has not started yet.
    fn remove(&self, key: &DelayKey) -> bool;
}

/// Roughly a century; used where `now + delay` would overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Absolute monotonic deadline `delay` from now, clamped instead of
/// overflowing.
pub fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_after_clamps() {
        let before = Instant::now();
        assert!(deadline_after(Duration::from_millis(10)) >= before + Duration::from_millis(10));
        assert!(deadline_after(Duration::MAX) > before);
    }
}
