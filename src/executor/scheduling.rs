// one-shot and repeating submission onto any Scheduler
use crate::error::{Error, Result, TaskError};
use crate::scheduler::{deadline_after, DelayKey, PostError, Scheduler};
use crate::task::{self, ErrorSink, Job, PeriodicTask, ScheduledHandle, TaskHandle};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cadence {
    FixedRate(Duration),
    FixedDelay(Duration),
}

impl Cadence {
    pub(crate) fn validate(self) -> Result<Self> {
        let period = match self {
            Cadence::FixedRate(p) | Cadence::FixedDelay(p) => p,
        };
        if period.is_zero() {
            return Err(Error::invalid_argument("period must be > 0"));
        }
        Ok(self)
    }

    fn next_deadline(self, previous: Instant) -> Instant {
        match self {
            Cadence::FixedRate(period) => previous
                .checked_add(period)
                .unwrap_or_else(|| deadline_after(period)),
            Cadence::FixedDelay(delay) => deadline_after(delay),
        }
    }
}

type KeySlot = Arc<Mutex<Option<DelayKey>>>;

// the callback is armed before posting; `store_key` covers a cancel that
// lands before the key is known
fn remove_on_cancel<S, T>(target: &Arc<S>, handle: &TaskHandle<T>) -> KeySlot
where
    S: Scheduler + 'static,
{
    let slot: KeySlot = Arc::new(Mutex::new(None));
    let target = Arc::downgrade(target);
    let current = slot.clone();
    handle.on_cancel(move || {
        let key = current.lock().take();
        if let (Some(target), Some(key)) = (target.upgrade(), key) {
            target.remove(&key);
        }
    });
    slot
}

fn store_key<S: Scheduler, T>(target: &S, slot: &KeySlot, key: DelayKey, handle: &TaskHandle<T>) {
    *slot.lock() = Some(key);
    if handle.is_cancelled() {
        let key = slot.lock().take();
        if let Some(key) = key {
            target.remove(&key);
        }
    }
}

pub(crate) fn schedule_once<S, F, T>(
    target: &Arc<S>,
    sink: &Arc<ErrorSink>,
    f: F,
    delay: Duration,
) -> ScheduledHandle<T>
where
    S: Scheduler + 'static,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let deadline = deadline_after(delay);
    let (task, handle) = task::task(f);
    let scheduled = ScheduledHandle::new(handle.clone(), deadline, false);
    let slot = remove_on_cancel(target, &handle);

    let job_sink = sink.clone();
    let job: Job = Box::new(move || {
        if let Some(failure) = task.run() {
            job_sink.report(&failure);
        }
    });

    match target.post_at(job, deadline) {
        Ok(key) => store_key(target.as_ref(), &slot, key, &handle),
        Err(PostError(job)) => {
            handle.fail(TaskError::LoopTerminated);
            drop(job);
            sink.report(&TaskError::LoopTerminated);
        }
    }

    scheduled
}

pub(crate) fn schedule_periodic<S, F>(
    target: &Arc<S>,
    sink: &Arc<ErrorSink>,
    f: F,
    initial_delay: Duration,
    cadence: Cadence,
) -> ScheduledHandle<()>
where
    S: Scheduler + 'static,
    F: FnMut() + Send + 'static,
{
    let deadline = deadline_after(initial_delay);
    let (task, handle) = task::periodic(f);
    let scheduled = ScheduledHandle::new(handle.clone(), deadline, true);
    let current = remove_on_cancel(target, &handle);

    let repeating = Arc::new(Repeating {
        target: Arc::downgrade(target),
        sink: sink.clone(),
        cadence,
        scheduled: scheduled.clone(),
        current,
    });
    repeating.post(task, deadline);

    scheduled
}

struct Repeating<S> {
    target: Weak<S>,
    sink: Arc<ErrorSink>,
    cadence: Cadence,
    scheduled: ScheduledHandle<()>,
    current: KeySlot,
}

impl<S: Scheduler + 'static> Repeating<S> {
    // dropping `task` on any failure path cancels its handle
    fn post(self: &Arc<Self>, task: PeriodicTask, deadline: Instant) {
        let target = match self.target.upgrade() {
            Some(target) => target,
            None => return,
        };

        self.scheduled.set_deadline(deadline);
        let this = self.clone();
        let job: Job = Box::new(move || this.run(task, deadline));

        match target.post_repeating_at(job, deadline) {
            Ok(key) => store_key(target.as_ref(), &self.current, key, self.scheduled.task_handle()),
            Err(PostError(job)) => {
                tracing::debug!("periodic task dropped: target no longer accepts work");
                drop(job);
            }
        }
    }

    fn run(self: &Arc<Self>, mut task: PeriodicTask, deadline: Instant) {
        self.current.lock().take();

        match task.run_and_reset() {
            Ok(true) => {
                let next = self.cadence.next_deadline(deadline);
                self.post(task, next);
            }
            Ok(false) => {}
            Err(failure) => self.sink.report(&failure),
        }
    }
}
