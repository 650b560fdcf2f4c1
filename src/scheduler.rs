//! Timed job scheduler
//!
//! One deadline-ordered queue, one timer thread. The thread sleeps until
//! the earliest deadline and then hands the job's callback to the `job`
//! executor entry. Inserting an earlier deadline preempts a longer wait;
//! removing the job currently being timed makes the thread discard it.
//!
//! The scheduler is a lazily-initialized process-wide service with an
//! explicit `shutdown` that joins the timer thread. A later `add_job`
//! restarts it, so tests (and long-lived hosts that tear the service
//! down) don't have to care about ordering. The service itself is
//! crate-internal; the only public piece is the opaque [`JobToken`].

use crate::executor;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A job closer to its deadline than this is dispatched rather than
/// re-timed.
const NEAR_DEADLINE: Duration = Duration::from_millis(1);

static SCHEDULER: OnceLock<JobScheduler> = OnceLock::new();

/// Handle to a scheduled job. Opaque, copyable, with a distinguishable
/// null used as the "no job" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobToken(u64);

impl JobToken {
    /// The null token. Never assigned to a live job.
    pub const NULL: JobToken = JobToken(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

type JobCallback = Box<dyn FnOnce() + Send>;

struct JobEntry {
    token: JobToken,
    deadline: Instant,
    callback: JobCallback,
}

struct SchedulerInner {
    /// Pending jobs, sorted by deadline ascending
    queue: VecDeque<JobEntry>,
    /// Token of the entry the timer thread has popped and is timing;
    /// null when none. `remove_job` nulls it to abort an in-flight wait.
    current: JobToken,
    /// Monotonic token ids, starting at 1 (0 is the null sentinel)
    next_token: u64,
}

struct Shared {
    inner: Mutex<SchedulerInner>,
    cond: Condvar,
    exit: AtomicBool,
}

/// The timed job scheduler service. Crate-internal: procedures reach it
/// through `timespan`, never directly.
pub(crate) struct JobScheduler {
    shared: Arc<Shared>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// An independent scheduler with its own queue and timer thread.
    /// Most callers want [`global`](Self::global) instead.
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(SchedulerInner {
                    queue: VecDeque::new(),
                    current: JobToken::NULL,
                    next_token: 1,
                }),
                cond: Condvar::new(),
                exit: AtomicBool::new(false),
            }),
            timer: Mutex::new(None),
        }
    }

    /// The process-wide scheduler, constructed on first use. Timed
    /// delays inside procedures go through this one.
    pub(crate) fn global() -> &'static JobScheduler {
        SCHEDULER.get_or_init(JobScheduler::new)
    }

    /// Schedule `callback` to be posted to the `job` executor once `dur`
    /// has elapsed. Returns the job's token.
    pub(crate) fn add_job<F>(&self, dur: Duration, callback: F) -> JobToken
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + dur;
        let token;
        {
            let mut inner = self.shared.inner.lock();
            token = JobToken(inner.next_token);
            inner.next_token += 1;

            let at = inner.queue.partition_point(|e| e.deadline <= deadline);
            inner.queue.insert(
                at,
                JobEntry {
                    token,
                    deadline,
                    callback: Box::new(callback),
                },
            );
            self.shared.cond.notify_all();
        }
        tracing::trace!(token = token.0, ?dur, "job scheduled");
        self.ensure_timer();
        token
    }

    /// Remove a pending job. Returns true if the job existed and will not
    /// fire, including the case where the timer thread was already timing
    /// it (the thread discards it on wake-up).
    pub(crate) fn remove_job(&self, token: JobToken) -> bool {
        if token.is_null() {
            return false;
        }

        let mut inner = self.shared.inner.lock();
        if let Some(at) = inner.queue.iter().position(|e| e.token == token) {
            inner.queue.remove(at);
            self.shared.cond.notify_all();
            tracing::trace!(token = token.0, "job removed");
            return true;
        }
        if inner.current == token {
            inner.current = JobToken::NULL;
            self.shared.cond.notify_all();
            tracing::trace!(token = token.0, "in-flight job discarded");
            return true;
        }
        false
    }

    /// Drop every pending job. In-flight work already handed to the `job`
    /// executor is not affected. Returns true if anything was dropped.
    pub(crate) fn clear_all_jobs(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.queue.is_empty() {
            return false;
        }
        inner.queue.clear();
        self.shared.cond.notify_all();
        true
    }

    /// Stop the timer thread and drop all pending jobs. Callbacks already
    /// handed to the `job` executor are not cancelled. A later `add_job`
    /// restarts the service.
    pub(crate) fn shutdown(&self) {
        self.shared.exit.store(true, Ordering::Release);
        self.shared.cond.notify_all();
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn ensure_timer(&self) {
        let mut slot = self.timer.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.shared.exit.store(false, Ordering::Release);
        let shared = self.shared.clone();
        *slot = Some(thread::spawn(move || timer_loop(shared)));
    }
}

impl Default for JobScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<Shared>) {
    tracing::debug!("timer thread started");
    loop {
        let mut inner = shared.inner.lock();

        if shared.exit.load(Ordering::Acquire) {
            inner.queue.clear();
            break;
        }

        if inner.queue.is_empty() {
            shared.cond.wait(&mut inner);
            continue;
        }

        let Some(entry) = inner.queue.pop_front() else {
            continue;
        };
        inner.current = entry.token;

        if entry.deadline > Instant::now() + NEAR_DEADLINE {
            // May wake early: a new earlier deadline, a removal, shutdown
            shared.cond.wait_until(&mut inner, entry.deadline);
        }

        if inner.current.is_null() {
            // Removed while we were timing it
            continue;
        }
        inner.current = JobToken::NULL;

        if entry.deadline.saturating_duration_since(Instant::now()) < NEAR_DEADLINE {
            drop(inner);
            tracing::trace!(token = entry.token.0, "job dispatched");
            executor::dispatch_job(entry.callback);
        } else {
            // An earlier entry arrived and cut the wait short; requeue
            let at = inner
                .queue
                .partition_point(|e| e.deadline <= entry.deadline);
            inner.queue.insert(at, entry);
        }
    }
    tracing::debug!("timer thread exiting");
}
