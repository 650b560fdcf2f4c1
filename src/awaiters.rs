//! The primitive awaiters
//!
//! Each suspension point a procedure can reach is one of these small
//! futures: a context switch onto a named executor, a timed delay through
//! the job scheduler, the markers that hand out the cancellation token
//! and the progress controller without suspending, and the adapter that
//! pushes blocking work onto a helper thread.
//!
//! They find the owning task through the frame driver's thread-local
//! context, which is what lets a bare `timespan(d).await` register its
//! abort hook on the right task.

use crate::executor;
use crate::progress::{ProgressController, ProgressState};
use crate::scheduler::JobScheduler;
use crate::state::CancellationToken;
use crate::task::{current_core, current_progress};
use parking_lot::Mutex;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::Duration;

// ---------------------------------------------------------------------
// Context switches
// ---------------------------------------------------------------------

/// Move the procedure onto the background executor. The next statement
/// runs wherever the `bg` entry put it (default: a fresh detached
/// thread).
///
/// Context switches never observe cancellation: a cancelled procedure
/// still hops, so a caller that cancelled it can still await it and pick
/// it up on its own thread.
pub fn resume_background() -> ResumeBackground {
    ResumeBackground { posted: false }
}

/// Move the procedure onto the foreground executor, or resume inline on
/// the completing thread when no `fg` entry is registered.
pub fn resume_foreground() -> ResumeForeground {
    ResumeForeground { posted: false }
}

pub struct ResumeBackground {
    posted: bool,
}

impl Future for ResumeBackground {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.posted {
            return Poll::Ready(());
        }
        self.posted = true;
        let waker = cx.waker().clone();
        executor::dispatch_bg(Box::new(move || waker.wake()));
        Poll::Pending
    }
}

pub struct ResumeForeground {
    posted: bool,
}

impl Future for ResumeForeground {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.posted {
            return Poll::Ready(());
        }
        self.posted = true;
        let waker = cx.waker().clone();
        executor::dispatch_fg(Box::new(move || waker.wake()));
        Poll::Pending
    }
}

// ---------------------------------------------------------------------
// Timed delay
// ---------------------------------------------------------------------

/// Suspend for `dur`. The wake-up fires on the `job` executor.
///
/// Inside a procedure the delay registers an abort hook on the owning
/// task, so a propagated `cancel()` dequeues the scheduler job and
/// resumes the sleeper immediately. Outside a procedure it still sleeps;
/// there is just no task to abort it through.
pub fn timespan(dur: Duration) -> Timespan {
    Timespan { dur, sleep: None }
}

pub struct Timespan {
    dur: Duration,
    sleep: Option<Arc<SleepShared>>,
}

struct SleepShared {
    /// One-shot guard: the timer fire and the cancel abort race to wake
    fired: AtomicBool,
    waker: Waker,
}

impl SleepShared {
    fn wake_once(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.waker.wake_by_ref();
        }
    }
}

impl Future for Timespan {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if let Some(sleep) = &this.sleep {
            if sleep.fired.load(Ordering::Acquire) {
                // The awaited episode is over; drop the abort hook
                if let Some(core) = current_core() {
                    core.clear_pending_delay();
                }
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        let sleep = Arc::new(SleepShared {
            fired: AtomicBool::new(false),
            waker: cx.waker().clone(),
        });

        let on_fire = sleep.clone();
        let token = JobScheduler::global().add_job(this.dur, move || on_fire.wake_once());

        if let Some(core) = current_core() {
            let on_abort = sleep.clone();
            core.set_pending_delay(
                token,
                Box::new(move || {
                    JobScheduler::global().remove_job(token);
                    on_abort.wake_once();
                }),
            );
            // Sleeping, not awaiting an inner task
            core.clear_next();
        }

        this.sleep = Some(sleep);
        Poll::Pending
    }
}

// ---------------------------------------------------------------------
// Markers: cancellation token, progress controller
// ---------------------------------------------------------------------

/// Obtain the [`CancellationToken`] of the current procedure. Never
/// suspends. Awaiting it outside a procedure is a usage error and
/// panics.
pub fn get_cancellation_token() -> GetCancellationToken {
    GetCancellationToken { _private: () }
}

pub struct GetCancellationToken {
    _private: (),
}

impl Future for GetCancellationToken {
    type Output = CancellationToken;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<CancellationToken> {
        let Some(core) = current_core() else {
            panic!("strand: get_cancellation_token() awaited outside a procedure");
        };
        Poll::Ready(CancellationToken::new(Arc::downgrade(&core)))
    }
}

/// Obtain the [`ProgressController`] of the current procedure. Never
/// suspends. `P` must match the progress type the task was spawned with;
/// a mismatch is a usage error and panics, as is awaiting this outside a
/// procedure.
pub fn get_progress_controller<P>() -> GetProgressController<P>
where
    P: Send + 'static,
{
    GetProgressController {
        _progress: PhantomData,
    }
}

pub struct GetProgressController<P> {
    _progress: PhantomData<P>,
}

impl<P> Future for GetProgressController<P>
where
    P: Send + 'static,
{
    type Output = ProgressController<P>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ProgressController<P>> {
        let Some(progress) = current_progress() else {
            panic!("strand: get_progress_controller() awaited outside a procedure");
        };
        match progress.downcast::<ProgressState<P>>() {
            Ok(state) => Poll::Ready(ProgressController::new(state)),
            Err(_) => panic!(
                "strand: progress type mismatch - the task was not spawned with this progress type"
            ),
        }
    }
}

// ---------------------------------------------------------------------
// Blocking-work adapter
// ---------------------------------------------------------------------

/// Run `work` on a detached helper thread and resume with its value.
///
/// This is the adapter for externally-supplied blocking primitives (a
/// join handle, a blocking receiver, a computation that just takes a
/// while). A panic inside `work` is re-raised at the await.
pub fn unblock<T, F>(work: F) -> Unblock<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    Unblock {
        work: Some(Box::new(work)),
        shared: None,
    }
}

pub struct Unblock<T> {
    work: Option<Box<dyn FnOnce() -> T + Send>>,
    shared: Option<Arc<UnblockShared<T>>>,
}

struct UnblockShared<T> {
    slot: Mutex<Option<thread::Result<T>>>,
    waker: Waker,
}

impl<T> Future for Unblock<T>
where
    T: Send + 'static,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if let Some(shared) = &this.shared {
            if let Some(result) = shared.slot.lock().take() {
                return match result {
                    Ok(value) => Poll::Ready(value),
                    Err(payload) => panic::resume_unwind(payload),
                };
            }
            return Poll::Pending;
        }

        let Some(work) = this.work.take() else {
            return Poll::Pending;
        };
        let shared = Arc::new(UnblockShared {
            slot: Mutex::new(None),
            waker: cx.waker().clone(),
        });
        let helper = shared.clone();
        thread::spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(work));
            *helper.slot.lock() = Some(result);
            helper.waker.wake_by_ref();
        });
        this.shared = Some(shared);
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Operation;

    #[test]
    fn test_timespan_resumes_after_duration() {
        use std::time::Instant;

        let start = Instant::now();
        let task = Operation::spawn(async move {
            timespan(Duration::from_millis(60)).await;
            start.elapsed()
        });

        let elapsed = *task.get().expect("delay completes");
        assert!(elapsed >= Duration::from_millis(55));
    }

    #[test]
    fn test_unblock_runs_off_thread() {
        let caller = thread::current().id();
        let task = Operation::spawn(async move {
            let helper = unblock(|| thread::current().id()).await;
            helper != caller
        });
        assert!(*task.get().expect("helper completes"));
    }

    #[test]
    fn test_unblock_propagates_panic() {
        let task = Operation::<()>::spawn(async {
            unblock(|| panic!("helper failed")).await;
        });
        assert!(task.get().is_err());
    }
}
