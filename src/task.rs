//! Task handles and the frame driver
//!
//! A procedure starts eagerly: `spawn` polls it inline until the first
//! suspension and hands back the task handle. From then on, whoever wakes
//! the frame resumes it on their own thread - the registered executor for
//! a context switch, the `job` executor for a timer fire, the completing
//! thread for an inner await. There is no event loop.
//!
//! Polls are serialized by a small atomic state machine
//! (idle / polling / notified / done): a wake while idle resumes inline, a
//! wake during a poll flags a re-poll, a wake after completion is a no-op.
//! That makes stray and re-entrant wakes safe without ever blocking.
//!
//! While a frame is being polled, its context (state core + progress
//! state) sits on a thread-local stack so the primitive awaiters can find
//! the owning task. It's a stack, not a slot: an inner completion resumes
//! the outer frame on the same thread.

use crate::progress::{ProgressReporter, ProgressState};
use crate::state::StateCore;
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::mem::ManuallyDrop;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use thiserror::Error;

/// The join failed because the procedure panicked
#[derive(Debug, Clone, Error)]
pub enum JoinError {
    #[error("procedure panicked: {message}")]
    Panicked { message: String },
}

/// State + value slot shared between the handle and the frame
pub(crate) struct TaskShared<T> {
    pub(crate) core: Arc<StateCore>,
    value: OnceLock<T>,
}

// ---------------------------------------------------------------------
// Frame driver
// ---------------------------------------------------------------------

const PHASE_IDLE: u8 = 0;
const PHASE_POLLING: u8 = 1;
const PHASE_NOTIFIED: u8 = 2;
const PHASE_DONE: u8 = 3;

/// A suspended procedure: the boxed future plus the poll-state machine
pub(crate) struct Frame {
    future: Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    phase: AtomicU8,
    core: Arc<StateCore>,
    progress: Arc<dyn Any + Send + Sync>,
}

struct FrameContext {
    core: Arc<StateCore>,
    progress: Arc<dyn Any + Send + Sync>,
}

thread_local! {
    static ACTIVE_FRAMES: RefCell<Vec<FrameContext>> = const { RefCell::new(Vec::new()) };
}

/// Core of the procedure currently being polled on this thread, if any
pub(crate) fn current_core() -> Option<Arc<StateCore>> {
    ACTIVE_FRAMES.with(|stack| stack.borrow().last().map(|ctx| ctx.core.clone()))
}

/// Progress state of the procedure currently being polled on this thread
pub(crate) fn current_progress() -> Option<Arc<dyn Any + Send + Sync>> {
    ACTIVE_FRAMES.with(|stack| stack.borrow().last().map(|ctx| ctx.progress.clone()))
}

/// Drive the frame. The caller must have won the transition to
/// `PHASE_POLLING`; `spawn` starts there, `wake_frame` transitions from
/// idle.
fn resume(frame: &Arc<Frame>) {
    loop {
        let mut slot = frame.future.lock();
        let Some(future) = slot.as_mut() else {
            frame.phase.store(PHASE_DONE, Ordering::Release);
            return;
        };

        let waker = frame_waker(frame.clone());
        let mut cx = Context::from_waker(&waker);

        ACTIVE_FRAMES.with(|stack| {
            stack.borrow_mut().push(FrameContext {
                core: frame.core.clone(),
                progress: frame.progress.clone(),
            })
        });
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));
        ACTIVE_FRAMES.with(|stack| {
            stack.borrow_mut().pop();
        });

        match polled {
            Ok(Poll::Pending) => {
                drop(slot);
                if frame
                    .phase
                    .compare_exchange(
                        PHASE_POLLING,
                        PHASE_IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
                // A wake arrived mid-poll; go around again
                frame.phase.store(PHASE_POLLING, Ordering::Release);
            }
            Ok(Poll::Ready(())) => {
                *slot = None;
                frame.phase.store(PHASE_DONE, Ordering::Release);
                drop(slot);
                tracing::trace!("procedure completed");
                frame.core.complete();
                return;
            }
            Err(payload) => {
                *slot = None;
                frame.phase.store(PHASE_DONE, Ordering::Release);
                drop(slot);
                let message = panic_message(payload);
                tracing::debug!(%message, "procedure panicked");
                frame.core.fail(message);
                return;
            }
        }
    }
}

fn wake_frame(frame: &Arc<Frame>) {
    loop {
        match frame.phase.load(Ordering::Acquire) {
            PHASE_IDLE => {
                if frame
                    .phase
                    .compare_exchange(
                        PHASE_IDLE,
                        PHASE_POLLING,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    resume(frame);
                    return;
                }
            }
            PHASE_POLLING => {
                if frame
                    .phase
                    .compare_exchange(
                        PHASE_POLLING,
                        PHASE_NOTIFIED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
            }
            _ => return, // notified already, or done
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// Waker over Arc<Frame>: wake = resume the frame on the waking thread

const FRAME_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

fn frame_waker(frame: Arc<Frame>) -> Waker {
    let ptr = Arc::into_raw(frame) as *const ();
    unsafe { Waker::from_raw(RawWaker::new(ptr, &FRAME_VTABLE)) }
}

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    unsafe {
        Arc::increment_strong_count(ptr as *const Frame);
    }
    RawWaker::new(ptr, &FRAME_VTABLE)
}

unsafe fn waker_wake(ptr: *const ()) {
    let frame = unsafe { Arc::from_raw(ptr as *const Frame) };
    wake_frame(&frame);
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    let frame = unsafe { ManuallyDrop::new(Arc::from_raw(ptr as *const Frame)) };
    wake_frame(&frame);
}

unsafe fn waker_drop(ptr: *const ()) {
    unsafe {
        drop(Arc::from_raw(ptr as *const Frame));
    }
}

// ---------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------

pin_project_lite::pin_project! {
    /// Wraps the user future so the terminal value lands in the shared slot
    struct CaptureValue<F, T> {
        #[pin]
        inner: F,
        shared: Arc<TaskShared<T>>,
    }
}

impl<F, T> Future for CaptureValue<F, T>
where
    F: Future<Output = T>,
{
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(value) => {
                let _ = this.shared.value.set(value);
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Handle to an in-flight or completed asynchronous procedure.
///
/// Awaitable (yields a clone of the terminal value), joinable via
/// [`get`](Self::get), cancellable via [`cancel`](Self::cancel).
/// Progress-bearing variants hand out the consumer endpoint with
/// [`get_progress_reporter`](Self::get_progress_reporter).
///
/// Usually named through one of the aliases: [`Action`],
/// [`ActionWithProgress`], [`Operation`], [`OperationWithProgress`].
///
/// Handles are cheap to clone, but a task holds a single continuation
/// slot: await it from one place at a time (any number of threads may
/// block on [`get`](Self::get) concurrently).
pub struct AsyncTask<T, P = ()> {
    shared: Arc<TaskShared<T>>,
    progress: Arc<ProgressState<P>>,
    frame: Arc<Frame>,
}

/// Procedure with no value and no progress
pub type Action = AsyncTask<()>;
/// Procedure with no value, reporting progress of type P
pub type ActionWithProgress<P> = AsyncTask<(), P>;
/// Procedure returning T
pub type Operation<T> = AsyncTask<T>;
/// Procedure returning T, reporting progress of type P
pub type OperationWithProgress<T, P> = AsyncTask<T, P>;

impl<T, P> AsyncTask<T, P>
where
    T: Send + Sync + 'static,
    P: Send + 'static,
{
    /// Start a procedure. It runs inline on the calling thread until its
    /// first suspension point, then the handle is returned.
    pub fn spawn<F>(procedure: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let core = Arc::new(StateCore::new());
        let shared = Arc::new(TaskShared {
            core: core.clone(),
            value: OnceLock::new(),
        });
        let progress = Arc::new(ProgressState::<P>::new());

        let frame = Arc::new(Frame {
            future: Mutex::new(Some(Box::pin(CaptureValue {
                inner: procedure,
                shared: shared.clone(),
            }))),
            phase: AtomicU8::new(PHASE_POLLING),
            core,
            progress: progress.clone(),
        });

        tracing::trace!("procedure spawned");
        resume(&frame);

        Self {
            shared,
            progress,
            frame,
        }
    }
}

impl<T, P> AsyncTask<T, P> {
    /// Has the procedure reached its return?
    pub fn is_ready(&self) -> bool {
        self.shared.core.is_ready()
    }

    /// Block until the procedure completes and borrow its value.
    ///
    /// Safe to call any number of times; every call after completion
    /// returns the same value. A cancelled task completes as soon as its
    /// procedure returns, so `get` on it still finishes promptly.
    pub fn get(&self) -> Result<&T, JoinError> {
        self.shared.core.wait_ready();
        match self.shared.value.get() {
            Some(value) => Ok(value),
            None => Err(JoinError::Panicked {
                message: self
                    .shared
                    .core
                    .failure_message()
                    .unwrap_or_else(|| "no value".to_string()),
            }),
        }
    }

    /// Request cancellation. Non-blocking, always safe, idempotent; after
    /// completion it has no effect. With propagation enabled the request
    /// walks into whatever the procedure is currently awaiting, aborting
    /// a pending timed delay outright.
    pub fn cancel(&self) {
        self.shared.core.cancel();
    }

    /// Consumer endpoint of the progress channel
    pub fn get_progress_reporter(&self) -> ProgressReporter<P> {
        ProgressReporter::new(self.progress.clone())
    }
}

impl<T, P> Clone for AsyncTask<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            progress: self.progress.clone(),
            frame: self.frame.clone(),
        }
    }
}

impl<T, P> AsyncTask<T, P>
where
    T: Clone,
{
    fn ready_value(&self) -> T {
        if let Some(value) = self.shared.value.get() {
            return value.clone();
        }
        // The awaited procedure panicked; re-raise in the awaiting frame
        let message = self
            .shared
            .core
            .failure_message()
            .unwrap_or_else(|| "no value".to_string());
        panic!("awaited procedure failed: {message}");
    }
}

impl<T, P> Future for AsyncTask<T, P>
where
    T: Clone,
{
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let outer = current_core();

        if this.shared.core.is_ready() {
            if let Some(outer) = &outer {
                outer.clear_next();
            }
            return Poll::Ready(this.ready_value());
        }

        // Stitch the cancellation chain while suspended on this task
        if let Some(outer) = &outer {
            outer.link_next(Arc::downgrade(&this.shared.core));
        }

        if !this.shared.core.install_continuation(cx.waker()) {
            // Completed between the check and the install
            if let Some(outer) = &outer {
                outer.clear_next();
            }
            return Poll::Ready(this.ready_value());
        }
        Poll::Pending
    }
}
