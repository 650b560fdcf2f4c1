//! Progress channel - "current progress", not progress history
//!
//! Single-producer / single-consumer, one sample deep, slot-overwrite.
//! If the producer reports twice before the consumer resumes, only the
//! latest sample survives. That's the point: the channel models where
//! the work is now.

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

pub(crate) struct ProgressState<P> {
    lock: Mutex<ProgressInner<P>>,
}

struct ProgressInner<P> {
    /// Latest sample; stays around as "where the work is" until overwritten
    latest: Option<P>,
    /// A fresh sample is waiting for the consumer
    is_ready: bool,
    /// Producer has terminated the stream; sticky
    is_finished: bool,
    /// Consumer continuation
    waker: Option<Waker>,
}

impl<P> ProgressState<P> {
    pub(crate) fn new() -> Self {
        Self {
            lock: Mutex::new(ProgressInner {
                latest: None,
                is_ready: false,
                is_finished: false,
                waker: None,
            }),
        }
    }

    fn publish(&self, sample: P, finished: bool) {
        let waker = {
            let mut inner = self.lock.lock();
            if inner.is_finished {
                // The stream has ended; late samples are dropped
                return;
            }
            inner.latest = Some(sample);
            inner.is_ready = true;
            inner.is_finished = finished;
            inner.waker.take()
        };
        // Resume the consumer with the lock released
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn finish(&self) {
        let waker = {
            let mut inner = self.lock.lock();
            inner.is_finished = true;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn has_next(&self) -> bool {
        let inner = self.lock.lock();
        inner.is_ready || !inner.is_finished
    }

    fn poll_next(&self, cx: &mut Context<'_>) -> Poll<Option<P>>
    where
        P: Clone,
    {
        let mut inner = self.lock.lock();
        if inner.is_ready {
            inner.is_ready = false;
            inner.waker = None;
            return Poll::Ready(inner.latest.clone());
        }
        if inner.is_finished {
            return Poll::Ready(None);
        }
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// Producer endpoint, obtained inside a procedure via
/// [`get_progress_controller`](crate::get_progress_controller).
///
/// Must only be driven from the procedure's own frame: calling
/// [`report`](Self::report) from inside the consumer's resume is not
/// supported.
pub struct ProgressController<P> {
    state: Arc<ProgressState<P>>,
}

impl<P> ProgressController<P> {
    pub(crate) fn new(state: Arc<ProgressState<P>>) -> Self {
        Self { state }
    }

    /// Publish a sample, overwriting any sample the consumer hasn't
    /// picked up yet
    pub fn report(&self, sample: P) {
        self.state.publish(sample, false);
    }

    /// Publish a final sample and terminate the stream
    pub fn report_final(&self, sample: P) {
        self.state.publish(sample, true);
    }

    /// Terminate the stream without a new sample
    pub fn finish(&self) {
        self.state.finish();
    }
}

impl<P> Clone for ProgressController<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

/// Consumer endpoint, obtained from a progress-bearing task handle.
///
/// A `Stream` of samples: poll it (e.g. with `StreamExt::next`) to
/// receive the latest sample, or `None` once the producer has finished
/// and the last sample was consumed.
pub struct ProgressReporter<P> {
    state: Arc<ProgressState<P>>,
}

impl<P> ProgressReporter<P> {
    pub(crate) fn new(state: Arc<ProgressState<P>>) -> Self {
        Self { state }
    }

    /// True while another sample may still arrive: a fresh sample is
    /// waiting, or the producer hasn't finished
    pub fn has_next(&self) -> bool {
        self.state.has_next()
    }
}

impl<P> Clone for ProgressReporter<P> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<P: Clone> Stream for ProgressReporter<P> {
    type Item = P;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<P>> {
        self.state.poll_next(cx)
    }
}
