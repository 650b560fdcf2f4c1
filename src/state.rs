//! Shared async state - the record behind every task
//!
//! One `StateCore` per task, shared by the handle and the frame driver.
//! It carries readiness (atomic fast path + mutex/condvar for blocking
//! joins), the cancellation flag, the outer continuation, the pending
//! timed delay (token + abort closure), the propagation policy bit, and
//! the weak `next` link that forms the cancellation chain.
//!
//! The chain is a weak singly-linked list, not a tree: a procedure awaits
//! at most one thing at a time, and traversal always walks toward leaves.

use crate::scheduler::JobToken;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;

pub(crate) struct StateCore {
    is_ready: AtomicBool,
    is_cancel: AtomicBool,
    /// Forward cancellation into the frame currently being awaited
    propagation: AtomicBool,
    lock: Mutex<CoreInner>,
    cond: Condvar,
}

struct CoreInner {
    /// Waker of the outer frame awaiting this task, if any. Set at most
    /// once per awaited episode, taken before resuming.
    continuation: Option<Waker>,
    /// Aborts the currently pending timed delay: dequeues the scheduler
    /// job and resumes the sleeper immediately
    cancel_fn: Option<Box<dyn FnOnce() + Send>>,
    /// Scheduler token of the pending timed delay
    cb_token: JobToken,
    /// The inner task this one is currently suspended on
    next: Weak<StateCore>,
    /// Panic message captured from the procedure body
    failure: Option<String>,
}

impl StateCore {
    pub(crate) fn new() -> Self {
        Self {
            is_ready: AtomicBool::new(false),
            is_cancel: AtomicBool::new(false),
            propagation: AtomicBool::new(true),
            lock: Mutex::new(CoreInner {
                continuation: None,
                cancel_fn: None,
                cb_token: JobToken::NULL,
                next: Weak::new(),
                failure: None,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.is_cancel.load(Ordering::Acquire)
    }

    pub(crate) fn enable_propagation(&self, value: bool) -> bool {
        self.propagation.swap(value, Ordering::AcqRel)
    }

    /// Mark ready, wake blocking joiners, resume the outer continuation.
    /// The continuation runs synchronously on the completing thread.
    pub(crate) fn complete(&self) {
        let waker = {
            let mut inner = self.lock.lock();
            self.is_ready.store(true, Ordering::Release);
            self.cond.notify_all();
            inner.continuation.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Complete with a captured panic instead of a value
    pub(crate) fn fail(&self, message: String) {
        let waker = {
            let mut inner = self.lock.lock();
            inner.failure = Some(message);
            self.is_ready.store(true, Ordering::Release);
            self.cond.notify_all();
            inner.continuation.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub(crate) fn failure_message(&self) -> Option<String> {
        self.lock.lock().failure.clone()
    }

    /// Block until the task is ready
    pub(crate) fn wait_ready(&self) {
        if self.is_ready() {
            return;
        }
        let mut inner = self.lock.lock();
        while !self.is_ready() {
            self.cond.wait(&mut inner);
        }
    }

    /// Register the outer continuation. Returns false if the state became
    /// ready first; the caller proceeds inline instead of suspending.
    pub(crate) fn install_continuation(&self, waker: &Waker) -> bool {
        let mut inner = self.lock.lock();
        if self.is_ready() {
            return false;
        }
        inner.continuation = Some(waker.clone());
        true
    }

    pub(crate) fn link_next(&self, next: Weak<StateCore>) {
        self.lock.lock().next = next;
    }

    pub(crate) fn clear_next(&self) {
        self.lock.lock().next = Weak::new();
    }

    pub(crate) fn set_pending_delay(&self, token: JobToken, abort: Box<dyn FnOnce() + Send>) {
        let mut inner = self.lock.lock();
        inner.cb_token = token;
        inner.cancel_fn = Some(abort);
    }

    pub(crate) fn clear_pending_delay(&self) {
        let mut inner = self.lock.lock();
        inner.cb_token = JobToken::NULL;
        inner.cancel_fn = None;
    }

    /// Cancel this task and, while propagation allows, every inner task
    /// reachable through the `next` chain. For each reachable state the
    /// cancel flag is set and the pending-delay abort (if any) is invoked,
    /// which dequeues the timed job and resumes the sleeper immediately.
    ///
    /// Single pass; stops at the first broken weak link or the first
    /// frame that turned propagation off. A state that completed in the
    /// meantime is still visited - cancelling it has no effect.
    pub(crate) fn cancel(&self) {
        self.is_cancel.store(true, Ordering::Release);
        if !self.propagation.load(Ordering::Acquire) {
            return;
        }

        tracing::debug!("cancellation walk started");
        let mut next = self.lock.lock().next.upgrade();
        while let Some(state) = next {
            state.is_cancel.store(true, Ordering::Release);

            let (abort, pending, link) = {
                let mut inner = state.lock.lock();
                let pending = inner.cb_token;
                inner.cb_token = JobToken::NULL;
                (inner.cancel_fn.take(), pending, inner.next.clone())
            };
            if !pending.is_null() {
                tracing::trace!(?pending, "aborting pending timed job");
            }
            // Never invoked under the state lock - the abort resumes the
            // sleeping frame on this thread
            if let Some(abort) = abort {
                abort();
            }

            if !state.propagation.load(Ordering::Acquire) {
                break;
            }
            next = link.upgrade();
        }
    }
}

/// A non-owning view onto a task's cancellation state, obtained inside a
/// procedure via [`get_cancellation_token`](crate::get_cancellation_token).
///
/// Valid for the lifetime of the procedure that produced it; once the
/// task's state is gone the token reads as not cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    core: Weak<StateCore>,
}

impl CancellationToken {
    pub(crate) fn new(core: Weak<StateCore>) -> Self {
        Self { core }
    }

    /// Has the owning task been cancelled?
    pub fn is_canceled(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.is_canceled())
    }

    /// Set whether cancellation of the owning task is forwarded into the
    /// frame it is currently awaiting. Returns the previous setting.
    ///
    /// Turning propagation off makes this frame a cancellation firewall:
    /// a `cancel()` arriving from above marks the frame cancelled but
    /// goes no further.
    pub fn enable_propagation(&self, value: bool) -> bool {
        match self.core.upgrade() {
            Some(core) => core.enable_propagation(value),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(states: &[Arc<StateCore>]) {
        for pair in states.windows(2) {
            pair[0].link_next(Arc::downgrade(&pair[1]));
        }
    }

    #[test]
    fn test_cancel_is_monotonic_and_immediate() {
        let core = StateCore::new();
        assert!(!core.is_canceled());
        core.cancel();
        assert!(core.is_canceled());
        core.cancel();
        assert!(core.is_canceled());
    }

    #[test]
    fn test_enable_propagation_returns_previous() {
        let core = StateCore::new();
        assert!(core.enable_propagation(false));
        assert!(!core.enable_propagation(true));
    }

    #[test]
    fn test_cancel_reaches_whole_chain() {
        let states: Vec<_> = (0..3).map(|_| Arc::new(StateCore::new())).collect();
        chain(&states);

        states[0].cancel();
        for state in &states {
            assert!(state.is_canceled());
        }
    }

    #[test]
    fn test_propagation_firewall_stops_walk() {
        let states: Vec<_> = (0..4).map(|_| Arc::new(StateCore::new())).collect();
        chain(&states);
        states[1].enable_propagation(false);

        states[0].cancel();
        assert!(states[0].is_canceled());
        assert!(states[1].is_canceled()); // firewall frame itself is marked
        assert!(!states[2].is_canceled());
        assert!(!states[3].is_canceled());
    }

    #[test]
    fn test_walk_stops_at_dead_link() {
        let a = Arc::new(StateCore::new());
        let b = Arc::new(StateCore::new());
        let c = Arc::new(StateCore::new());
        a.link_next(Arc::downgrade(&b));
        b.link_next(Arc::downgrade(&c));
        drop(b);

        a.cancel();
        assert!(a.is_canceled());
        assert!(!c.is_canceled());
    }

    #[test]
    fn test_cancel_invokes_pending_delay_abort() {
        use std::sync::atomic::AtomicUsize;

        let outer = Arc::new(StateCore::new());
        let inner = Arc::new(StateCore::new());
        outer.link_next(Arc::downgrade(&inner));

        let aborted = Arc::new(AtomicUsize::new(0));
        let a = aborted.clone();
        inner.set_pending_delay(
            JobToken::NULL,
            Box::new(move || {
                a.fetch_add(1, Ordering::AcqRel);
            }),
        );

        outer.cancel();
        assert_eq!(aborted.load(Ordering::Acquire), 1);

        // The abort closure is one-shot
        outer.cancel();
        assert_eq!(aborted.load(Ordering::Acquire), 1);
    }

    #[test]
    fn test_token_outliving_state_reads_not_cancelled() {
        let core = Arc::new(StateCore::new());
        let token = CancellationToken::new(Arc::downgrade(&core));
        core.cancel();
        assert!(token.is_canceled());
        drop(core);
        assert!(!token.is_canceled());
    }
}
