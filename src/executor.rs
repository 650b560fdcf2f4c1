//! Executor registry - the three named entry points
//!
//! The framework never owns worker threads (the timer thread aside).
//! Everything it wants to run somewhere else goes through one of three
//! process-wide entries: `bg` for background work, `job` for timer
//! wake-ups, `fg` for "the UI thread". Each entry is just a function
//! that accepts a closure and arranges for it to run.
//!
//! Defaults when an entry is unset:
//! - `bg`: spawn a detached thread
//! - `job`: spawn a detached thread
//! - `fg`: run inline on the calling thread

use parking_lot::RwLock;
use std::sync::Arc;
use std::thread;

/// A unit of work handed to an executor entry
pub type Dispatch = Box<dyn FnOnce() + Send + 'static>;

type Entry = RwLock<Option<Arc<dyn Fn(Dispatch) + Send + Sync>>>;

static BG_ENTRY: Entry = RwLock::new(None);
static JOB_ENTRY: Entry = RwLock::new(None);
static FG_ENTRY: Entry = RwLock::new(None);

/// Install the background executor entry.
///
/// Intended to be called once during process initialization. Calling it
/// while async work is in flight is permitted but races with in-flight
/// dispatch lookups: work already being dispatched may still use the
/// previous entry.
pub fn set_bg_entry<F>(entry: F)
where
    F: Fn(Dispatch) + Send + Sync + 'static,
{
    *BG_ENTRY.write() = Some(Arc::new(entry));
}

/// Install the job executor entry (runs timer wake-ups).
pub fn set_job_entry<F>(entry: F)
where
    F: Fn(Dispatch) + Send + Sync + 'static,
{
    *JOB_ENTRY.write() = Some(Arc::new(entry));
}

/// Install the foreground executor entry.
pub fn set_fg_entry<F>(entry: F)
where
    F: Fn(Dispatch) + Send + Sync + 'static,
{
    *FG_ENTRY.write() = Some(Arc::new(entry));
}

pub(crate) fn dispatch_bg(work: Dispatch) {
    let entry = BG_ENTRY.read().clone();
    match entry {
        Some(entry) => entry(work),
        None => {
            thread::spawn(work);
        }
    }
}

pub(crate) fn dispatch_job(work: Dispatch) {
    let entry = JOB_ENTRY.read().clone();
    match entry {
        Some(entry) => entry(work),
        None => {
            thread::spawn(work);
        }
    }
}

pub(crate) fn dispatch_fg(work: Dispatch) {
    let entry = FG_ENTRY.read().clone();
    match entry {
        Some(entry) => entry(work),
        None => work(),
    }
}
