//! strand - coroutine-style asynchronous tasks
//!
//! Write a straight-line asynchronous procedure; get back a handle that
//! is awaitable, joinable and cancellable at once. Modeled on the
//! Windows Runtime IAsyncAction/IAsyncOperation pattern:
//! - Hop between named execution contexts (`bg`, `job`, `fg`)
//! - Suspend for a timed duration through one shared deadline queue
//! - Cancellation propagates through chained awaits, aborting a pending
//!   delay outright
//! - Optionally publish "current progress" samples to an observer
//!
//! The tasks drive themselves: no runtime, no event loop. A frame
//! resumes on whichever thread wakes it, and the only thread the crate
//! owns is the timer thread behind the job scheduler.
//!
//! ```
//! use std::time::Duration;
//! use strand::{Operation, resume_background, timespan};
//!
//! let task = Operation::spawn(async {
//!     resume_background().await;
//!     timespan(Duration::from_millis(10)).await;
//!     51
//! });
//!
//! // The handle joins like a thread and awaits like a future
//! assert_eq!(*task.get().unwrap(), 51);
//! ```

pub mod awaiters;
pub mod executor;
pub mod progress;
pub mod scheduler;
pub mod state;
pub mod task;

pub use awaiters::{
    GetCancellationToken, GetProgressController, ResumeBackground, ResumeForeground, Timespan,
    Unblock, get_cancellation_token, get_progress_controller, resume_background,
    resume_foreground, timespan, unblock,
};
pub use executor::{Dispatch, set_bg_entry, set_fg_entry, set_job_entry};
pub use progress::{ProgressController, ProgressReporter};
pub use scheduler::JobToken;
pub use state::CancellationToken;
pub use task::{
    Action, ActionWithProgress, AsyncTask, JoinError, Operation, OperationWithProgress,
};
