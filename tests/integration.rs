//! Integration tests for the strand task framework
//!
//! End-to-end scenarios across spawning, context switches, the timed job
//! scheduler, cancellation propagation, and the progress channel.
//! Durations are tens of milliseconds to keep the suite quick; elapsed
//! assertions leave wide margins.

use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use strand::{
    Action, Operation, OperationWithProgress, get_cancellation_token, get_progress_controller,
    resume_background, set_bg_entry, set_job_entry, timespan,
};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// ============================================================================
// Composition
// ============================================================================

fn action_async() -> Action {
    Action::spawn(async {
        resume_background().await;
        timespan(Duration::from_millis(100)).await;
    })
}

fn operation_async() -> Operation<i32> {
    Operation::spawn(async {
        resume_background().await;
        timespan(Duration::from_millis(150)).await;
        51
    })
}

#[test]
fn test_compose_and_return() {
    init_tracing();
    let start = Instant::now();

    let task = Operation::spawn(async {
        action_async().await;
        let value = operation_async().await;
        value + 10
    });

    assert_eq!(*task.get().expect("composition completes"), 61);
    let elapsed = start.elapsed();
    // The two delays run back to back
    assert!(elapsed >= Duration::from_millis(240), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "elapsed {elapsed:?}");
}

#[test]
fn test_handle_is_a_plain_future() {
    let task = Operation::spawn(async {
        resume_background().await;
        timespan(Duration::from_millis(30)).await;
        7
    });

    // The handle awaits under any executor, not just inside a procedure
    assert_eq!(futures::executor::block_on(task.clone()), 7);
    assert_eq!(*task.get().expect("still joinable"), 7);
}

// ============================================================================
// Custom executors / thread identities
// ============================================================================

#[test]
fn test_context_switch_thread_identities() {
    set_bg_entry(|work| {
        thread::spawn(work);
    });
    set_job_entry(|work| {
        thread::spawn(work);
    });

    let main_id = thread::current().id();
    let task = Operation::spawn(async move {
        resume_background().await;
        let bg_id = thread::current().id();
        timespan(Duration::from_millis(80)).await;
        let job_id = thread::current().id();
        (bg_id, job_id)
    });

    let (bg_id, job_id) = *task.get().expect("both hops complete");
    assert_ne!(bg_id, main_id);
    assert_ne!(job_id, main_id);
    assert_ne!(bg_id, job_id);
}

// ============================================================================
// Cancellation
// ============================================================================

fn counting_loop(counter: Arc<AtomicUsize>, delay: Duration) -> Action {
    Action::spawn(async move {
        resume_background().await;
        let token = get_cancellation_token().await;

        for _ in 1..=10 {
            counter.fetch_add(1, Ordering::AcqRel);
            if token.is_canceled() {
                return;
            }
            timespan(delay).await;
        }
    })
}

/// Spin until the loop has reached at least `n` iterations
fn wait_for_count(counter: &AtomicUsize, n: usize) {
    let start = Instant::now();
    while counter.load(Ordering::Acquire) < n {
        assert!(start.elapsed() < Duration::from_secs(10), "loop stalled");
        thread::sleep(Duration::from_millis(2));
    }
}

fn wrapped_loop(counter: Arc<AtomicUsize>, delay: Duration, propagate: bool) -> Action {
    Action::spawn(async move {
        let token = get_cancellation_token().await;
        token.enable_propagation(propagate);
        counting_loop(counter, delay).await;
    })
}

#[test]
fn test_cancel_propagates_into_pending_delay() {
    init_tracing();
    let counter = Arc::new(AtomicUsize::new(0));
    let delay = Duration::from_millis(150);
    let task = wrapped_loop(counter.clone(), delay, true);

    // Cancel solidly in the middle of the second delay
    wait_for_count(&counter, 2);
    thread::sleep(delay / 2);
    let cancel_at = Instant::now();
    task.cancel();
    task.get().expect("cancelled loop still completes");

    // The pending delay was aborted, not waited out
    assert!(cancel_at.elapsed() < Duration::from_millis(60));
    assert!(counter.load(Ordering::Acquire) < 10);
}

#[test]
fn test_propagation_firewall_runs_to_completion() {
    let counter = Arc::new(AtomicUsize::new(0));
    let task = wrapped_loop(counter.clone(), Duration::from_millis(40), false);

    wait_for_count(&counter, 2);
    task.cancel();
    task.get().expect("firewalled loop completes");

    // The wrapper was marked cancelled, but the inner loop never saw it
    assert_eq!(counter.load(Ordering::Acquire), 10);
}

#[test]
fn test_cancel_at_root_is_seen_at_next_check() {
    // Cancelling the looping task itself: the in-flight delay finishes
    // naturally, then the cooperative check exits the loop
    let task = Action::spawn(async {
        let token = get_cancellation_token().await;
        loop {
            if token.is_canceled() {
                return;
            }
            timespan(Duration::from_millis(40)).await;
        }
    });

    thread::sleep(Duration::from_millis(60));
    let cancel_at = Instant::now();
    task.cancel();
    task.get().expect("loop exits");
    assert!(cancel_at.elapsed() < Duration::from_millis(500));
}

// ============================================================================
// Progress
// ============================================================================

#[test]
fn test_progress_stream() {
    let task = OperationWithProgress::<f64, i32>::spawn(async {
        resume_background().await;
        let controller = get_progress_controller::<i32>().await;

        for i in 0..20 {
            controller.report(i);
            timespan(Duration::from_millis(10)).await;
        }
        controller.report_final(100);
        50.0
    });

    let samples = Arc::new(Mutex::new(Vec::new()));
    let consumer = Action::spawn({
        let samples = samples.clone();
        let mut reporter = task.get_progress_reporter();
        async move {
            while let Some(sample) = reporter.next().await {
                samples.lock().push(sample);
            }
        }
    });

    consumer.get().expect("consumer drains the stream");
    assert_eq!(*task.get().expect("terminal value"), 50.0);

    let samples = samples.lock();
    // The finish marker is always observed, intermediate samples may be
    // overwritten, and nothing arrives after the finish
    assert_eq!(*samples.last().expect("at least the final sample"), 100);
    assert!(samples.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(!task.get_progress_reporter().has_next());
}
