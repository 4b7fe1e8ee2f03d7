//! Integration tests for the task queue and the drain loop.
//!
//! These tests exercise the producer/consumer contract end to end: network
//! threads enqueue, a single drain loop on a dedicated thread executes, and
//! failures surface in the shared error log rather than panicking the loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use cad_bridge::dispatch::errors::ErrorCategory;
use cad_bridge::dispatch::queue::{DrainLoop, Priority, TaskError, TaskQueue};
use cad_bridge::dispatch::Dispatcher;

// =============================================================================
// Helpers
// =============================================================================

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// =============================================================================
// Drain loop thread contract
// =============================================================================

#[test]
fn test_drain_loop_executes_on_its_own_thread() {
    let queue = Arc::new(TaskQueue::new());
    let observed_thread = Arc::new(Mutex::new(None));

    let inner = Arc::clone(&observed_thread);
    queue.register_handler(
        "whoami",
        Arc::new(move |_args| {
            *inner.lock().unwrap() = thread::current().name().map(String::from);
            Ok(Value::Null)
        }),
    );

    let drain = DrainLoop::new(Arc::clone(&queue), Duration::from_millis(10));
    let stop = drain.stop_handle();
    let handle = drain.spawn();

    queue.enqueue("whoami", vec![], Priority::Normal);
    assert!(wait_until(Duration::from_secs(2), || {
        queue.stats().tasks_processed == 1
    }));

    stop.stop();
    handle.join().unwrap();

    assert_eq!(
        observed_thread.lock().unwrap().as_deref(),
        Some("host-drain")
    );
}

#[test]
fn test_tasks_from_many_producers_run_serially() {
    let queue = Arc::new(TaskQueue::new());
    let in_flight = Arc::new(AtomicUsize::new(0));
    let overlap_seen = Arc::new(AtomicUsize::new(0));

    let flight = Arc::clone(&in_flight);
    let overlap = Arc::clone(&overlap_seen);
    queue.register_handler(
        "serial",
        Arc::new(move |_args| {
            if flight.fetch_add(1, Ordering::SeqCst) > 0 {
                overlap.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );

    let drain = DrainLoop::new(Arc::clone(&queue), Duration::from_millis(5));
    let stop = drain.stop_handle();
    let handle = drain.spawn();

    let mut producers = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        producers.push(thread::spawn(move || {
            for _ in 0..10 {
                queue.enqueue("serial", vec![], Priority::Normal);
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        queue.stats().tasks_processed == 40
    }));
    stop.stop();
    handle.join().unwrap();

    assert_eq!(overlap_seen.load(Ordering::SeqCst), 0);
}

#[test]
fn test_stop_clears_pending_tasks() {
    let queue = Arc::new(TaskQueue::new());
    queue.register_handler("sentinel", Arc::new(|_args| Ok(Value::Null)));

    // A long poll interval so tasks enqueued after the first pass sit pending
    // until the loop stops and clears them.
    let drain = DrainLoop::new(Arc::clone(&queue), Duration::from_millis(500));
    let stop = drain.stop_handle();
    let handle = drain.spawn();

    // Once the sentinel has run, the loop is inside its long sleep.
    queue.enqueue("sentinel", vec![], Priority::Normal);
    assert!(wait_until(Duration::from_secs(2), || {
        queue.stats().tasks_processed == 1
    }));
    for _ in 0..3 {
        queue.enqueue("never_runs", vec![], Priority::Low);
    }

    stop.stop();
    handle.join().unwrap();
    assert_eq!(queue.stats().pending, 0);
    // Cleared, not drained: a drain of unregistered handlers would have
    // counted failures.
    assert_eq!(queue.stats().tasks_failed, 0);
}

// =============================================================================
// Ordering and failure isolation under load
// =============================================================================

#[test]
fn test_priority_order_holds_within_a_pass() {
    let queue = TaskQueue::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    let inner = Arc::clone(&log);
    queue.register_handler(
        "record",
        Arc::new(move |args| {
            inner.lock().unwrap().push(args[0].clone());
            Ok(Value::Null)
        }),
    );

    queue.enqueue("record", vec![json!("n1")], Priority::Normal);
    queue.enqueue("record", vec![json!("l1")], Priority::Low);
    queue.enqueue("record", vec![json!("c1")], Priority::Critical);
    queue.enqueue("record", vec![json!("n2")], Priority::Normal);
    queue.enqueue("record", vec![json!("h1")], Priority::High);
    queue.enqueue("record", vec![json!("c2")], Priority::Critical);

    assert_eq!(queue.drain(), 6);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            json!("c1"),
            json!("c2"),
            json!("h1"),
            json!("n1"),
            json!("n2"),
            json!("l1")
        ]
    );
}

#[test]
fn test_failed_task_does_not_stop_the_pass() {
    let queue = TaskQueue::new();
    let completed = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&completed);
    queue.register_handler(
        "flaky",
        Arc::new(move |args| {
            if args[0] == json!("boom") {
                return Err(TaskError::execution("flaky", "induced failure"));
            }
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }),
    );

    queue.enqueue("flaky", vec![json!("ok")], Priority::Normal);
    queue.enqueue("flaky", vec![json!("boom")], Priority::Normal);
    queue.enqueue("flaky", vec![json!("ok")], Priority::Normal);

    assert_eq!(queue.drain(), 3);
    assert_eq!(completed.load(Ordering::SeqCst), 2);
    assert_eq!(queue.stats().tasks_failed, 1);
    assert_eq!(queue.stats().tasks_processed, 2);
}

// =============================================================================
// Dispatcher wiring
// =============================================================================

#[test]
fn test_task_failures_reach_the_shared_error_log() {
    let dispatcher = Dispatcher::default();

    dispatcher.queue().register_handler(
        "failing_op",
        Arc::new(|_args| Err(TaskError::execution("failing_op", "host rejected call"))),
    );

    dispatcher
        .queue()
        .enqueue("failing_op", vec![], Priority::Normal);
    dispatcher.queue().enqueue("no_such_op", vec![], Priority::Low);
    dispatcher.queue().drain();

    assert_eq!(
        dispatcher.errors().count_by_category(ErrorCategory::Task),
        2
    );
    let history = dispatcher.errors().history();
    assert!(history
        .iter()
        .any(|record| record.message.contains("host rejected call")));
}

#[test]
fn test_closed_queue_refuses_work_but_drains_backlog() {
    let dispatcher = Dispatcher::default();
    dispatcher
        .queue()
        .register_handler("op", Arc::new(|_args| Ok(Value::Null)));

    assert!(dispatcher.queue().enqueue("op", vec![], Priority::Normal));
    dispatcher.queue().close();
    assert!(!dispatcher.queue().enqueue("op", vec![], Priority::Normal));

    // The backlog accepted before close still runs.
    assert_eq!(dispatcher.queue().drain(), 1);
    assert_eq!(dispatcher.queue().stats().tasks_processed, 1);
}
