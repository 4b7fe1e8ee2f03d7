//! Priority task queue and the single-consumer drain loop.
//!
//! The queue is the only mutable structure shared between the network side
//! and the host thread. Producers (request-handling threads) only ever push;
//! exactly one drain loop, pinned to the host's mandatory execution thread,
//! pops and executes. Host-API calls happen nowhere else.
//!
//! Ordering is `(priority, sequence)`: CRITICAL before HIGH before NORMAL
//! before LOW, ties broken by enqueue order. A drain pass processes the
//! entire snapshot taken at its start; tasks enqueued during the pass wait
//! for the next one. A re-entrancy guard makes a nested `drain()` a no-op,
//! since the host API is not reentrant-safe.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Task priority, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Jumps everything; host-session recovery and shutdown work.
    Critical,
    /// Interactive operations a caller is polling for.
    High,
    /// Default.
    Normal,
    /// Background housekeeping.
    Low,
}

/// Failure raised by a task handler.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The task's handler name did not resolve at drain time.
    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),
    /// The handler ran and failed.
    #[error("task '{handler}' failed: {message}")]
    Execution {
        /// Handler name.
        handler: String,
        /// Failure description.
        message: String,
    },
}

impl TaskError {
    /// Creates an execution failure for `handler`.
    #[must_use]
    pub fn execution(handler: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            handler: handler.into(),
            message: message.into(),
        }
    }
}

/// A task handler, executed only on the drain-loop thread.
pub type TaskHandler = dyn Fn(&[Value]) -> Result<Value, TaskError> + Send + Sync;

/// A queued unit of host-API work. Identity is structural; ordering key is
/// `(priority, sequence)`.
#[derive(Debug, Clone)]
pub struct Task {
    /// Scheduling priority.
    pub priority: Priority,
    /// Monotonic insertion order, assigned at enqueue.
    pub sequence: u64,
    /// Name resolved against the handler table at drain time, not enqueue
    /// time. A task may be enqueued before its handler is registered.
    pub handler_name: String,
    /// Ordered arguments passed to the handler.
    pub args: Vec<Value>,
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Task {}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Task {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: greatest pops first, so higher priority (lower enum rank)
        // and earlier sequence compare as greater.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Queue counters, readable from any thread.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    /// Tasks executed successfully across all drain passes.
    pub tasks_processed: u64,
    /// Tasks that failed (execution error or unresolved handler).
    pub tasks_failed: u64,
    /// Tasks currently waiting.
    pub pending: usize,
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Task>,
    next_sequence: u64,
}

/// Observer invoked on the drain thread for each task failure. Used by the
/// dispatcher to feed task failures into the error handler.
pub type TaskObserver = dyn Fn(&Task, &TaskError) + Send + Sync;

/// Thread-safe priority queue with a single-consumer drain contract.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    handlers: RwLock<HashMap<String, Arc<TaskHandler>>>,
    observer: RwLock<Option<Arc<TaskObserver>>>,
    processing: AtomicBool,
    closed: AtomicBool,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            handlers: RwLock::new(HashMap::new()),
            observer: RwLock::new(None),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
        }
    }

    /// Registers (or replaces) the handler for `name`.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<TaskHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), handler);
    }

    /// Removes the handler for `name`, if registered.
    pub fn unregister_handler(&self, name: &str) {
        self.handlers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }

    /// Installs the per-task failure observer.
    pub fn set_observer(&self, observer: Arc<TaskObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(observer);
    }

    /// Enqueues a task. Fire-and-forget: resolution of `handler_name` is
    /// deferred to drain time, so enqueuing against an unregistered name
    /// succeeds here and is counted as a failure when drained.
    ///
    /// Returns `false` only when the queue has been closed for shutdown.
    pub fn enqueue(&self, handler_name: impl Into<String>, args: Vec<Value>, priority: Priority) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(Task {
            priority,
            sequence,
            handler_name: handler_name.into(),
            args,
        });
        true
    }

    /// Drains the queue snapshot, executing each task serially.
    ///
    /// Must only be called from the host's mandatory execution thread. If a
    /// previous drain is still in progress the call is a no-op and returns 0
    /// immediately, preventing re-entrant host-API execution. Each task
    /// failure is isolated: it is counted and reported, and the remaining
    /// tasks in the pass still run.
    ///
    /// Returns the number of tasks processed (including failed ones).
    pub fn drain(&self) -> usize {
        if self.processing.swap(true, Ordering::AcqRel) {
            return 0;
        }

        // Snapshot: tasks enqueued while this pass runs wait for the next one.
        let snapshot = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            std::mem::take(&mut inner.heap).into_sorted_vec()
        };

        // into_sorted_vec is ascending; the greatest (highest priority,
        // earliest sequence) must run first.
        let mut count = 0;
        for task in snapshot.into_iter().rev() {
            count += 1;
            match self.execute(&task) {
                Ok(_) => {
                    self.tasks_processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.tasks_failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(handler = %task.handler_name, error = %err, "Task failed");
                    let observer = self
                        .observer
                        .read()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .clone();
                    if let Some(observer) = observer {
                        observer(&task, &err);
                    }
                }
            }
        }

        self.processing.store(false, Ordering::Release);
        count
    }

    fn execute(&self, task: &Task) -> Result<Value, TaskError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&task.handler_name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownHandler(task.handler_name.clone()))?;

        handler(&task.args)
    }

    /// Discards all pending tasks, returning the count discarded. Used during
    /// shutdown; does not affect a task already popped by a running drain.
    pub fn clear(&self) -> usize {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let discarded = inner.heap.len();
        inner.heap.clear();
        discarded
    }

    /// Closes the queue: subsequent enqueues are refused. First step of the
    /// shutdown sequence.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let pending = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .heap
            .len();
        QueueStats {
            tasks_processed: self.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            pending,
        }
    }
}

/// Runs the drain loop on a dedicated OS thread — the one thread permitted to
/// touch the host API.
pub struct DrainLoop {
    queue: Arc<TaskQueue>,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
}

impl DrainLoop {
    /// Creates a drain loop over `queue`, polling at `poll_interval`.
    #[must_use]
    pub fn new(queue: Arc<TaskQueue>, poll_interval: Duration) -> Self {
        Self {
            queue,
            poll_interval,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle that stops the loop after its current pass.
    #[must_use]
    pub fn stop_handle(&self) -> DrainStopHandle {
        DrainStopHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    /// Spawns the loop on a dedicated thread and returns its join handle.
    ///
    /// The spawned thread is the host execution thread: every host-API call
    /// in the process happens inside its drain passes. On stop it clears the
    /// remaining queue and logs the count discarded.
    #[must_use]
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("host-drain".to_string())
            .spawn(move || self.run())
            .unwrap_or_else(|e| panic!("failed to spawn host drain thread: {e}"))
    }

    fn run(self) {
        tracing::info!(interval_ms = self.poll_interval.as_millis(), "Drain loop started");

        while !self.stop.load(Ordering::Acquire) {
            let processed = self.queue.drain();
            if processed > 0 {
                tracing::debug!(processed, "Drain pass complete");
            }
            thread::sleep(self.poll_interval);
        }

        let discarded = self.queue.clear();
        if discarded > 0 {
            tracing::info!(discarded, "Discarded pending tasks at shutdown");
        }
        tracing::info!("Drain loop stopped");
    }
}

/// Signals a running [`DrainLoop`] to stop after its current pass.
#[derive(Clone)]
pub struct DrainStopHandle {
    stop: Arc<AtomicBool>,
}

impl DrainStopHandle {
    /// Requests the loop stop after its current pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recording_handler(log: Arc<StdMutex<Vec<Value>>>) -> Arc<TaskHandler> {
        Arc::new(move |args| {
            log.lock().unwrap().push(args[0].clone());
            Ok(Value::Null)
        })
    }

    #[test]
    fn priority_ordering() {
        let queue = TaskQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        queue.register_handler("record", recording_handler(Arc::clone(&log)));

        queue.enqueue("record", vec![json!("low")], Priority::Low);
        queue.enqueue("record", vec![json!("critical")], Priority::Critical);
        queue.enqueue("record", vec![json!("normal")], Priority::Normal);
        queue.enqueue("record", vec![json!("high")], Priority::High);

        assert_eq!(queue.drain(), 4);
        assert_eq!(
            *log.lock().unwrap(),
            vec![json!("critical"), json!("high"), json!("normal"), json!("low")]
        );
    }

    #[test]
    fn sequence_breaks_ties_fifo() {
        let queue = TaskQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        queue.register_handler("record", recording_handler(Arc::clone(&log)));

        for i in 0..5 {
            queue.enqueue("record", vec![json!(i)], Priority::Normal);
        }

        queue.drain();
        assert_eq!(
            *log.lock().unwrap(),
            (0..5).map(|i| json!(i)).collect::<Vec<_>>()
        );
    }

    #[test]
    fn failure_is_isolated_per_task() {
        let queue = TaskQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner_log = Arc::clone(&log);
        queue.register_handler(
            "maybe_fail",
            Arc::new(move |args| {
                if args[0] == json!("fail") {
                    return Err(TaskError::execution("maybe_fail", "induced"));
                }
                inner_log.lock().unwrap().push(args[0].clone());
                Ok(Value::Null)
            }),
        );

        queue.enqueue("maybe_fail", vec![json!("ok1")], Priority::Normal);
        queue.enqueue("maybe_fail", vec![json!("fail")], Priority::Normal);
        queue.enqueue("maybe_fail", vec![json!("ok2")], Priority::Normal);

        assert_eq!(queue.drain(), 3);
        assert_eq!(*log.lock().unwrap(), vec![json!("ok1"), json!("ok2")]);
        assert!(queue.stats().tasks_failed >= 1);
        assert_eq!(queue.stats().tasks_processed, 2);
    }

    #[test]
    fn unregistered_handler_fails_at_drain_not_enqueue() {
        let queue = TaskQueue::new();

        assert!(queue.enqueue("nobody_home", vec![], Priority::Normal));
        assert_eq!(queue.stats().tasks_failed, 0);

        assert_eq!(queue.drain(), 1);
        assert_eq!(queue.stats().tasks_failed, 1);
    }

    #[test]
    fn late_registration_resolves_at_drain() {
        let queue = TaskQueue::new();
        let log = Arc::new(StdMutex::new(Vec::new()));

        queue.enqueue("late", vec![json!("x")], Priority::Normal);
        queue.register_handler("late", recording_handler(Arc::clone(&log)));

        queue.drain();
        assert_eq!(*log.lock().unwrap(), vec![json!("x")]);
        assert_eq!(queue.stats().tasks_failed, 0);
    }

    #[test]
    fn reentrant_drain_is_noop() {
        let queue = Arc::new(TaskQueue::new());
        let inner = Arc::clone(&queue);
        let nested_result = Arc::new(StdMutex::new(None));
        let nested = Arc::clone(&nested_result);

        queue.register_handler(
            "reenter",
            Arc::new(move |_args| {
                *nested.lock().unwrap() = Some(inner.drain());
                Ok(Value::Null)
            }),
        );

        queue.enqueue("reenter", vec![], Priority::Normal);
        assert_eq!(queue.drain(), 1);
        assert_eq!(*nested_result.lock().unwrap(), Some(0));
    }

    #[test]
    fn drain_processes_snapshot_not_later_enqueues() {
        let queue = Arc::new(TaskQueue::new());
        let inner = Arc::clone(&queue);
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner_log = Arc::clone(&log);

        queue.register_handler(
            "chain",
            Arc::new(move |args| {
                inner_log.lock().unwrap().push(args[0].clone());
                // Enqueue during the pass: must wait for the next one.
                inner.enqueue("chain", vec![json!("second")], Priority::Critical);
                Ok(Value::Null)
            }),
        );

        queue.enqueue("chain", vec![json!("first")], Priority::Normal);
        assert_eq!(queue.drain(), 1);
        assert_eq!(*log.lock().unwrap(), vec![json!("first")]);
        assert_eq!(queue.stats().pending, 1);

        assert_eq!(queue.drain(), 1);
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn clear_discards_and_counts() {
        let queue = TaskQueue::new();
        queue.enqueue("a", vec![], Priority::Normal);
        queue.enqueue("b", vec![], Priority::Low);

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn closed_queue_refuses_enqueue() {
        let queue = TaskQueue::new();
        queue.close();
        assert!(!queue.enqueue("a", vec![], Priority::Normal));
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn observer_sees_failures() {
        let queue = TaskQueue::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let inner = Arc::clone(&seen);
        queue.set_observer(Arc::new(move |task, _err| {
            inner.lock().unwrap().push(task.handler_name.clone());
        }));

        queue.enqueue("ghost", vec![], Priority::Normal);
        queue.drain();
        assert_eq!(*seen.lock().unwrap(), vec!["ghost".to_string()]);
    }

    #[test]
    fn concurrent_producers_single_consumer() {
        let queue = Arc::new(TaskQueue::new());
        let log = Arc::new(StdMutex::new(Vec::new()));
        queue.register_handler("record", recording_handler(Arc::clone(&log)));

        let mut producers = Vec::new();
        for t in 0..4 {
            let queue = Arc::clone(&queue);
            producers.push(thread::spawn(move || {
                for i in 0..25 {
                    queue.enqueue("record", vec![json!(t * 100 + i)], Priority::Normal);
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(queue.drain(), 100);
        assert_eq!(log.lock().unwrap().len(), 100);
        assert_eq!(queue.stats().tasks_processed, 100);
    }
}
