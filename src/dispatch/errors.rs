//! Cross-cutting error aggregation and recovery.
//!
//! Every component reports into one [`ErrorHandler`]: a categorised,
//! severity-tagged, capped-history log (oldest evicted first) with aggregate
//! counts queryable by category or module, plus recovery callbacks keyed by
//! `(module, function, category)` that fire synchronously when a matching
//! record arrives.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which part of the system produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Router faults: no-match, method-mismatch, malformed method.
    Routing,
    /// Parameter validation failures.
    Validation,
    /// Task execution failures on the drain loop.
    Task,
    /// Module discovery/import/structure/dependency failures.
    ModuleLoad,
    /// Outbound client failures.
    Client,
}

impl ErrorCategory {
    /// Returns the category's display name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Routing => "routing",
            Self::Validation => "validation",
            Self::Task => "task",
            Self::ModuleLoad => "module_load",
            Self::Client => "client",
        }
    }
}

/// How serious a recorded error is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Advisory; the operation completed.
    Warning,
    /// The operation failed but the system is unaffected.
    Error,
    /// The system is degraded beyond a single operation.
    Critical,
}

/// One recorded error. Appended, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Module the error is attributed to.
    pub module: String,
    /// Function or capability involved.
    pub function: String,
    /// Originating component.
    pub category: ErrorCategory,
    /// Severity tag.
    pub severity: Severity,
    /// Description.
    pub message: String,
    /// When the error was recorded.
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    /// Creates a record timestamped now.
    #[must_use]
    pub fn new(
        module: impl Into<String>,
        function: impl Into<String>,
        category: ErrorCategory,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            function: function.into(),
            category,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Recovery callback, fired synchronously for matching records. Used to
/// restore capability availability without manual intervention.
pub type RecoveryFn = dyn Fn(&ErrorRecord) + Send + Sync;

struct RecoveryStrategy {
    module: String,
    function: String,
    category: ErrorCategory,
    callback: Arc<RecoveryFn>,
}

struct HandlerInner {
    history: VecDeque<ErrorRecord>,
    capacity: usize,
    recoveries: Vec<RecoveryStrategy>,
}

/// Aggregating error sink shared by all components.
pub struct ErrorHandler {
    inner: Mutex<HandlerInner>,
}

impl ErrorHandler {
    /// Default history capacity.
    pub const DEFAULT_CAPACITY: usize = 500;

    /// Creates a handler with a bounded history.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HandlerInner {
                history: VecDeque::with_capacity(capacity.min(Self::DEFAULT_CAPACITY)),
                capacity: capacity.max(1),
                recoveries: Vec::new(),
            }),
        }
    }

    /// Records an error, evicting the oldest entry when full, then fires any
    /// matching recovery callbacks synchronously.
    pub fn report(&self, record: ErrorRecord) {
        tracing::debug!(
            module = %record.module,
            function = %record.function,
            category = record.category.name(),
            severity = ?record.severity,
            message = %record.message,
            "Error recorded"
        );

        let callbacks: Vec<Arc<RecoveryFn>> = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            if inner.history.len() == inner.capacity {
                inner.history.pop_front();
            }
            inner.history.push_back(record.clone());

            inner
                .recoveries
                .iter()
                .filter(|s| {
                    s.module == record.module
                        && s.function == record.function
                        && s.category == record.category
                })
                .map(|s| Arc::clone(&s.callback))
                .collect()
        };

        // Fired outside the lock so a recovery callback may report again.
        for callback in callbacks {
            callback(&record);
        }
    }

    /// Registers a recovery callback for `(module, function, category)`.
    pub fn register_recovery(
        &self,
        module: impl Into<String>,
        function: impl Into<String>,
        category: ErrorCategory,
        callback: Arc<RecoveryFn>,
    ) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .recoveries
            .push(RecoveryStrategy {
                module: module.into(),
                function: function.into(),
                category,
                callback,
            });
    }

    /// Number of recorded errors in `category`.
    #[must_use]
    pub fn count_by_category(&self, category: ErrorCategory) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .iter()
            .filter(|r| r.category == category)
            .count()
    }

    /// Number of recorded errors attributed to `module`.
    #[must_use]
    pub fn count_by_module(&self, module: &str) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .iter()
            .filter(|r| r.module == module)
            .count()
    }

    /// Total recorded errors currently held (bounded by capacity).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .len()
    }

    /// True when no errors are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ErrorRecord> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Clears the history. Explicit reset only; nothing else removes records.
    pub fn reset(&self) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .history
            .clear();
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
