//! The dispatch substrate: router, validator, registry, task queue, module
//! loader, and the cross-cutting error handler.
//!
//! Everything hangs off one [`Dispatcher`] context object, constructed once
//! at process start and passed by reference — there are no module-level
//! singletons, so tests get fresh instances for free.

pub mod errors;
pub mod loader;
pub mod queue;
pub mod registry;
pub mod router;
pub mod validator;

use std::sync::{Arc, RwLock};

use serde_json::{Map, Value};

use errors::{ErrorCategory, ErrorHandler, ErrorRecord, Severity};
use queue::TaskQueue;
use registry::CapabilityRegistry;
use router::{Response, Router};
use validator::ParameterValidator;

/// The shared dispatch context.
///
/// Network threads call [`Dispatcher::handle`]; capability providers register
/// through the component accessors; the drain loop owns the queue's consumer
/// side. Registration surfaces (`router`, `registry`, `validator`) sit behind
/// `RwLock`s because modules register at startup and on reload while requests
/// are in flight; the hot path takes read locks only, and no lock is held
/// while a handler runs, so handlers may re-enter any dispatcher surface.
pub struct Dispatcher {
    router: RwLock<Router>,
    registry: RwLock<CapabilityRegistry>,
    validator: RwLock<ParameterValidator>,
    queue: Arc<TaskQueue>,
    errors: Arc<ErrorHandler>,
}

impl Dispatcher {
    /// Creates a dispatch context with a bounded error history.
    #[must_use]
    pub fn new(error_capacity: usize) -> Self {
        let queue = Arc::new(TaskQueue::new());
        let errors = Arc::new(ErrorHandler::new(error_capacity));

        // Drain-time task failures land in the shared error log.
        let sink = Arc::clone(&errors);
        queue.set_observer(Arc::new(move |task, err| {
            sink.report(ErrorRecord::new(
                "queue",
                task.handler_name.clone(),
                ErrorCategory::Task,
                Severity::Error,
                err.to_string(),
            ));
        }));

        Self {
            router: RwLock::new(Router::new()),
            registry: RwLock::new(CapabilityRegistry::new()),
            validator: RwLock::new(ParameterValidator::new()),
            queue,
            errors,
        }
    }

    /// The shared task queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The shared error handler.
    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    /// Runs `f` with the router write-locked (registration).
    pub fn with_router_mut<R>(&self, f: impl FnOnce(&mut Router) -> R) -> R {
        f(&mut self
            .router
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Runs `f` with the router read-locked (introspection, routing).
    pub fn with_router<R>(&self, f: impl FnOnce(&Router) -> R) -> R {
        f(&self
            .router
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Runs `f` with the registry write-locked (registration).
    pub fn with_registry_mut<R>(&self, f: impl FnOnce(&mut CapabilityRegistry) -> R) -> R {
        f(&mut self
            .registry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Runs `f` with the registry read-locked.
    pub fn with_registry<R>(&self, f: impl FnOnce(&CapabilityRegistry) -> R) -> R {
        f(&self
            .registry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Runs `f` with the validator write-locked (rule registration).
    pub fn with_validator_mut<R>(&self, f: impl FnOnce(&mut ParameterValidator) -> R) -> R {
        f(&mut self
            .validator
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner))
    }

    /// Removes everything a module registered: routes, capabilities, and its
    /// queue handlers. Used for load rollback and reload.
    pub fn unregister_module(&self, module: &str) {
        let capability_names: Vec<String> = self.with_registry(|r| {
            r.list(None)
                .iter()
                .filter(|c| c.owning_module == module)
                .map(|c| c.name.clone())
                .collect()
        });

        for name in &capability_names {
            self.queue.unregister_handler(name);
        }
        let removed_caps = self.with_registry_mut(|r| r.remove_module(module));
        let removed_routes = self.with_router_mut(|r| r.remove_module(module));

        if removed_caps > 0 || removed_routes > 0 {
            tracing::debug!(
                module,
                capabilities = removed_caps,
                routes = removed_routes,
                "Module unregistered"
            );
        }
    }

    /// Full request pipeline: resolve the route, validate and normalise the
    /// payload, then run middleware and the handler.
    ///
    /// Routing faults become 404/405, validation faults 400 with a stable
    /// code, handler and middleware faults 500 — all recorded in the shared
    /// error log.
    #[must_use]
    pub fn handle(&self, path: &str, method_token: &str, data: Map<String, Value>) -> Response {
        // Resolve under the router lock, then release it before the handler
        // runs: handlers re-enter the dispatcher (introspection, even
        // registration), and std locks are not reentrant.
        let planned = {
            let router = self
                .router
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            router.resolve(path, method_token).map(|resolved| {
                let pattern = resolved.pattern(&router).to_string();
                let plan = router.plan(&resolved);
                (resolved, pattern, plan)
            })
        };

        let (resolved, pattern, plan) = match planned {
            Ok(planned) => planned,
            Err(fault) => {
                self.errors.report(ErrorRecord::new(
                    "router",
                    path,
                    ErrorCategory::Routing,
                    Severity::Warning,
                    fault.to_string(),
                ));
                return fault.into_response();
            }
        };

        let validated = {
            let validator = self
                .validator
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            validator.validate(&pattern, data)
        };

        match validated {
            Ok(data) => {
                let response = plan.run(&resolved, data);
                self.with_router(|router| router.record_outcome(&response));
                response
            }
            Err(err) => {
                self.errors.report(ErrorRecord::new(
                    "validator",
                    pattern,
                    ErrorCategory::Validation,
                    Severity::Warning,
                    err.message.clone(),
                ));
                Response::validation_failure(&err)
            }
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(ErrorHandler::DEFAULT_CAPACITY)
    }
}
