//! Request routing: path+method matching, path-parameter extraction,
//! middleware, and handler dispatch.
//!
//! Matching is two-phase. The method token is normalised first; an
//! unrecognised verb returns 405 before any route is searched. A recognised
//! verb then walks the route table for the first structural pattern match; a
//! method mismatch on that route and a complete miss both return 404, so a
//! probe cannot distinguish "wrong method" from "no such route".
//!
//! Registration rejects nothing. Duplicate patterns are flagged by a separate
//! advisory [`Router::validate`] pass, never at registration time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::dispatch::validator::ValidationError;

/// Recognised HTTP verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// Read operation.
    Get,
    /// Create/submit operation.
    Post,
    /// Replace operation.
    Put,
    /// Delete operation.
    Delete,
    /// Partial update operation.
    Patch,
    /// Metadata probe.
    Head,
    /// Capability probe.
    Options,
}

impl HttpMethod {
    /// Normalises a method token. Returns `None` for unrecognised verbs.
    #[must_use]
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "PATCH" => Some(Self::Patch),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }

    /// Returns the canonical token for this verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised by a route handler.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Failure description.
    pub message: String,
}

impl HandlerError {
    /// Creates a new handler failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A route handler: receives the matched path, the method, and the request
/// data (with path parameters already bound in).
pub type Handler =
    dyn Fn(&str, HttpMethod, &Map<String, Value>) -> Result<Value, HandlerError> + Send + Sync;

/// Middleware runs before the handler, in registration order. An error aborts
/// the request with a 500.
pub type Middleware =
    dyn Fn(&str, HttpMethod, &Map<String, Value>) -> Result<(), HandlerError> + Send + Sync;

/// A registered route.
#[derive(Clone)]
pub struct Route {
    /// Pattern with `{name}` placeholders, e.g. `/items/{id}/edit`.
    pub pattern: String,
    /// Accepted verbs.
    pub methods: Vec<HttpMethod>,
    /// Category for introspection grouping.
    pub category: String,
    /// The handler.
    pub handler: Arc<Handler>,
    /// Module that registered the route.
    pub owning_module: String,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.pattern)
            .field("methods", &self.methods)
            .field("category", &self.category)
            .field("owning_module", &self.owning_module)
            .finish_non_exhaustive()
    }
}

/// The JSON response shape returned for every request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Present and `true` on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    /// Stable machine-readable code (validation failures).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    /// Failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    /// 200 with a payload.
    #[must_use]
    pub const fn ok(data: Value) -> Self {
        Self {
            status: 200,
            data: Some(data),
            error: None,
            code: None,
            message: None,
        }
    }

    /// Failure with a status and message.
    #[must_use]
    pub fn fail(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            data: None,
            error: Some(true),
            code: None,
            message: Some(message.into()),
        }
    }

    /// 400 carrying a validation error's stable code.
    #[must_use]
    pub fn validation_failure(err: &ValidationError) -> Self {
        Self {
            status: 400,
            data: None,
            error: Some(true),
            code: Some(err.code.as_str()),
            message: Some(err.message.clone()),
        }
    }
}

/// A routing fault, mapped directly onto a response status.
#[derive(Debug, Clone, Error)]
pub enum RouteFault {
    /// The method token is not a recognised HTTP verb.
    #[error("unrecognised HTTP method '{0}'")]
    UnknownMethod(String),
    /// No route matched path+method. Method mismatch and structural miss are
    /// deliberately indistinguishable.
    #[error("no route found for {method} {path}")]
    NoMatch {
        /// Requested path.
        path: String,
        /// Requested (valid) verb.
        method: HttpMethod,
    },
}

impl RouteFault {
    /// Converts the fault into a wire response.
    #[must_use]
    pub fn into_response(self) -> Response {
        match self {
            Self::UnknownMethod(token) => {
                Response::fail(405, format!("unrecognised HTTP method '{token}'"))
            }
            Self::NoMatch { .. } => Response::fail(404, "no route found"),
        }
    }
}

/// A successful route match: the route index plus extracted path parameters.
#[derive(Debug)]
pub struct ResolvedRoute {
    route_index: usize,
    /// Parsed verb.
    pub method: HttpMethod,
    /// Matched concrete path.
    pub path: String,
    /// `{name}` bindings extracted from the path, as strings.
    pub params: Vec<(String, String)>,
}

impl ResolvedRoute {
    /// Returns the pattern of the matched route within `router`.
    #[must_use]
    pub fn pattern<'r>(&self, router: &'r Router) -> &'r str {
        &router.routes[self.route_index].pattern
    }
}

/// A matched route's executable surface, detached from the route table.
///
/// Produced by [`Router::plan`] under the router lock; run after the lock is
/// released.
pub struct DispatchPlan {
    handler: Arc<Handler>,
    middleware: Vec<Arc<Middleware>>,
}

impl DispatchPlan {
    /// Binds path parameters into `data`, runs middleware in registration
    /// order, then the handler. Middleware and handler failures are 500s.
    #[must_use]
    pub fn run(&self, resolved: &ResolvedRoute, mut data: Map<String, Value>) -> Response {
        for (name, value) in &resolved.params {
            data.insert(name.clone(), Value::String(value.clone()));
        }

        for middleware in &self.middleware {
            if let Err(err) = middleware(&resolved.path, resolved.method, &data) {
                tracing::warn!(path = %resolved.path, error = %err, "Middleware aborted request");
                return Response::fail(500, format!("middleware error: {err}"));
            }
        }

        match (self.handler)(&resolved.path, resolved.method, &data) {
            Ok(value) => Response::ok(value),
            Err(err) => {
                tracing::warn!(path = %resolved.path, error = %err, "Handler failed");
                Response::fail(500, err.message)
            }
        }
    }
}

/// The route table and dispatch statistics.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    middleware: Vec<Arc<Middleware>>,
    requests_routed: AtomicU64,
    requests_failed: AtomicU64,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .field("middleware", &self.middleware.len())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route. Rejects nothing; duplicate patterns are reported by
    /// [`Self::validate`], not here.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        handler: Arc<Handler>,
        methods: Vec<HttpMethod>,
        category: impl Into<String>,
        module_name: impl Into<String>,
    ) {
        let route = Route {
            pattern: pattern.into(),
            methods,
            category: category.into(),
            handler,
            owning_module: module_name.into(),
        };
        tracing::debug!(pattern = %route.pattern, module = %route.owning_module, "Route registered");
        self.routes.push(route);
    }

    /// Adds middleware, run in registration order before every handler.
    pub fn add_middleware(&mut self, middleware: Arc<Middleware>) {
        self.middleware.push(middleware);
    }

    /// Removes every route owned by `module`, returning how many were removed.
    pub fn remove_module(&mut self, module: &str) -> usize {
        let before = self.routes.len();
        self.routes.retain(|route| route.owning_module != module);
        before - self.routes.len()
    }

    /// Resolves a path and method token against the route table.
    ///
    /// # Errors
    ///
    /// [`RouteFault::UnknownMethod`] when the token is not a recognised verb
    /// (checked before any route lookup); [`RouteFault::NoMatch`] when no
    /// pattern matches structurally or the first structural match excludes
    /// the requested verb.
    pub fn resolve(&self, path: &str, method_token: &str) -> Result<ResolvedRoute, RouteFault> {
        let Some(method) = HttpMethod::parse(method_token) else {
            return Err(RouteFault::UnknownMethod(method_token.to_string()));
        };

        for (index, route) in self.routes.iter().enumerate() {
            let Some(params) = match_pattern(&route.pattern, path) else {
                continue;
            };

            // First structural match decides; a method mismatch here reports
            // the same 404 as a complete miss so route existence never leaks.
            if !route.methods.contains(&method) {
                break;
            }

            return Ok(ResolvedRoute {
                route_index: index,
                method,
                path: path.to_string(),
                params,
            });
        }

        Err(RouteFault::NoMatch {
            path: path.to_string(),
            method,
        })
    }

    /// Clones the matched route's executable surface out of the table.
    ///
    /// The plan holds its own `Arc`s, so the caller can release the router
    /// lock before running it — handlers are then free to re-enter the
    /// router, including for registration.
    #[must_use]
    pub fn plan(&self, resolved: &ResolvedRoute) -> DispatchPlan {
        DispatchPlan {
            handler: Arc::clone(&self.routes[resolved.route_index].handler),
            middleware: self.middleware.clone(),
        }
    }

    /// Folds a finished request into the routing counters.
    pub fn record_outcome(&self, response: &Response) {
        if response.status == 200 {
            self.requests_routed.fetch_add(1, Ordering::Relaxed);
        } else if response.status == 500 {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Runs middleware and the matched handler, maintaining statistics.
    #[must_use]
    pub fn dispatch(&self, resolved: &ResolvedRoute, data: Map<String, Value>) -> Response {
        let response = self.plan(resolved).run(resolved, data);
        self.record_outcome(&response);
        response
    }

    /// Resolves and dispatches in one step, without validation.
    ///
    /// Path parameters are bound into `data` as strings before the handler
    /// runs. Callers wanting parameter validation go through
    /// [`crate::dispatch::Dispatcher::handle`] instead.
    #[must_use]
    pub fn route(&self, path: &str, method_token: &str, data: Map<String, Value>) -> Response {
        match self.resolve(path, method_token) {
            Ok(resolved) => self.dispatch(&resolved, data),
            Err(fault) => fault.into_response(),
        }
    }

    /// Read-only view of the route table.
    #[must_use]
    pub fn get_routes(&self) -> &[Route] {
        &self.routes
    }

    /// Routes whose category matches (case-insensitive).
    #[must_use]
    pub fn get_routes_by_category(&self, category: &str) -> Vec<&Route> {
        let category = category.to_lowercase();
        self.routes
            .iter()
            .filter(|route| route.category.to_lowercase() == category)
            .collect()
    }

    /// Advisory validation pass. Reports duplicate literal patterns as
    /// human-readable issues without blocking operation.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut seen: Vec<&str> = Vec::new();

        for route in &self.routes {
            if seen.contains(&route.pattern.as_str()) {
                issues.push(format!(
                    "Duplicate route pattern '{}' (module '{}')",
                    route.pattern, route.owning_module
                ));
            } else {
                seen.push(&route.pattern);
            }
        }

        issues
    }

    /// Number of successfully routed requests.
    #[must_use]
    pub fn requests_routed(&self) -> u64 {
        self.requests_routed.load(Ordering::Relaxed)
    }

    /// Number of requests that failed in middleware or a handler.
    #[must_use]
    pub fn requests_failed(&self) -> u64 {
        self.requests_failed.load(Ordering::Relaxed)
    }
}

/// Structural pattern match. A `{name}` segment matches any single path
/// segment; literal segments must match exactly. Returns the bindings on
/// success.
fn match_pattern(pattern: &str, path: &str) -> Option<Vec<(String, String)>> {
    let pattern_segments: Vec<&str> = pattern.trim_matches('/').split('/').collect();
    let path_segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    if pattern_segments.len() != path_segments.len() {
        return None;
    }

    let mut params = Vec::new();
    for (pat, seg) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pat.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            if seg.is_empty() {
                return None;
            }
            params.push((name.to_string(), (*seg).to_string()));
        } else if pat != seg {
            return None;
        }
    }

    Some(params)
}
