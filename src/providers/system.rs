//! The `system` provider: dispatcher introspection capabilities.
//!
//! Registers read-side routes for health and statistics, and one deferred
//! capability (`host_ping`) that goes through the task queue like any real
//! host-API operation — the route responds immediately with an accepted
//! marker and the ping executes later on the drain thread.

use std::sync::{Arc, RwLock, Weak};

use serde_json::{json, Value};

use crate::dispatch::loader::{CapabilityProvider, LoaderSummary, ModuleManifest, ProviderError};
use crate::dispatch::queue::{Priority, TaskError};
use crate::dispatch::registry::{CapabilitySpec, ParamSpec};
use crate::dispatch::router::{HandlerError, HttpMethod};
use crate::dispatch::validator::{ParamKind, ParameterRule};
use crate::dispatch::Dispatcher;

/// Shared snapshot of the last load summary, refreshed after each
/// `load_all`/`reload` by whoever drives the loader.
pub type HealthSnapshot = Arc<RwLock<Option<LoaderSummary>>>;

/// Built-in introspection provider.
pub struct SystemProvider {
    health: HealthSnapshot,
}

impl SystemProvider {
    /// Creates the provider over a shared health snapshot.
    #[must_use]
    pub fn new(health: HealthSnapshot) -> Self {
        Self { health }
    }
}

fn status_payload(dispatcher: &Dispatcher, health: &HealthSnapshot) -> Value {
    let modules = health
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .as_ref()
        .and_then(|s| serde_json::to_value(s).ok());
    json!({
        "modules": modules,
        "queue": dispatcher.queue().stats(),
        "requests_routed": dispatcher.with_router(|r| r.requests_routed()),
        "requests_failed": dispatcher.with_router(|r| r.requests_failed()),
        "capabilities": dispatcher.with_registry(|r| r.count(None)),
        "routes": dispatcher.with_router(|r| r.get_routes().len()),
    })
}

fn capabilities_payload(dispatcher: &Dispatcher, category: Option<&str>) -> Value {
    dispatcher.with_registry(|registry| {
        Value::Array(
            registry
                .list(category)
                .iter()
                .map(|info| info.describe())
                .collect(),
        )
    })
}

fn upgrade(weak: &Weak<Dispatcher>) -> Result<Arc<Dispatcher>, HandlerError> {
    weak.upgrade()
        .ok_or_else(|| HandlerError::new("dispatcher is shutting down"))
}

impl CapabilityProvider for SystemProvider {
    fn register(
        &self,
        dispatcher: &Arc<Dispatcher>,
        manifest: &ModuleManifest,
    ) -> Result<usize, ProviderError> {
        let module = manifest.name.clone();
        let weak = Arc::downgrade(dispatcher);
        let health = Arc::clone(&self.health);

        // Capabilities, schema-first.
        dispatcher.with_registry_mut(|registry| {
            let status_weak = weak.clone();
            let status_health = Arc::clone(&health);
            registry.register(
                &module,
                CapabilitySpec {
                    name: "system_status".to_string(),
                    category: "system".to_string(),
                    function: Arc::new(move |_args| {
                        status_weak.upgrade().map_or(Ok(Value::Null), |d| {
                            Ok(status_payload(&d, &status_health))
                        })
                    }),
                    parameters: vec![],
                    dependencies: vec![],
                },
            );

            let list_weak = weak.clone();
            registry.register(
                &module,
                CapabilitySpec {
                    name: "list_capabilities".to_string(),
                    category: "system".to_string(),
                    function: Arc::new(move |args| {
                        let category = args.first().and_then(Value::as_str);
                        list_weak.upgrade().map_or(Ok(Value::Null), |d| {
                            Ok(capabilities_payload(&d, category))
                        })
                    }),
                    parameters: vec![
                        ParamSpec::new("category", "string").with_default(Value::Null)
                    ],
                    dependencies: vec![],
                },
            );

            let stats_weak = weak.clone();
            registry.register(
                &module,
                CapabilitySpec {
                    name: "queue_stats".to_string(),
                    category: "system".to_string(),
                    function: Arc::new(move |_args| {
                        stats_weak.upgrade().map_or(Ok(Value::Null), |d| {
                            serde_json::to_value(d.queue().stats()).map_err(|e| {
                                crate::dispatch::registry::CapabilityError::new(
                                    "queue_stats",
                                    e.to_string(),
                                )
                            })
                        })
                    }),
                    parameters: vec![],
                    dependencies: vec![],
                },
            );

            registry.register(
                &module,
                CapabilitySpec {
                    name: "host_ping".to_string(),
                    category: "system".to_string(),
                    function: Arc::new(|args| {
                        // The one "host API" touch the built-ins make; runs
                        // only on the drain thread.
                        Ok(json!({"pong": true, "echo": args.first().cloned()}))
                    }),
                    parameters: vec![ParamSpec::untyped("payload").with_default(Value::Null)],
                    dependencies: vec![],
                },
            );
        });

        // Queue-side handler for the deferred capability.
        let ping = dispatcher
            .with_registry(|r| r.get("host_ping").map(|c| Arc::clone(&c.function)))
            .ok_or_else(|| ProviderError::new("host_ping registration did not take"))?;
        dispatcher.queue().register_handler(
            "host_ping",
            Arc::new(move |args| {
                ping(args).map_err(|e| TaskError::execution("host_ping", e.to_string()))
            }),
        );

        // Routes.
        dispatcher.with_router_mut(|router| {
            let status_weak = weak.clone();
            let status_health = Arc::clone(&health);
            router.register(
                "/system/status",
                Arc::new(move |_path, _method, _data| {
                    let dispatcher = upgrade(&status_weak)?;
                    Ok(status_payload(&dispatcher, &status_health))
                }),
                vec![HttpMethod::Get],
                "system",
                &module,
            );

            let queue_weak = weak.clone();
            router.register(
                "/system/queue",
                Arc::new(move |_path, _method, _data| {
                    let dispatcher = upgrade(&queue_weak)?;
                    serde_json::to_value(dispatcher.queue().stats())
                        .map_err(|e| HandlerError::new(e.to_string()))
                }),
                vec![HttpMethod::Get],
                "system",
                &module,
            );

            let list_weak = weak.clone();
            router.register(
                "/system/capabilities",
                Arc::new(move |_path, _method, data| {
                    let dispatcher = upgrade(&list_weak)?;
                    let category = data.get("category").and_then(Value::as_str);
                    Ok(capabilities_payload(&dispatcher, category))
                }),
                vec![HttpMethod::Get],
                "system",
                &module,
            );

            let list_cat_weak = weak.clone();
            router.register(
                "/system/capabilities/{category}",
                Arc::new(move |_path, _method, data| {
                    let dispatcher = upgrade(&list_cat_weak)?;
                    let category = data.get("category").and_then(Value::as_str);
                    Ok(capabilities_payload(&dispatcher, category))
                }),
                vec![HttpMethod::Get],
                "system",
                &module,
            );

            let ping_weak = weak.clone();
            router.register(
                "/system/ping",
                Arc::new(move |_path, _method, data| {
                    let dispatcher = upgrade(&ping_weak)?;
                    let priority = match data.get("priority").and_then(Value::as_str) {
                        Some("critical") => Priority::Critical,
                        Some("high") => Priority::High,
                        Some("low") => Priority::Low,
                        _ => Priority::Normal,
                    };
                    let payload = data.get("payload").cloned().unwrap_or(Value::Null);

                    // Host-API work never runs on a network thread: enqueue
                    // and answer immediately.
                    if !dispatcher.queue().enqueue("host_ping", vec![payload], priority) {
                        return Err(HandlerError::new("queue is closed for shutdown"));
                    }
                    Ok(json!({"accepted": true, "handler": "host_ping"}))
                }),
                vec![HttpMethod::Post],
                "system",
                &module,
            );
        });

        dispatcher.with_validator_mut(|validator| {
            validator.register_rules(
                "/system/ping",
                vec![ParameterRule::new("priority", ParamKind::String)
                    .default_value(json!("normal"))
                    .allowed(vec![
                        json!("critical"),
                        json!("high"),
                        json!("normal"),
                        json!("low"),
                    ])],
            );
        });

        Ok(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn loaded_dispatcher() -> Arc<Dispatcher> {
        let dispatcher = Arc::new(Dispatcher::default());
        let provider = SystemProvider::new(Arc::new(RwLock::new(None)));
        let manifest: ModuleManifest =
            serde_json::from_str(r#"{"name": "system", "entry": "system"}"#).unwrap();
        provider.register(&dispatcher, &manifest).unwrap();
        dispatcher
    }

    #[test]
    fn status_route_reports_counters() {
        let dispatcher = loaded_dispatcher();
        let response = dispatcher.handle("/system/status", "GET", Map::new());
        assert_eq!(response.status, 200);

        let data = response.data.unwrap();
        assert!(data.get("queue").is_some());
        assert_eq!(data.get("capabilities"), Some(&json!(4)));
    }

    #[test]
    fn ping_defers_through_queue() {
        let dispatcher = loaded_dispatcher();

        let mut data = Map::new();
        data.insert("priority".to_string(), json!("high"));
        let response = dispatcher.handle("/system/ping", "POST", data);
        assert_eq!(response.status, 200);
        assert_eq!(
            response.data.unwrap().get("accepted"),
            Some(&json!(true))
        );

        // Nothing ran yet; the drain pass executes it on the host thread.
        assert_eq!(dispatcher.queue().stats().pending, 1);
        assert_eq!(dispatcher.queue().drain(), 1);
        assert_eq!(dispatcher.queue().stats().tasks_processed, 1);
    }

    #[test]
    fn ping_priority_is_validated() {
        let dispatcher = loaded_dispatcher();

        let mut data = Map::new();
        data.insert("priority".to_string(), json!("urgent"));
        let response = dispatcher.handle("/system/ping", "POST", data);
        assert_eq!(response.status, 400);
        assert_eq!(response.code, Some("NOT_ALLOWED"));
    }

    #[test]
    fn capability_listing_by_category_segment() {
        let dispatcher = loaded_dispatcher();
        let response = dispatcher.handle("/system/capabilities/system", "GET", Map::new());
        assert_eq!(response.status, 200);

        let Value::Array(entries) = response.data.unwrap() else {
            panic!("expected an array of capability descriptions");
        };
        assert_eq!(entries.len(), 4);
    }
}
