//! Capability registry: named, categorised units of executable behaviour.
//!
//! Capabilities are registered through an explicit typed interface with a
//! declared parameter schema, never discovered by reflecting over callables.
//! Names are unique registry-wide; re-registering a name overwrites the prior
//! entry (last writer wins), which is what makes hot reload work.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failure raised by a capability implementation.
///
/// Capability functions signal failure through this type, never by silent
/// return; the implementation is only ever invoked from the drain-loop thread.
#[derive(Debug, Clone, Error)]
#[error("capability '{capability}' failed: {message}")]
pub struct CapabilityError {
    /// Name of the capability that failed.
    pub capability: String,
    /// Failure description.
    pub message: String,
}

impl CapabilityError {
    /// Creates a new capability failure.
    #[must_use]
    pub fn new(capability: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            message: message.into(),
        }
    }
}

/// The callable behind a capability. Receives already-validated, coerced
/// positional arguments.
pub type CapabilityFn = dyn Fn(&[Value]) -> Result<Value, CapabilityError> + Send + Sync;

/// Declared schema for one capability parameter.
#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    /// Parameter name.
    pub name: String,
    /// Declared type name ("Any" when the capability accepts anything).
    #[serde(rename = "type")]
    pub ty: String,
    /// Default value, if the parameter is optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    /// Creates a required parameter with a declared type.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            default: None,
        }
    }

    /// Creates a parameter with no declared type.
    #[must_use]
    pub fn untyped(name: impl Into<String>) -> Self {
        Self::new(name, "Any")
    }

    /// Attaches a default value, marking the parameter optional.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// A registration request: everything the registry needs to hold a capability.
pub struct CapabilitySpec {
    /// Unique capability name.
    pub name: String,
    /// Category (normalised to lowercase at registration).
    pub category: String,
    /// The implementation.
    pub function: Arc<CapabilityFn>,
    /// Declared parameter schema, in call order.
    pub parameters: Vec<ParamSpec>,
    /// Names of other capabilities this one needs at runtime.
    pub dependencies: Vec<String>,
}

/// A registered capability and its metadata. Immutable after registration.
#[derive(Clone)]
pub struct CapabilityInfo {
    /// Unique capability name.
    pub name: String,
    /// Lowercased category.
    pub category: String,
    /// The implementation.
    pub function: Arc<CapabilityFn>,
    /// Declared parameter schema, in call order.
    pub parameters: Vec<ParamSpec>,
    /// Names of other capabilities this one needs at runtime.
    pub dependencies: Vec<String>,
    /// Module that registered this capability.
    pub owning_module: String,
}

impl fmt::Debug for CapabilityInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityInfo")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("parameters", &self.parameters)
            .field("dependencies", &self.dependencies)
            .field("owning_module", &self.owning_module)
            .finish_non_exhaustive()
    }
}

impl CapabilityInfo {
    /// Returns a serialisable description (name, category, schema, deps).
    #[must_use]
    pub fn describe(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "category": self.category,
            "parameters": self.parameters,
            "dependencies": self.dependencies,
            "module": self.owning_module,
        })
    }
}

/// Holds every registered capability, keyed by name in registration order.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: IndexMap<String, CapabilityInfo>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability for `module`.
    ///
    /// The category is normalised to lowercase. Registering an existing name
    /// replaces the prior entry.
    pub fn register(&mut self, module: impl Into<String>, spec: CapabilitySpec) {
        let info = CapabilityInfo {
            name: spec.name.clone(),
            category: spec.category.to_lowercase(),
            function: spec.function,
            parameters: spec.parameters,
            dependencies: spec.dependencies,
            owning_module: module.into(),
        };

        if self.capabilities.contains_key(&spec.name) {
            tracing::debug!(capability = %spec.name, "Replacing existing capability registration");
        }
        self.capabilities.insert(spec.name, info);
    }

    /// Looks up a capability by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&CapabilityInfo> {
        self.capabilities.get(name)
    }

    /// Removes every capability owned by `module`, returning how many were
    /// removed. Used by module reload.
    pub fn remove_module(&mut self, module: &str) -> usize {
        let before = self.capabilities.len();
        self.capabilities.retain(|_, info| info.owning_module != module);
        before - self.capabilities.len()
    }

    /// Lists capabilities, optionally restricted to one category.
    ///
    /// Category comparison is case-insensitive.
    #[must_use]
    pub fn list(&self, category: Option<&str>) -> Vec<&CapabilityInfo> {
        let category = category.map(str::to_lowercase);
        self.capabilities
            .values()
            .filter(|info| category.as_deref().map_or(true, |c| info.category == c))
            .collect()
    }

    /// Counts capabilities, optionally restricted to one category.
    #[must_use]
    pub fn count(&self, category: Option<&str>) -> usize {
        self.list(category).len()
    }

    /// Checks that every declared dependency resolves to a registered
    /// capability. Checked only when asked, not continuously.
    #[must_use]
    pub fn validate_dependencies(&self) -> bool {
        self.capabilities.values().all(|info| {
            info.dependencies.iter().all(|dep| {
                let present = self.capabilities.contains_key(dep);
                if !present {
                    tracing::warn!(
                        capability = %info.name,
                        dependency = %dep,
                        "Unresolved capability dependency"
                    );
                }
                present
            })
        })
    }

    /// Returns the unmet dependencies among `names`, against the live registry.
    #[must_use]
    pub fn missing_dependencies(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !self.capabilities.contains_key(name.as_str()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_spec(name: &str, category: &str, deps: Vec<String>) -> CapabilitySpec {
        CapabilitySpec {
            name: name.to_string(),
            category: category.to_string(),
            function: Arc::new(|_args| Ok(Value::Null)),
            parameters: vec![ParamSpec::new("x", "integer").with_default(json!(0))],
            dependencies: deps,
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = CapabilityRegistry::new();
        registry.register("mod_a", noop_spec("draw_line", "Geometry", vec![]));

        let info = registry.get("draw_line").unwrap();
        assert_eq!(info.category, "geometry");
        assert_eq!(info.owning_module, "mod_a");
        assert_eq!(info.parameters[0].name, "x");
    }

    #[test]
    fn last_writer_wins() {
        let mut registry = CapabilityRegistry::new();
        registry.register("mod_a", noop_spec("op", "a", vec![]));
        registry.register("mod_b", noop_spec("op", "b", vec![]));

        assert_eq!(registry.count(None), 1);
        assert_eq!(registry.get("op").unwrap().owning_module, "mod_b");
    }

    #[test]
    fn list_by_category_case_insensitive() {
        let mut registry = CapabilityRegistry::new();
        registry.register("m", noop_spec("a", "Geometry", vec![]));
        registry.register("m", noop_spec("b", "toolpath", vec![]));
        registry.register("m", noop_spec("c", "GEOMETRY", vec![]));

        assert_eq!(registry.list(Some("geometry")).len(), 2);
        assert_eq!(registry.list(Some("Geometry")).len(), 2);
        assert_eq!(registry.count(Some("toolpath")), 1);
        assert_eq!(registry.count(None), 3);
    }

    #[test]
    fn dependency_validation() {
        let mut registry = CapabilityRegistry::new();
        registry.register("m", noop_spec("base", "core", vec![]));
        registry.register("m", noop_spec("derived", "core", vec!["base".to_string()]));
        assert!(registry.validate_dependencies());

        registry.register("m", noop_spec("broken", "core", vec!["missing".to_string()]));
        assert!(!registry.validate_dependencies());
        assert_eq!(
            registry.missing_dependencies(&["missing".to_string(), "base".to_string()]),
            vec!["missing".to_string()]
        );
    }

    #[test]
    fn remove_module_drops_only_its_capabilities() {
        let mut registry = CapabilityRegistry::new();
        registry.register("m1", noop_spec("a", "core", vec![]));
        registry.register("m2", noop_spec("b", "core", vec![]));

        assert_eq!(registry.remove_module("m1"), 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }
}
