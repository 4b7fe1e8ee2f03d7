//! Module discovery, loading, and health reporting.
//!
//! A module is a JSON manifest discovered under a category root. Its `entry`
//! field names a compiled-in [`CapabilityProvider`] that performs the actual
//! registration through a typed call — there is no reflection over arbitrary
//! callables. Loading is a per-module pipeline:
//!
//! `DISCOVERED → IMPORTING → STRUCTURE_CHECKED → DEPENDENCY_CHECKED →
//! REGISTERED` or `FAILED`
//!
//! Terminal states are final until an explicit [`ModuleLoader::reload`].
//! Under error-recovery mode (the default) a failed module is isolated and
//! the batch continues; with recovery disabled the first failure stops the
//! batch. A failed module contributes nothing to the live registry or route
//! table — partial registrations are rolled back.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::dispatch::errors::{ErrorCategory, ErrorRecord, Severity};
use crate::dispatch::Dispatcher;

/// Failure raised by a provider's registration entry point.
#[derive(Debug, Clone, Error)]
#[error("provider registration failed: {message}")]
pub struct ProviderError {
    /// Failure description.
    pub message: String,
}

impl ProviderError {
    /// Creates a new provider failure.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The registration contract every capability module implements.
///
/// The loader resolves a manifest's entry key to a provider and hands it the
/// shared dispatcher; the provider registers its capabilities, routes, and
/// validation rules through the dispatcher's typed interfaces.
pub trait CapabilityProvider: Send + Sync {
    /// Registers this provider's capabilities for `manifest`'s module.
    ///
    /// Takes the shared dispatcher so route handlers can hold a weak
    /// reference back to it. Returns the number of capabilities registered.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] when registration cannot complete; the
    /// loader rolls back anything partially registered.
    fn register(
        &self,
        dispatcher: &Arc<Dispatcher>,
        manifest: &ModuleManifest,
    ) -> Result<usize, ProviderError>;
}

/// A parsed module manifest.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleManifest {
    /// Module name (unique across the batch).
    pub name: String,
    /// Provider key; when absent the module name is tried instead and a
    /// structure warning is recorded.
    #[serde(default)]
    pub entry: Option<String>,
    /// Capability names this module needs from the live registry.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Provider-specific settings, passed through untouched.
    #[serde(default)]
    pub settings: Option<Value>,
}

/// Classification of a module load fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleErrorType {
    /// The manifest could not be read/parsed, or its entry key resolved to
    /// no compiled-in provider.
    ImportError,
    /// The manifest is missing its registration entry point.
    StructureError,
    /// A declared dependency is not in the live registry.
    DependencyError,
    /// The provider's registration call failed.
    RuntimeError,
}

impl ModuleErrorType {
    /// Returns the display name for this error type.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ImportError => "IMPORT_ERROR",
            Self::StructureError => "STRUCTURE_ERROR",
            Self::DependencyError => "DEPENDENCY_ERROR",
            Self::RuntimeError => "RUNTIME_ERROR",
        }
    }

    /// Static remediation suggestion, surfaced by the error report.
    #[must_use]
    pub const fn suggestion(self) -> &'static str {
        match self {
            Self::ImportError => {
                "Check that the manifest is valid JSON and its entry key matches a compiled-in provider"
            }
            Self::StructureError => {
                "Add an 'entry' field naming the provider that registers this module's capabilities"
            }
            Self::DependencyError => {
                "Load the module that registers the missing capability, or remove the dependency"
            }
            Self::RuntimeError => {
                "Inspect the provider's registration failure; the module was rolled back"
            }
        }
    }
}

/// One recorded module load fault. Appended, never mutated; cleared only by
/// reload.
#[derive(Debug, Clone)]
pub struct ModuleError {
    /// Manifest path the fault applies to.
    pub module_path: PathBuf,
    /// Fault classification.
    pub error_type: ModuleErrorType,
    /// Description.
    pub message: String,
    /// Severity tag.
    pub severity: Severity,
}

/// Where a module is in the load pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    /// Candidate manifest found on disk.
    Discovered,
    /// Manifest parsing in progress.
    Importing,
    /// Entry point checked.
    StructureChecked,
    /// Dependencies checked against the live registry.
    DependencyChecked,
    /// Capabilities registered; terminal.
    Registered,
    /// Load failed; terminal.
    Failed,
}

/// Everything known about one discovered module.
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// Module name (manifest name, or file stem before import).
    pub name: String,
    /// Name the manifest declared, recorded once parsed. May differ from the
    /// file stem; registrations are keyed by this name, so rollback and
    /// reload must unregister it.
    pub manifest_name: Option<String>,
    /// Category root the manifest was found under.
    pub category: String,
    /// Manifest path.
    pub path: PathBuf,
    /// Pipeline state.
    pub state: ModuleState,
    /// True once registration completed.
    pub loaded: bool,
    /// Names of the capabilities this module registered.
    pub capabilities: Vec<String>,
    /// Declared dependency capability names.
    pub dependencies: Vec<String>,
    /// Faults recorded during the load attempt.
    pub errors: Vec<ModuleError>,
}

/// Aggregate system health derived from load results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    /// Everything loaded; warnings at most.
    Healthy,
    /// Some faults, but the system is operational.
    Degraded,
    /// Half or more of the modules failed.
    Poor,
    /// At least one critical-severity fault.
    Critical,
}

/// Load totals plus the derived health status.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LoaderSummary {
    /// Modules discovered.
    pub total_modules: usize,
    /// Modules that completed registration.
    pub loaded_modules: usize,
    /// Modules in the failed state.
    pub failed_modules: usize,
    /// ERROR-severity fault count.
    pub errors: usize,
    /// WARNING-severity fault count.
    pub warnings: usize,
    /// CRITICAL-severity fault count.
    pub critical_errors: usize,
    /// Derived health.
    pub health: HealthStatus,
}

/// Discovers and loads capability modules against a dispatcher.
pub struct ModuleLoader {
    roots: IndexMap<String, PathBuf>,
    providers: HashMap<String, Arc<dyn CapabilityProvider>>,
    modules: IndexMap<String, ModuleInfo>,
    recovery_mode: bool,
}

impl fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("roots", &self.roots)
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("modules", &self.modules.len())
            .field("recovery_mode", &self.recovery_mode)
            .finish()
    }
}

impl ModuleLoader {
    /// Creates a loader over the category → directory layout in `roots`.
    ///
    /// `recovery_mode` (the default for production) isolates per-module
    /// faults; disabling it stops the batch at the first failure.
    #[must_use]
    pub fn new(roots: IndexMap<String, PathBuf>, recovery_mode: bool) -> Self {
        Self {
            roots,
            providers: HashMap::new(),
            modules: IndexMap::new(),
            recovery_mode,
        }
    }

    /// Registers a compiled-in provider under `key`.
    pub fn add_provider(&mut self, key: impl Into<String>, provider: Arc<dyn CapabilityProvider>) {
        self.providers.insert(key.into(), provider);
    }

    /// Walks the category roots for candidate manifests.
    ///
    /// Skips files and directories whose name starts with `_`, hidden
    /// entries, and compiled-cache directories. Never descends outside the
    /// declared roots.
    pub fn discover(&mut self) -> usize {
        let mut found = 0;

        for (category, root) in &self.roots {
            let pattern = root.join("**").join("*.json");
            let Some(pattern) = pattern.to_str() else {
                tracing::warn!(root = %root.display(), "Skipping non-UTF-8 category root");
                continue;
            };

            let Ok(paths) = glob::glob(pattern) else {
                tracing::warn!(root = %root.display(), "Invalid discovery pattern");
                continue;
            };

            for path in paths.flatten() {
                if is_skipped(&path, root) {
                    continue;
                }

                let stem = path
                    .file_stem()
                    .map_or_else(String::new, |s| s.to_string_lossy().into_owned());
                let info = ModuleInfo {
                    name: stem.clone(),
                    manifest_name: None,
                    category: category.clone(),
                    path: path.clone(),
                    state: ModuleState::Discovered,
                    loaded: false,
                    capabilities: Vec::new(),
                    dependencies: Vec::new(),
                    errors: Vec::new(),
                };
                self.modules.insert(stem, info);
                found += 1;
            }
        }

        tracing::info!(found, "Module discovery complete");
        found
    }

    /// Loads every discovered module against `dispatcher`.
    ///
    /// Returns the summary. Under recovery mode a failed module is recorded
    /// and the batch continues; otherwise the batch stops at the first
    /// failed module (already-loaded modules stay loaded).
    pub fn load_all(&mut self, dispatcher: &Arc<Dispatcher>) -> LoaderSummary {
        let names: Vec<String> = self.modules.keys().cloned().collect();

        for name in names {
            let failed = !self.load_one(&name, dispatcher);
            if failed && !self.recovery_mode {
                tracing::error!(module = %name, "Stopping batch: recovery mode disabled");
                break;
            }
        }

        self.summary()
    }

    /// Reloads one module: rolls back its registrations, clears its recorded
    /// errors, and re-runs the pipeline from its manifest.
    ///
    /// Returns `true` when the module ends up loaded. Unknown names return
    /// `false`.
    pub fn reload(&mut self, name: &str, dispatcher: &Arc<Dispatcher>) -> bool {
        if !self.modules.contains_key(name) {
            return false;
        }

        // Registrations are keyed by the manifest's declared name, which may
        // differ from the file stem the loader keys modules by.
        dispatcher.unregister_module(name);
        if let Some(info) = self.modules.get_mut(name) {
            if let Some(manifest_name) = info.manifest_name.take() {
                if manifest_name != name {
                    dispatcher.unregister_module(&manifest_name);
                }
            }
            info.state = ModuleState::Discovered;
            info.loaded = false;
            info.capabilities.clear();
            info.dependencies.clear();
            info.errors.clear();
        }

        self.load_one(name, dispatcher)
    }

    /// Runs the pipeline for one module. Returns `true` when it loads.
    fn load_one(&mut self, name: &str, dispatcher: &Arc<Dispatcher>) -> bool {
        let Some(info) = self.modules.get(name) else {
            return false;
        };
        if info.state != ModuleState::Discovered {
            // Terminal states are final without an explicit reload.
            return info.loaded;
        }

        let path = info.path.clone();
        let category = info.category.clone();
        self.set_state(name, ModuleState::Importing);

        // Import: read and parse the manifest.
        let manifest = match read_manifest(&path) {
            Ok(manifest) => manifest,
            Err(message) => {
                self.fail(
                    name,
                    dispatcher,
                    ModuleError {
                        module_path: path,
                        error_type: ModuleErrorType::ImportError,
                        message,
                        severity: Severity::Error,
                    },
                );
                return false;
            }
        };
        if let Some(info) = self.modules.get_mut(name) {
            info.manifest_name = Some(manifest.name.clone());
        }

        // Structure: the registration entry point must be declared.
        let entry_key = if let Some(entry) = &manifest.entry {
            entry.clone()
        } else {
            self.record(
                name,
                dispatcher,
                ModuleError {
                    module_path: path.clone(),
                    error_type: ModuleErrorType::StructureError,
                    message: format!(
                        "manifest '{}' has no 'entry' field; falling back to the module name",
                        manifest.name
                    ),
                    severity: Severity::Warning,
                },
            );
            manifest.name.clone()
        };
        self.set_state(name, ModuleState::StructureChecked);

        let Some(provider) = self.providers.get(&entry_key).cloned() else {
            self.fail(
                name,
                dispatcher,
                ModuleError {
                    module_path: path,
                    error_type: ModuleErrorType::ImportError,
                    message: format!("no compiled-in provider for entry '{entry_key}'"),
                    severity: Severity::Error,
                },
            );
            return false;
        };

        // Dependencies: checked against the live registry. Unmet ones are
        // errors but, under recovery mode, do not block the module's own
        // capabilities — callers re-validate before invoking.
        let missing = dispatcher.with_registry(|r| r.missing_dependencies(&manifest.dependencies));
        for dep in &missing {
            self.record(
                name,
                dispatcher,
                ModuleError {
                    module_path: path.clone(),
                    error_type: ModuleErrorType::DependencyError,
                    message: format!("unmet dependency '{dep}'"),
                    severity: Severity::Error,
                },
            );
        }
        if !missing.is_empty() && !self.recovery_mode {
            self.set_failed(name);
            return false;
        }
        self.set_state(name, ModuleState::DependencyChecked);

        // Registration through the typed provider contract.
        match provider.register(dispatcher, &manifest) {
            Ok(count) => {
                let registered: Vec<String> = dispatcher.with_registry(|r| {
                    r.list(None)
                        .iter()
                        .filter(|c| c.owning_module == manifest.name || c.owning_module == *name)
                        .map(|c| c.name.clone())
                        .collect()
                });

                if let Some(info) = self.modules.get_mut(name) {
                    info.state = ModuleState::Registered;
                    info.loaded = true;
                    info.capabilities = registered;
                    info.dependencies = manifest.dependencies.clone();
                }
                tracing::info!(module = %name, category = %category, capabilities = count, "Module loaded");
                true
            }
            Err(err) => {
                // All-or-nothing: roll back anything partially registered.
                dispatcher.unregister_module(name);
                dispatcher.unregister_module(&manifest.name);
                self.fail(
                    name,
                    dispatcher,
                    ModuleError {
                        module_path: path,
                        error_type: ModuleErrorType::RuntimeError,
                        message: err.message,
                        severity: Severity::Error,
                    },
                );
                false
            }
        }
    }

    fn set_state(&mut self, name: &str, state: ModuleState) {
        if let Some(info) = self.modules.get_mut(name) {
            info.state = state;
        }
    }

    fn set_failed(&mut self, name: &str) {
        if let Some(info) = self.modules.get_mut(name) {
            info.state = ModuleState::Failed;
            info.loaded = false;
        }
    }

    /// Records a fault without failing the module.
    fn record(&mut self, name: &str, dispatcher: &Arc<Dispatcher>, error: ModuleError) {
        dispatcher.errors().report(ErrorRecord::new(
            name,
            "load",
            ErrorCategory::ModuleLoad,
            error.severity,
            format!("{}: {}", error.error_type.name(), error.message),
        ));
        if let Some(info) = self.modules.get_mut(name) {
            info.errors.push(error);
        }
    }

    /// Records a fault and marks the module failed.
    fn fail(&mut self, name: &str, dispatcher: &Arc<Dispatcher>, error: ModuleError) {
        tracing::error!(
            module = %name,
            error_type = error.error_type.name(),
            message = %error.message,
            "Module load failed"
        );
        self.record(name, dispatcher, error);
        self.set_failed(name);
    }

    /// Read-only view of one module.
    #[must_use]
    pub fn get_module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name)
    }

    /// Read-only view of all modules, in discovery order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleInfo> {
        self.modules.values()
    }

    /// Computes load totals and derived health.
    #[must_use]
    pub fn summary(&self) -> LoaderSummary {
        let total_modules = self.modules.len();
        let loaded_modules = self.modules.values().filter(|m| m.loaded).count();
        let failed_modules = self
            .modules
            .values()
            .filter(|m| m.state == ModuleState::Failed)
            .count();

        let mut errors = 0;
        let mut warnings = 0;
        let mut critical_errors = 0;
        for module in self.modules.values() {
            for error in &module.errors {
                match error.severity {
                    Severity::Warning => warnings += 1,
                    Severity::Error => errors += 1,
                    Severity::Critical => critical_errors += 1,
                }
            }
        }

        let health = if critical_errors > 0 {
            HealthStatus::Critical
        } else if total_modules > 0 && failed_modules * 2 >= total_modules {
            HealthStatus::Poor
        } else if errors > 0 || failed_modules > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        LoaderSummary {
            total_modules,
            loaded_modules,
            failed_modules,
            errors,
            warnings,
            critical_errors,
            health,
        }
    }

    /// Groups recorded faults by type, with a static remediation suggestion
    /// per type.
    #[must_use]
    pub fn get_error_report(&self) -> Value {
        let mut grouped: IndexMap<&'static str, Vec<Value>> = IndexMap::new();

        for module in self.modules.values() {
            for error in &module.errors {
                grouped
                    .entry(error.error_type.name())
                    .or_default()
                    .push(serde_json::json!({
                        "module": module.name,
                        "path": error.module_path.display().to_string(),
                        "message": error.message,
                        "severity": error.severity,
                    }));
            }
        }

        let report: Vec<Value> = grouped
            .into_iter()
            .map(|(error_type, entries)| {
                let suggestion = match error_type {
                    "IMPORT_ERROR" => ModuleErrorType::ImportError.suggestion(),
                    "STRUCTURE_ERROR" => ModuleErrorType::StructureError.suggestion(),
                    "DEPENDENCY_ERROR" => ModuleErrorType::DependencyError.suggestion(),
                    _ => ModuleErrorType::RuntimeError.suggestion(),
                };
                serde_json::json!({
                    "error_type": error_type,
                    "count": entries.len(),
                    "suggestion": suggestion,
                    "errors": entries,
                })
            })
            .collect();

        Value::Array(report)
    }
}

/// True when any path component below `root` is skipped by discovery policy.
fn is_skipped(path: &Path, root: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative.components().any(|component| {
        let name = component.as_os_str().to_string_lossy();
        name.starts_with('_') || name.starts_with('.') || name == "target"
    })
}

fn read_manifest(path: &Path) -> Result<ModuleManifest, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read manifest '{}': {e}", path.display()))?;
    serde_json::from_str(&contents)
        .map_err(|e| format!("cannot parse manifest '{}': {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_policy() {
        let root = Path::new("/modules/geometry");
        assert!(is_skipped(
            Path::new("/modules/geometry/_draft.json"),
            root
        ));
        assert!(is_skipped(
            Path::new("/modules/geometry/_wip/mod.json"),
            root
        ));
        assert!(is_skipped(
            Path::new("/modules/geometry/.hidden/mod.json"),
            root
        ));
        assert!(is_skipped(
            Path::new("/modules/geometry/target/mod.json"),
            root
        ));
        assert!(!is_skipped(
            Path::new("/modules/geometry/lines.json"),
            root
        ));
    }

    #[test]
    fn manifest_parsing() {
        let manifest: ModuleManifest = serde_json::from_str(
            r#"{"name": "sketch", "entry": "sketch_provider", "dependencies": ["host_ping"]}"#,
        )
        .unwrap();
        assert_eq!(manifest.name, "sketch");
        assert_eq!(manifest.entry.as_deref(), Some("sketch_provider"));
        assert_eq!(manifest.dependencies, vec!["host_ping".to_string()]);
    }

    #[test]
    fn manifest_rejects_unknown_fields() {
        let result: Result<ModuleManifest, _> =
            serde_json::from_str(r#"{"name": "x", "unexpected": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn error_type_names_and_suggestions() {
        assert_eq!(ModuleErrorType::ImportError.name(), "IMPORT_ERROR");
        assert_eq!(ModuleErrorType::StructureError.name(), "STRUCTURE_ERROR");
        assert_eq!(ModuleErrorType::DependencyError.name(), "DEPENDENCY_ERROR");
        assert_eq!(ModuleErrorType::RuntimeError.name(), "RUNTIME_ERROR");
        assert!(!ModuleErrorType::ImportError.suggestion().is_empty());
    }

    #[test]
    fn empty_loader_is_healthy() {
        let loader = ModuleLoader::new(IndexMap::new(), true);
        let summary = loader.summary();
        assert_eq!(summary.total_modules, 0);
        assert_eq!(summary.health, HealthStatus::Healthy);
    }
}
