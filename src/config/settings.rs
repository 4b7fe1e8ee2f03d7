//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format.

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::ConfigError;

/// Root configuration structure.
///
/// This is the top-level structure that matches the JSON config file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// HTTP listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Task queue and drain loop settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Capability module settings.
    #[serde(default)]
    pub modules: ModulesConfig,

    /// Error handler settings.
    #[serde(default)]
    pub errors: ErrorsConfig,

    /// Outbound client settings.
    #[serde(default)]
    pub client: ClientConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "queue.poll_interval_ms must be greater than 0".to_string(),
            });
        }
        if self.errors.history_capacity == 0 {
            return Err(ConfigError::ValidationError {
                message: "errors.history_capacity must be greater than 0".to_string(),
            });
        }
        if self.client.timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "client.timeout_ms must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            _schema: None,
            _comment: None,
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            modules: ModulesConfig::default(),
            errors: ErrorsConfig::default(),
            client: ClientConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    9285
}

/// Task queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Drain loop polling interval in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

const fn default_poll_interval() -> u64 {
    100
}

/// Capability module configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModulesConfig {
    /// Category → directory roots walked during discovery.
    #[serde(default)]
    pub roots: IndexMap<String, PathBuf>,

    /// Isolate per-module load faults and keep going (default). Disable for
    /// strict environments where the first failure should stop the batch.
    #[serde(default = "default_true")]
    pub recovery_mode: bool,
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            roots: IndexMap::new(),
            recovery_mode: default_true(),
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Error handler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorsConfig {
    /// Maximum records held before the oldest is evicted.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
        }
    }
}

const fn default_history_capacity() -> usize {
    500
}

/// Outbound client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_client_timeout")]
    pub timeout_ms: u64,

    /// Attempts per send, including the first (so 3 means up to 2 retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_client_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

const fn default_client_timeout() -> u64 {
    5_000
}

const fn default_max_attempts() -> u32 {
    3
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Test config",
            "server": {
                "host": "0.0.0.0",
                "port": 8080
            },
            "queue": {
                "poll_interval_ms": 50
            },
            "modules": {
                "roots": {
                    "geometry": "/opt/bridge/modules/geometry",
                    "toolpath": "/opt/bridge/modules/toolpath"
                },
                "recovery_mode": false
            },
            "errors": {
                "history_capacity": 100
            },
            "client": {
                "timeout_ms": 2000,
                "max_attempts": 5
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.queue.poll_interval_ms, 50);
        assert_eq!(config.modules.roots.len(), 2);
        assert!(!config.modules.recovery_mode);
        assert_eq!(config.errors.history_capacity, 100);
        assert_eq!(config.client.timeout_ms, 2000);
        assert_eq!(config.client.max_attempts, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.queue.poll_interval_ms, 100);
        assert!(config.modules.recovery_mode);
        assert_eq!(config.errors.history_capacity, 500);
        assert_eq!(config.client.max_attempts, 3);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn reject_zero_poll_interval() {
        let json = r#"{"queue": {"poll_interval_ms": 0}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{"unknown_field": "value"}"#;
        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
