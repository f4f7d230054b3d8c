// src/config_mod.rs
// Engine configuration: defaults, then an optional `canopy.toml`, then CANOPY__* environment overrides

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::storage::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: String,
    /// Pause before the single retry of a transient backend failure
    pub retry_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            sqlite_path: "./canopy.sqlite".to_string(),
            retry_delay_ms: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Events a subscriber may lag behind before it is dropped
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { subscriber_buffer: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub inbox_capacity: usize,
    /// Per-connection queue of pushed events
    pub event_buffer: usize,
    pub max_payload_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 128,
            event_buffer: 256,
            max_payload_bytes: 1024 * 1024, // 1MB
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_level: String,
    pub storage: StorageConfig,
    pub bus: BusConfig,
    pub gateway: GatewayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage: StorageConfig::default(),
            bus: BusConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (required when given) or `./canopy.toml` (optional), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        builder = match path {
            Some(path) => builder.add_source(File::from(path).required(true)),
            None => builder.add_source(File::with_name("canopy").required(false)),
        };
        let config: EngineConfig = builder
            .add_source(Environment::with_prefix("CANOPY").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("bus.subscriber_buffer", self.bus.subscriber_buffer),
            ("gateway.inbox_capacity", self.gateway.inbox_capacity),
            ("gateway.event_buffer", self.gateway.event_buffer),
            ("gateway.max_payload_bytes", self.gateway.max_payload_bytes),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "storage.sqlite_path".to_string(),
                reason: "required for the sqlite backend".to_string(),
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            delay: Duration::from_millis(self.storage.retry_delay_ms),
        }
    }
}
