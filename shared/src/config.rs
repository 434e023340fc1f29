use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `None` keeps the database in memory.
    pub database_path: Option<PathBuf>,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            busy_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub registry_slot: String,
    pub legacy_slot: String,
    pub fallback_source_id: String,
    pub default_endpoint: String,
    pub default_model: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_slot: "provider-registry".into(),
            legacy_slot: "legacy-provider".into(),
            fallback_source_id: "default".into(),
            default_endpoint: "https://generativelanguage.googleapis.com".into(),
            default_model: "gemini-2.5-flash".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollDefaults {
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_ms: 5 * 60 * 1000,
        }
    }
}

impl PollDefaults {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub registry: RegistryConfig,
    pub polling: PollDefaults,
}

impl CoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.busy_timeout_ms == 0 {
            return Err(ConfigError("busy_timeout_ms must be > 0".into()));
        }
        if let Some(path) = &self.store.database_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError("database_path cannot be empty".into()));
            }
        }
        if self.registry.registry_slot == self.registry.legacy_slot {
            return Err(ConfigError(
                "registry_slot and legacy_slot must differ".into(),
            ));
        }
        if self.registry.fallback_source_id.trim().is_empty() {
            return Err(ConfigError("fallback_source_id cannot be empty".into()));
        }
        if url::Url::parse(&self.registry.default_endpoint).is_err() {
            return Err(ConfigError("default_endpoint must be a valid URL".into()));
        }
        if self.polling.interval_ms == 0 {
            return Err(ConfigError("poll interval_ms must be > 0".into()));
        }
        if self.polling.timeout_ms < self.polling.interval_ms {
            return Err(ConfigError(
                "poll timeout_ms should be at least one interval".into(),
            ));
        }
        Ok(())
    }
}
