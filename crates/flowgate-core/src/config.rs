//! Engine configuration.
//!
//! Loaded from YAML; every field has a default so a partial file (or no
//! file at all) is valid:
//!
//! ```yaml
//! db_path: "flowgate.db"
//! connections:
//!   request_timeout_ms: 30000
//!   health_failure_threshold: 3
//! scheduler:
//!   max_parallelism: 8
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database file.
    pub db_path: String,
    pub connections: ConnectionConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "flowgate.db".to_string(),
            connections: ConnectionConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Connection manager and health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Default bound for `send_request` when the caller gives none.
    pub request_timeout_ms: u64,
    /// Bound for each of the `initialize` and `tools/list` calls during connect.
    pub connect_timeout_ms: u64,
    /// Period of the background health loop. Zero disables it.
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    /// Consecutive failed probes before a server is moved to `error`.
    pub health_failure_threshold: u32,
    pub liveness_method: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            connect_timeout_ms: 15_000,
            health_check_interval_secs: 30,
            health_check_timeout_ms: 5_000,
            health_failure_threshold: 3,
            liveness_method: "ping".to_string(),
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Step scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// In-flight bound for `agentic` and `hybrid` runs.
    pub max_parallelism: usize,
    pub default_step_timeout_secs: u64,
    pub default_max_retries: u32,
    /// Fixed delay between attempts of a transiently failing step.
    pub retry_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 4,
            default_step_timeout_secs: 300,
            default_max_retries: 2,
            retry_delay_ms: 1_000,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Validation(format!("Failed to parse config YAML: {}", e)))
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("Failed to read config file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}
