//! Configuration for the sandbox and its isolate pool

use crate::error::{SandboxError, SandboxResult};
use crate::policy::SandboxPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Deployment policy every call is checked against
    #[serde(default)]
    pub policy: SandboxPolicy,
    /// Isolate pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Isolate pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live isolates
    #[serde(default = "PoolConfig::default_capacity")]
    pub capacity: usize,
    /// How long `acquire` waits for a free isolate
    #[serde(
        default = "PoolConfig::default_acquire_timeout",
        with = "humantime_serde"
    )]
    pub acquire_timeout: Duration,
    /// How often the watchdog checks a running script's deadline
    #[serde(
        default = "PoolConfig::default_watchdog_interval",
        with = "humantime_serde"
    )]
    pub watchdog_interval: Duration,
    /// Scripts run once in every new isolate
    #[serde(default)]
    pub prelude: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            acquire_timeout: Self::default_acquire_timeout(),
            watchdog_interval: Self::default_watchdog_interval(),
            prelude: Vec::new(),
        }
    }
}

impl PoolConfig {
    fn default_capacity() -> usize {
        4
    }

    fn default_acquire_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_watchdog_interval() -> Duration {
        Duration::from_millis(10)
    }
}

impl SandboxConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> SandboxResult<Self> {
        let config: SandboxConfig = toml::from_str(content).map_err(|e| {
            SandboxError::Configuration(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> SandboxResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Configuration(format!(
                "Failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> SandboxResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SandboxError::Configuration(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.pool.capacity == 0 {
            return Err(SandboxError::Configuration(
                "pool capacity must be at least 1".to_string(),
            ));
        }
        if self.pool.watchdog_interval.is_zero() {
            return Err(SandboxError::Configuration(
                "watchdog interval must be greater than zero".to_string(),
            ));
        }
        if self.policy.max_heap_bytes == 0 {
            return Err(SandboxError::Configuration(
                "policy heap budget must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
