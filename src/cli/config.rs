use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::bridge::RuntimeLimits;
use crate::engine::EngineSettings;
use crate::error::ConfigurationError;
use crate::utils::parse_optional_duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
pub const DEFAULT_SCRIPT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;
pub const DEFAULT_SCRIPT_STACK_SIZE: usize = 1024 * 1024;
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 256;

/// Engine-wide settings. Everything about *what* to run lives in the script.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Default timeout of one HTTP step (e.g., "30s"). Request specs may override it.
    #[serde(alias = "requestTimeout")]
    pub request_timeout: Option<String>,
    /// How long draining scenarios wait for in-flight iterations before cancelling them
    /// (default: "10s"). An operator stop does not wait.
    #[serde(alias = "gracePeriod")]
    pub grace_period: Option<String>,
    /// JS heap limit per virtual user in bytes (default: 32MiB).
    #[serde(alias = "scriptMemoryLimit")]
    pub script_memory_limit: Option<usize>,
    /// JS stack limit per virtual user in bytes (default: 1MiB).
    #[serde(alias = "scriptStackSize")]
    pub script_stack_size: Option<usize>,
    /// Idle keep-alive connections kept per host (default: 256).
    #[serde(alias = "poolMaxIdlePerHost")]
    pub pool_max_idle_per_host: Option<usize>,
}

impl EngineConfig {
    /// Load from YAML, or JSON when the file name ends in `.json`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let config = if is_json {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON config {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("invalid YAML config {}", path.display()))?
        };
        Ok(config)
    }

    pub fn settings(&self) -> Result<EngineSettings, ConfigurationError> {
        let memory_limit = self.script_memory_limit.unwrap_or(DEFAULT_SCRIPT_MEMORY_LIMIT);
        let stack_size = self.script_stack_size.unwrap_or(DEFAULT_SCRIPT_STACK_SIZE);
        if memory_limit == 0 || stack_size == 0 {
            return Err(ConfigurationError::Engine(
                "script memory limit and stack size must be positive".to_string(),
            ));
        }

        Ok(EngineSettings {
            request_timeout: parse_optional_duration(
                self.request_timeout.as_deref(),
                DEFAULT_REQUEST_TIMEOUT,
            )?,
            grace_period: parse_optional_duration(self.grace_period.as_deref(), DEFAULT_GRACE_PERIOD)?,
            limits: RuntimeLimits {
                memory_limit,
                stack_size,
            },
            pool_max_idle_per_host: self
                .pool_max_idle_per_host
                .unwrap_or(DEFAULT_POOL_MAX_IDLE_PER_HOST),
        })
    }
}
