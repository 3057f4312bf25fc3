//! Engine configuration.
//!
//! Every section has defaults, so a config file only needs the values it
//! overrides:
//!
//! ```json
//! {
//!   "resources": { "max_concurrent_workflows": 16, "max_per_owner": 4 },
//!   "retry": { "default": { "max_attempts": 5 } },
//!   "logging": { "filter": "contentflow=debug", "json": true }
//! }
//! ```

use crate::errors::ConfigError;
use crate::estimator::EstimatorConfig;
use crate::observability::LoggingConfig;
use crate::pipeline::{ExecutorConfig, RetryConfig, RetryPolicy};
use crate::resources::ResourceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for a [`crate::engine::WorkflowEngine`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Admission and quota limits.
    pub resources: ResourceConfig,
    /// Per-workflow execution settings.
    pub executor: ExecutorConfig,
    /// Retry policies.
    pub retry: RetryConfig,
    /// Duration estimation.
    pub estimator: EstimatorConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document and validates it.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Sets the resource limits.
    #[must_use]
    pub fn with_resources(mut self, resources: ResourceConfig) -> Self {
        self.resources = resources;
        self
    }

    /// Sets the executor settings.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the estimator configuration.
    #[must_use]
    pub fn with_estimator(mut self, estimator: EstimatorConfig) -> Self {
        self.estimator = estimator;
        self
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.resources;
        if r.max_concurrent_workflows == 0 {
            return Err(invalid("resources.max_concurrent_workflows must be at least 1"));
        }
        if r.max_per_owner == 0 {
            return Err(invalid("resources.max_per_owner must be at least 1"));
        }
        if self.executor.max_parallel_stages == 0 {
            return Err(invalid("executor.max_parallel_stages must be at least 1"));
        }
        if self.executor.persist_retry_limit == 0 {
            return Err(invalid("executor.persist_retry_limit must be at least 1"));
        }

        validate_policy("retry.default", &self.retry.default)?;
        for (stage_type, policy) in &self.retry.per_stage {
            validate_policy(&format!("retry.per_stage.{stage_type}"), policy)?;
        }

        let smoothing = self.estimator.smoothing;
        if !(smoothing > 0.0 && smoothing <= 1.0) {
            return Err(invalid("estimator.smoothing must be in (0, 1]"));
        }
        Ok(())
    }
}

/// Longest backoff a retry policy may ask for (one day).
pub const MAX_RETRY_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

fn validate_policy(path: &str, policy: &RetryPolicy) -> Result<(), ConfigError> {
    if policy.max_attempts == 0 {
        return Err(invalid(format!("{path}.max_attempts must be at least 1")));
    }
    if !(0.0..1.0).contains(&policy.jitter) {
        return Err(invalid(format!("{path}.jitter must be in [0, 1)")));
    }
    if !(policy.multiplier.is_finite() && policy.multiplier >= 1.0) {
        return Err(invalid(format!("{path}.multiplier must be a finite number of at least 1")));
    }
    if policy.max_delay_ms > MAX_RETRY_DELAY_MS {
        return Err(invalid(format!(
            "{path}.max_delay_ms must be at most {MAX_RETRY_DELAY_MS}"
        )));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}
