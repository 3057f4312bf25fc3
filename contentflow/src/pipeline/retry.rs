//! Shared retry policy: capped attempts with exponential backoff and jitter.

use crate::core::StageType;
use crate::errors::StageError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Backoff parameters for one stage type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Relative jitter; 0.2 spreads each delay over ±20 %.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the multiplier.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the relative jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows attempt number `attempt` (1-based),
    /// without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Delay before the retry that follows attempt number `attempt`, with jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        // Float to int casts saturate, so a huge base cannot overflow.
        Duration::from_millis((base.as_millis() as f64 * factor) as u64)
    }

    /// Decides what to do after attempt number `attempt` failed with `error`.
    #[must_use]
    pub fn decide(&self, attempt: u32, error: &StageError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::NotRetryable;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay(attempt))
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more attempts left.
    GiveUp,
    /// The error is not retryable.
    NotRetryable,
}

/// Default policy plus per-stage-type overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Policy for stage types without an override.
    pub default: RetryPolicy,
    /// Overrides keyed by stage type.
    pub per_stage: HashMap<StageType, RetryPolicy>,
}

impl RetryConfig {
    /// Creates a config using `policy` for every stage type.
    #[must_use]
    pub fn uniform(policy: RetryPolicy) -> Self {
        Self {
            default: policy,
            per_stage: HashMap::new(),
        }
    }

    /// Overrides the policy for one stage type.
    #[must_use]
    pub fn with_stage_policy(mut self, stage_type: StageType, policy: RetryPolicy) -> Self {
        self.per_stage.insert(stage_type, policy);
        self
    }

    /// Returns the effective policy for a stage type.
    #[must_use]
    pub fn policy_for(&self, stage_type: StageType) -> &RetryPolicy {
        self.per_stage.get(&stage_type).unwrap_or(&self.default)
    }
}
