//! Completion-time estimation.
//!
//! Keeps an exponentially weighted moving average of observed durations per
//! stage type and sums expected remaining work along the critical path of a
//! workflow's dependency graph.

use crate::core::{StageRecord, StageStatus, StageType, Timestamp, Workflow};
use crate::pipeline::topological_order;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Estimator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// EWMA weight of the newest sample, in (0, 1].
    pub smoothing: f64,
    /// Cold-start estimate for stage types without history.
    pub default_estimate_ms: u64,
    /// Cold-start estimates per stage type.
    pub per_stage_defaults: HashMap<StageType, u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            smoothing: 0.3,
            default_estimate_ms: 30_000,
            per_stage_defaults: HashMap::new(),
        }
    }
}

impl EstimatorConfig {
    /// Sets the cold-start estimate for one stage type.
    #[must_use]
    pub fn with_stage_default(mut self, stage_type: StageType, estimate: Duration) -> Self {
        self.per_stage_defaults
            .insert(stage_type, u64::try_from(estimate.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct DurationStats {
    ewma_ms: f64,
    samples: u64,
}

/// Rolling per-stage-type duration statistics.
#[derive(Debug, Default)]
pub struct TimeEstimator {
    config: EstimatorConfig,
    stats: RwLock<HashMap<StageType, DurationStats>>,
}

impl TimeEstimator {
    /// Creates an estimator with no history.
    #[must_use]
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            stats: RwLock::new(HashMap::new()),
        }
    }

    /// Records an observed stage duration.
    pub fn record(&self, stage_type: StageType, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let alpha = self.config.smoothing;
        let mut stats = self.stats.write();
        stats
            .entry(stage_type)
            .and_modify(|s| {
                s.ewma_ms = alpha.mul_add(sample, (1.0 - alpha) * s.ewma_ms);
                s.samples += 1;
            })
            .or_insert(DurationStats {
                ewma_ms: sample,
                samples: 1,
            });
    }

    /// Replaces the history of a stage type with a single average.
    pub fn seed(&self, stage_type: StageType, average: Duration) {
        self.stats.write().insert(
            stage_type,
            DurationStats {
                ewma_ms: average.as_secs_f64() * 1000.0,
                samples: 1,
            },
        );
    }

    /// Number of samples observed for a stage type.
    #[must_use]
    pub fn samples(&self, stage_type: StageType) -> u64 {
        self.stats.read().get(&stage_type).map_or(0, |s| s.samples)
    }

    /// Expected duration of one stage of this type.
    #[must_use]
    pub fn expected(&self, stage_type: StageType) -> Duration {
        if let Some(stats) = self.stats.read().get(&stage_type) {
            return Duration::from_secs_f64(stats.ewma_ms.max(0.0) / 1000.0);
        }
        let fallback = self
            .config
            .per_stage_defaults
            .get(&stage_type)
            .copied()
            .unwrap_or(self.config.default_estimate_ms);
        Duration::from_millis(fallback)
    }

    /// Work left in one stage at `now`.
    #[must_use]
    pub fn stage_remaining(&self, stage: &StageRecord, now: Timestamp) -> Duration {
        match stage.status {
            StageStatus::Succeeded => Duration::ZERO,
            StageStatus::Running => {
                let expected = self.expected(stage.stage_type);
                expected.saturating_sub(elapsed_since(stage.started_at, now))
            }
            StageStatus::Pending | StageStatus::Failed => self.expected(stage.stage_type),
        }
    }

    /// Estimated time until the workflow completes.
    ///
    /// This is the longest chain of remaining stage work through the
    /// dependency graph; independent branches overlap.
    #[must_use]
    pub fn estimate(&self, workflow: &Workflow, now: Timestamp) -> Duration {
        if workflow.is_terminal() {
            return Duration::ZERO;
        }

        let mut finish: HashMap<&str, Duration> = HashMap::with_capacity(workflow.stages.len());
        let mut longest = Duration::ZERO;
        for stage in topological_order(&workflow.stages) {
            let ready_at = stage
                .depends_on
                .iter()
                .filter_map(|dep| finish.get(dep.as_str()).copied())
                .max()
                .unwrap_or(Duration::ZERO);
            let done_at = ready_at + self.stage_remaining(stage, now);
            longest = longest.max(done_at);
            finish.insert(stage.name.as_str(), done_at);
        }
        longest
    }
}

/// Wall-clock time since `started_at`, zero if unknown or in the future.
pub(crate) fn elapsed_since(started_at: Option<Timestamp>, now: Timestamp) -> Duration {
    started_at
        .and_then(|start| (now - start).to_std().ok())
        .unwrap_or(Duration::ZERO)
}
