//! Admission control and owner quotas.

mod lease;
mod manager;

pub use lease::ResourceLease;
pub use manager::ResourceManager;

use crate::core::StageType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capacity and quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Workflows allowed to run at once across all owners.
    pub max_concurrent_workflows: usize,
    /// Workflows one owner may run at once.
    pub max_per_owner: usize,
    /// Waiters allowed in the admission queue. `None` is unbounded.
    pub max_queue_depth: Option<usize>,
    /// Quota units per owner. `None` disables quota accounting.
    pub owner_quota: Option<u64>,
    /// Quota cost of one stage start, per stage type. Missing types cost 1.
    pub stage_costs: HashMap<StageType, u64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: 8,
            max_per_owner: 2,
            max_queue_depth: None,
            owner_quota: None,
            stage_costs: HashMap::new(),
        }
    }
}

impl ResourceConfig {
    /// Sets the global and per-owner concurrency limits.
    #[must_use]
    pub const fn with_limits(mut self, max_concurrent_workflows: usize, max_per_owner: usize) -> Self {
        self.max_concurrent_workflows = max_concurrent_workflows;
        self.max_per_owner = max_per_owner;
        self
    }

    /// Bounds the admission queue.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }

    /// Enables per-owner quota accounting.
    #[must_use]
    pub const fn with_owner_quota(mut self, quota: u64) -> Self {
        self.owner_quota = Some(quota);
        self
    }

    /// Sets the quota cost of one stage type.
    #[must_use]
    pub fn with_stage_cost(mut self, stage_type: StageType, cost: u64) -> Self {
        self.stage_costs.insert(stage_type, cost);
        self
    }

    /// Quota cost of starting one stage of this type.
    #[must_use]
    pub fn cost_of(&self, stage_type: StageType) -> u64 {
        self.stage_costs.get(&stage_type).copied().unwrap_or(1)
    }
}
