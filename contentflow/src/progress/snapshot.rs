//! Progress snapshot computation.

use crate::core::{FailureCause, StageStatus, Timestamp, Workflow, WorkflowId, WorkflowStatus};
use crate::estimator::{elapsed_since, TimeEstimator};
use serde::{Deserialize, Serialize};

/// Credit cap for a running stage that has used up its expected time.
const RUNNING_CREDIT_CAP: f64 = 0.95;

/// Point-in-time progress of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// The workflow.
    pub workflow_id: WorkflowId,
    /// Workflow status when the snapshot was taken.
    pub status: WorkflowStatus,
    /// Completion in percent, 0 to 100.
    pub percent_complete: f64,
    /// Stages currently running.
    pub current_stages: Vec<String>,
    /// Stages that have succeeded.
    pub completed_stages: Vec<String>,
    /// Estimated time to completion.
    pub estimated_remaining_ms: u64,
    /// When the snapshot was taken.
    pub timestamp: Timestamp,
    /// Failure diagnostics on `Failed` and `Cancelled`.
    pub failure: Option<FailureCause>,
    /// Position in the workflow's snapshot sequence, assigned by the tracker.
    #[serde(default)]
    pub sequence: u64,
}

impl ProgressSnapshot {
    /// Computes a snapshot from a workflow record.
    ///
    /// Each stage weighs its expected duration. Succeeded stages count fully,
    /// running stages count for the fraction of expected time already spent.
    #[must_use]
    pub fn compute(workflow: &Workflow, estimator: &TimeEstimator, now: Timestamp) -> Self {
        let mut total = 0.0;
        let mut done = 0.0;
        let mut current_stages = Vec::new();
        let mut completed_stages = Vec::new();

        for stage in &workflow.stages {
            let weight = estimator.expected(stage.stage_type).as_secs_f64().max(0.001);
            total += weight;
            match stage.status {
                StageStatus::Succeeded => {
                    done += weight;
                    completed_stages.push(stage.name.clone());
                }
                StageStatus::Running => {
                    let elapsed = elapsed_since(stage.started_at, now).as_secs_f64();
                    done += weight * (elapsed / weight).min(RUNNING_CREDIT_CAP);
                    current_stages.push(stage.name.clone());
                }
                StageStatus::Pending | StageStatus::Failed => {}
            }
        }

        let percent_complete = if workflow.status == WorkflowStatus::Completed {
            100.0
        } else if total > 0.0 {
            (done / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let remaining = estimator.estimate(workflow, now);
        Self {
            workflow_id: workflow.id,
            status: workflow.status,
            percent_complete,
            current_stages,
            completed_stages,
            estimated_remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
            timestamp: now,
            failure: workflow.failure.clone(),
            sequence: 0,
        }
    }

    /// Returns true if this is the workflow's final snapshot.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
