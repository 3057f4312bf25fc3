//! Durable workflow state.
//!
//! The engine talks to storage only through [`WorkflowRepository`]. Status
//! changes are compare-and-set on the workflow version; callers that lose a
//! race re-read and retry.

mod memory;

pub use memory::InMemoryWorkflowRepository;

use crate::core::{FailureCause, OwnerId, StageRecord, Workflow, WorkflowId, WorkflowStatus};
use crate::errors::RepositoryError;
use async_trait::async_trait;

/// A requested workflow status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    /// Target status.
    pub status: WorkflowStatus,
    /// Diagnostic payload for `Failed` and `Cancelled`.
    pub failure: Option<FailureCause>,
    /// Final artifacts, for `Completed`.
    pub artifacts: Vec<String>,
}

impl StatusChange {
    /// A change to `status` with no payload.
    #[must_use]
    pub const fn to(status: WorkflowStatus) -> Self {
        Self {
            status,
            failure: None,
            artifacts: Vec::new(),
        }
    }

    /// Attaches a failure cause.
    #[must_use]
    pub fn with_failure(mut self, failure: FailureCause) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Attaches the final artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

/// Storage for workflow records.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Stores a new workflow.
    async fn create(&self, workflow: Workflow) -> Result<WorkflowId, RepositoryError>;

    /// Loads a workflow.
    async fn get(&self, id: WorkflowId) -> Result<Workflow, RepositoryError>;

    /// Moves a workflow to a new status if its version still equals
    /// `expected_version` and the transition is allowed. Returns the
    /// updated record.
    async fn update_status(
        &self,
        id: WorkflowId,
        expected_version: u64,
        change: StatusChange,
    ) -> Result<Workflow, RepositoryError>;

    /// Replaces the mutable part of one stage record and bumps the version.
    ///
    /// Rejected once the stage or the workflow is terminal, or when the
    /// attempt count would decrease.
    async fn append_stage_result(
        &self,
        id: WorkflowId,
        stage_name: &str,
        record: StageRecord,
    ) -> Result<Workflow, RepositoryError>;

    /// All workflows of one owner, oldest first.
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Workflow>, RepositoryError>;

    /// All workflows currently in `status`, oldest first.
    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, RepositoryError>;
}
