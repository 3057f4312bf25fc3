//! Persisted workflow and stage records.

use super::{now_utc, OwnerId, StageRequest, StageStatus, StageType, Timestamp, WorkflowId, WorkflowStatus};
use crate::errors::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Output reference produced by a stage adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutput {
    /// Opaque reference to the generated artifact (URL, storage key, ...).
    pub artifact: String,
    /// Adapter-specific metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl StageOutput {
    /// Creates an output with no metadata.
    #[must_use]
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Last error recorded on a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageErrorInfo {
    /// Classification of the error.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl StageErrorInfo {
    /// Creates error info.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Diagnostic payload carried by `Failed` and `Cancelled` workflows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    /// The failing stage, if the cause is stage-specific.
    pub stage: Option<String>,
    /// Classification of the error.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl FailureCause {
    /// A cause attributed to a stage.
    #[must_use]
    pub fn stage(stage: impl Into<String>, error: &StageErrorInfo) -> Self {
        Self {
            stage: Some(stage.into()),
            kind: error.kind,
            message: error.message.clone(),
        }
    }

    /// A workflow-wide cause.
    #[must_use]
    pub fn workflow(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            stage: None,
            kind,
            message: message.into(),
        }
    }
}

/// One stage of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Unique name within the workflow.
    pub name: String,
    /// Capability invoked by this stage.
    pub stage_type: StageType,
    /// Current status.
    pub status: StageStatus,
    /// Number of attempts started so far.
    pub attempts: u32,
    /// When the first attempt started.
    pub started_at: Option<Timestamp>,
    /// When the stage reached a terminal status.
    pub completed_at: Option<Timestamp>,
    /// Output, once succeeded.
    pub output: Option<StageOutput>,
    /// Most recent error.
    pub last_error: Option<StageErrorInfo>,
    /// Predecessors that must succeed before this stage starts.
    pub depends_on: BTreeSet<String>,
    /// Parameters forwarded to the adapter.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageRecord {
    /// Creates a pending record from a request.
    #[must_use]
    pub fn from_request(request: &StageRequest) -> Self {
        Self {
            name: request.name.clone(),
            stage_type: request.stage_type,
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            output: None,
            last_error: None,
            depends_on: request.depends_on.iter().cloned().collect(),
            params: request.params.clone(),
        }
    }

    /// Returns true if the stage has no predecessors.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }
}

/// A full multi-stage job instance for one project request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Identity.
    pub id: WorkflowId,
    /// Owner the workflow is accounted to.
    pub owner_id: OwnerId,
    /// Project the content belongs to.
    pub project_id: Option<String>,
    /// Lifecycle status.
    pub status: WorkflowStatus,
    /// Stages in declaration order.
    pub stages: Vec<StageRecord>,
    /// Optimistic concurrency counter; bumped on every persisted mutation.
    pub version: u64,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last persisted mutation.
    pub updated_at: Timestamp,
    /// When the workflow entered `Running`.
    pub started_at: Option<Timestamp>,
    /// Final artifact references, set on completion.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Diagnostic payload for `Failed` and `Cancelled`.
    pub failure: Option<FailureCause>,
}

impl Workflow {
    /// Creates a pending workflow with all stages pending.
    #[must_use]
    pub fn new(owner_id: OwnerId, project_id: Option<String>, stages: &[StageRequest]) -> Self {
        let now = now_utc();
        Self {
            id: WorkflowId::generate(),
            owner_id,
            project_id,
            status: WorkflowStatus::Pending,
            stages: stages.iter().map(StageRecord::from_request).collect(),
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            artifacts: Vec::new(),
            failure: None,
        }
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Looks up a stage by name for mutation.
    pub fn stage_mut(&mut self, name: &str) -> Option<&mut StageRecord> {
        self.stages.iter_mut().find(|s| s.name == name)
    }

    /// Returns true if the workflow can no longer change.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stages nobody depends on, in declaration order.
    #[must_use]
    pub fn sink_stages(&self) -> Vec<&StageRecord> {
        self.stages
            .iter()
            .filter(|candidate| {
                !self
                    .stages
                    .iter()
                    .any(|other| other.depends_on.contains(&candidate.name))
            })
            .collect()
    }

    /// Returns true if every stage succeeded.
    #[must_use]
    pub fn all_stages_succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status == StageStatus::Succeeded)
    }
}
