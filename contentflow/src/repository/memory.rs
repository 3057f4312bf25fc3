//! In-process repository.

use super::{StatusChange, WorkflowRepository};
use crate::core::{now_utc, OwnerId, StageRecord, Workflow, WorkflowId, WorkflowStatus};
use crate::errors::RepositoryError;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Repository backed by a concurrent map. State is lost with the process.
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: DashMap<WorkflowId, Workflow>,
}

impl InMemoryWorkflowRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored workflows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    fn collect_sorted(&self, filter: impl Fn(&Workflow) -> bool) -> Vec<Workflow> {
        let mut found: Vec<Workflow> = self
            .workflows
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by_key(|wf| (wf.created_at, wf.id));
        found
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create(&self, workflow: Workflow) -> Result<WorkflowId, RepositoryError> {
        let id = workflow.id;
        match self.workflows.entry(id) {
            Entry::Occupied(_) => Err(RepositoryError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(workflow);
                Ok(id)
            }
        }
    }

    async fn get(&self, id: WorkflowId) -> Result<Workflow, RepositoryError> {
        self.workflows
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(RepositoryError::NotFound(id))
    }

    async fn update_status(
        &self,
        id: WorkflowId,
        expected_version: u64,
        change: StatusChange,
    ) -> Result<Workflow, RepositoryError> {
        let mut entry = self.workflows.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        let workflow = entry.value_mut();

        if workflow.version != expected_version {
            return Err(RepositoryError::VersionConflict {
                id,
                expected: expected_version,
                actual: workflow.version,
            });
        }
        if !workflow.status.can_transition_to(change.status) {
            return Err(RepositoryError::InvalidTransition {
                id,
                from: workflow.status,
                to: change.status,
            });
        }

        let now = now_utc();
        if change.status == WorkflowStatus::Running {
            workflow.started_at = Some(now);
        }
        workflow.status = change.status;
        if change.failure.is_some() {
            workflow.failure = change.failure;
        }
        if !change.artifacts.is_empty() {
            workflow.artifacts = change.artifacts;
        }
        workflow.version += 1;
        workflow.updated_at = now;
        Ok(workflow.clone())
    }

    async fn append_stage_result(
        &self,
        id: WorkflowId,
        stage_name: &str,
        record: StageRecord,
    ) -> Result<Workflow, RepositoryError> {
        let mut entry = self.workflows.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        let workflow = entry.value_mut();
        let immutable = || RepositoryError::Immutable {
            id,
            stage: stage_name.to_string(),
        };

        if workflow.is_terminal() {
            return Err(immutable());
        }
        let stage = workflow
            .stage_mut(stage_name)
            .ok_or_else(|| RepositoryError::StageNotFound {
                id,
                stage: stage_name.to_string(),
            })?;
        if stage.status.is_terminal() || record.attempts < stage.attempts {
            return Err(immutable());
        }

        // Name, type, dependencies and params are fixed at creation.
        stage.status = record.status;
        stage.attempts = record.attempts;
        stage.started_at = record.started_at;
        stage.completed_at = record.completed_at;
        stage.output = record.output;
        stage.last_error = record.last_error;

        workflow.version += 1;
        workflow.updated_at = now_utc();
        Ok(workflow.clone())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Workflow>, RepositoryError> {
        Ok(self.collect_sorted(|wf| &wf.owner_id == owner))
    }

    async fn list_by_status(&self, status: WorkflowStatus) -> Result<Vec<Workflow>, RepositoryError> {
        Ok(self.collect_sorted(|wf| wf.status == status))
    }
}
