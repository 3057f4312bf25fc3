//! The workflow engine.
//!
//! [`WorkflowEngine`] validates requests, persists workflows, admits them
//! through the [`ResourceManager`] and hands them to the
//! [`PipelineExecutor`]. Status queries never wait on execution.
//!
//! ```text
//! initialize ──> Pending ──start──> Running ──> Completed | Failed
//!                   │                  │
//!                   └─────cancel───────┴──> Cancelled
//! ```

use crate::adapters::AdapterRegistry;
use crate::cancellation::CancellationToken;
use crate::config::EngineConfig;
use crate::core::{
    now_utc, FailureCause, OwnerId, StageErrorInfo, StageStatus, Workflow, WorkflowId,
    WorkflowRequest, WorkflowStatus,
};
use crate::errors::{ErrorKind, RepositoryError, WorkflowError};
use crate::estimator::TimeEstimator;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::pipeline::{validate_request, PipelineExecutor};
use crate::progress::{ProgressSnapshot, ProgressStream, ProgressTracker};
use crate::repository::{InMemoryWorkflowRepository, StatusChange, WorkflowRepository};
use crate::resources::ResourceManager;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod engine_tests;

/// Top-level orchestrator for content-generation workflows.
pub struct WorkflowEngine {
    config: EngineConfig,
    registry: AdapterRegistry,
    repository: Arc<dyn WorkflowRepository>,
    resources: ResourceManager,
    estimator: Arc<TimeEstimator>,
    progress: Arc<ProgressTracker>,
    events: Arc<dyn EventSink>,
    executor: Arc<PipelineExecutor>,
    /// Cancellation tokens of workflows started by this engine and not yet
    /// finished, including those still waiting for a lease.
    active: Arc<DashMap<WorkflowId, Arc<CancellationToken>>>,
}

impl WorkflowEngine {
    /// Creates an engine.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Config`] if the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        registry: AdapterRegistry,
        repository: Arc<dyn WorkflowRepository>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, WorkflowError> {
        config.validate()?;
        Ok(Self::assemble(config, registry, repository, events))
    }

    /// Creates an engine with default limits, an in-memory repository and
    /// no event sink.
    #[must_use]
    pub fn in_memory(registry: AdapterRegistry) -> Self {
        Self::assemble(
            EngineConfig::default(),
            registry,
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(NoOpEventSink),
        )
    }

    fn assemble(
        config: EngineConfig,
        registry: AdapterRegistry,
        repository: Arc<dyn WorkflowRepository>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let estimator = Arc::new(TimeEstimator::new(config.estimator.clone()));
        let progress = Arc::new(ProgressTracker::new());
        let resources = ResourceManager::with_events(config.resources.clone(), events.clone());
        let executor = Arc::new(PipelineExecutor::new(
            config.executor.clone(),
            config.retry.clone(),
            registry.clone(),
            repository.clone(),
            resources.clone(),
            estimator.clone(),
            progress.clone(),
            events.clone(),
        ));
        Self {
            config,
            registry,
            repository,
            resources,
            estimator,
            progress,
            events,
            executor,
            active: Arc::new(DashMap::new()),
        }
    }

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The adapter registry.
    #[must_use]
    pub const fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// The admission controller.
    #[must_use]
    pub const fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    /// The duration estimator, shared with the executor.
    #[must_use]
    pub const fn estimator(&self) -> &Arc<TimeEstimator> {
        &self.estimator
    }

    /// Number of workflows started by this engine that have not finished.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Validates a request and persists it as a `Pending` workflow.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::Validation`] for an empty graph, duplicate or empty
    /// stage names, unknown stage types, missing or self dependencies, and
    /// dependency cycles.
    pub async fn initialize(
        &self,
        request: WorkflowRequest,
        owner_id: OwnerId,
    ) -> Result<Workflow, WorkflowError> {
        if let Err(err) = validate_request(&request, &self.registry) {
            warn!(owner_id = %owner_id, code = err.code, error = %err, "Rejected workflow request");
            return Err(err.into());
        }

        let workflow = Workflow::new(owner_id, request.project_id, &request.stages);
        self.repository.create(workflow.clone()).await?;
        self.progress.ensure(self.snapshot_of(&workflow));

        info!(
            workflow_id = %workflow.id,
            owner_id = %workflow.owner_id,
            stages = workflow.stages.len(),
            "Workflow created"
        );
        self.events.try_emit(
            names::WORKFLOW_CREATED,
            Some(json!({
                "workflow_id": workflow.id,
                "owner_id": workflow.owner_id,
                "stages": workflow.stages.len(),
            })),
        );
        Ok(workflow)
    }

    /// Admits a `Pending` workflow and hands it to the executor.
    ///
    /// Waits only for a lease, never for execution. Starting a workflow that
    /// is already running, or being started, is a no-op.
    ///
    /// # Errors
    ///
    /// - [`WorkflowError::NotFound`] for an unknown id
    /// - [`WorkflowError::InvalidState`] if the workflow is terminal, or was
    ///   cancelled while waiting for a lease
    /// - [`WorkflowError::ResourceExhausted`] if the admission queue is full
    pub async fn start(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let workflow = self.repository.get(id).await?;
        match workflow.status {
            WorkflowStatus::Pending => {}
            WorkflowStatus::Running => {
                debug!(workflow_id = %id, "Start ignored, workflow already running");
                return Ok(());
            }
            status => {
                return Err(WorkflowError::InvalidState {
                    id,
                    status,
                    action: "start",
                })
            }
        }

        let token = Arc::new(CancellationToken::new());
        match self.active.entry(id) {
            Entry::Occupied(_) => {
                debug!(workflow_id = %id, "Start ignored, workflow already being started");
                return Ok(());
            }
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let lease = tokio::select! {
            biased;
            () = token.cancelled() => {
                self.active.remove(&id);
                return Err(WorkflowError::InvalidState {
                    id,
                    status: WorkflowStatus::Cancelled,
                    action: "start",
                });
            }
            acquired = self.resources.acquire(&workflow.owner_id, id) => match acquired {
                Ok(lease) => lease,
                Err(err) => {
                    self.active.remove(&id);
                    warn!(workflow_id = %id, error = %err, "Admission rejected");
                    return Err(err.into());
                }
            },
        };

        let running = match self.mark_running(id).await {
            Ok(running) => running,
            Err(err) => {
                lease.release();
                self.active.remove(&id);
                return Err(err);
            }
        };

        info!(workflow_id = %id, owner_id = %running.owner_id, "Workflow started");
        self.events.try_emit(
            names::WORKFLOW_STARTED,
            Some(json!({ "workflow_id": id, "owner_id": running.owner_id })),
        );
        self.progress.publish(self.snapshot_of(&running));

        let executor = self.executor.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            let finished = executor.run(running, lease, token).await;
            active.remove(&finished.id);
        });
        Ok(())
    }

    /// Moves a workflow from `Pending` to `Running`, re-reading on version
    /// conflicts.
    async fn mark_running(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        let limit = self.config.executor.persist_retry_limit.max(1);
        let mut conflict = (0, 0);
        for _ in 0..limit {
            let current = self.repository.get(id).await?;
            if current.status != WorkflowStatus::Pending {
                return Err(WorkflowError::InvalidState {
                    id,
                    status: current.status,
                    action: "start",
                });
            }
            match self
                .repository
                .update_status(id, current.version, StatusChange::to(WorkflowStatus::Running))
                .await
            {
                Ok(running) => return Ok(running),
                Err(RepositoryError::VersionConflict {
                    expected, actual, ..
                }) => conflict = (expected, actual),
                Err(err) => return Err(err.into()),
            }
        }
        Err(WorkflowError::VersionConflict {
            id,
            expected: conflict.0,
            actual: conflict.1,
        })
    }

    /// Requests cancellation.
    ///
    /// A `Pending` workflow is cancelled at once. A `Running` one stops
    /// launching stages and becomes `Cancelled` after its in-flight stages
    /// settle. Terminal workflows are left alone.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::NotFound`] for an unknown id.
    pub async fn cancel(&self, id: WorkflowId) -> Result<(), WorkflowError> {
        let limit = self.config.executor.persist_retry_limit.max(1);
        for _ in 0..limit {
            let workflow = self.repository.get(id).await?;
            let token = self.active.get(&id).map(|entry| entry.value().clone());

            let reason = match workflow.status {
                status if status.is_terminal() => {
                    debug!(workflow_id = %id, status = %status, "Cancel ignored, workflow already finished");
                    return Ok(());
                }
                WorkflowStatus::Running => match token {
                    Some(token) => {
                        if token.cancel("cancelled by request") {
                            info!(workflow_id = %id, "Cancellation requested");
                        }
                        return Ok(());
                    }
                    // Nothing in this process is executing it.
                    None => "cancelled with no live execution",
                },
                _ => {
                    if let Some(token) = token {
                        token.cancel("cancelled before start");
                    }
                    "cancelled before start"
                }
            };

            let change = StatusChange::to(WorkflowStatus::Cancelled)
                .with_failure(FailureCause::workflow(ErrorKind::Cancelled, reason));
            match self.repository.update_status(id, workflow.version, change).await {
                Ok(cancelled) => {
                    info!(workflow_id = %id, reason, "Workflow cancelled");
                    self.progress.publish(self.snapshot_of(&cancelled));
                    self.events.try_emit(
                        names::WORKFLOW_CANCELLED,
                        Some(json!({
                            "workflow_id": id,
                            "owner_id": cancelled.owner_id,
                            "status": cancelled.status,
                            "failure": cancelled.failure,
                        })),
                    );
                    return Ok(());
                }
                Err(RepositoryError::VersionConflict { .. } | RepositoryError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Err(WorkflowError::Internal(format!(
            "cancel of {id} kept racing with concurrent writes"
        )))
    }

    /// Latest progress snapshot. Works in every status.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::NotFound`] for an unknown id.
    pub async fn get_status(&self, id: WorkflowId) -> Result<ProgressSnapshot, WorkflowError> {
        if let Some(snapshot) = self.progress.latest(id) {
            return Ok(snapshot);
        }
        let workflow = self.repository.get(id).await?;
        Ok(self.progress.ensure(self.snapshot_of(&workflow)))
    }

    /// Subscribes to a workflow's progress. The stream starts with the
    /// current snapshot and ends after the terminal one.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::NotFound`] for an unknown id.
    pub async fn subscribe(&self, id: WorkflowId) -> Result<ProgressStream, WorkflowError> {
        let current = self.get_status(id).await?;
        Ok(self.progress.subscribe(current))
    }

    /// Waits for the terminal snapshot.
    ///
    /// Never resolves for a `Pending` workflow that is neither started nor
    /// cancelled.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::NotFound`] for an unknown id.
    pub async fn wait(&self, id: WorkflowId) -> Result<ProgressSnapshot, WorkflowError> {
        self.subscribe(id)
            .await?
            .last()
            .await
            .ok_or_else(|| WorkflowError::Internal(format!("progress stream of {id} ended empty")))
    }

    /// The full persisted record.
    ///
    /// # Errors
    ///
    /// [`WorkflowError::NotFound`] for an unknown id.
    pub async fn get_workflow(&self, id: WorkflowId) -> Result<Workflow, WorkflowError> {
        Ok(self.repository.get(id).await?)
    }

    /// All workflows of an owner, oldest first.
    ///
    /// # Errors
    ///
    /// Repository failures.
    pub async fn list_workflows(&self, owner_id: &OwnerId) -> Result<Vec<Workflow>, WorkflowError> {
        Ok(self.repository.list_by_owner(owner_id).await?)
    }

    /// Fails workflows persisted as `Running` that nothing in this process
    /// executes, typically left over by a previous process. Their running
    /// stages are marked failed. Returns the recovered ids.
    ///
    /// # Errors
    ///
    /// Repository failures.
    pub async fn recover(&self) -> Result<Vec<WorkflowId>, WorkflowError> {
        let mut recovered = Vec::new();
        for mut workflow in self.repository.list_by_status(WorkflowStatus::Running).await? {
            if self.active.contains_key(&workflow.id) {
                continue;
            }
            let id = workflow.id;
            let interrupted = StageErrorInfo::new(ErrorKind::Interrupted, "execution interrupted");

            let running: Vec<_> = workflow
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Running)
                .cloned()
                .collect();
            for mut stage in running {
                stage.status = StageStatus::Failed;
                stage.completed_at = Some(now_utc());
                stage.last_error = Some(interrupted.clone());
                let name = stage.name.clone();
                workflow = self.repository.append_stage_result(id, &name, stage).await?;
            }

            let change = StatusChange::to(WorkflowStatus::Failed).with_failure(FailureCause::workflow(
                ErrorKind::Interrupted,
                "execution was interrupted before it finished",
            ));
            match self.repository.update_status(id, workflow.version, change).await {
                Ok(failed) => {
                    warn!(workflow_id = %id, "Recovered interrupted workflow");
                    self.progress.publish(self.snapshot_of(&failed));
                    self.events.try_emit(
                        names::WORKFLOW_FAILED,
                        Some(json!({
                            "workflow_id": id,
                            "owner_id": failed.owner_id,
                            "status": failed.status,
                            "failure": failed.failure,
                        })),
                    );
                    recovered.push(id);
                }
                Err(RepositoryError::VersionConflict { .. } | RepositoryError::InvalidTransition { .. }) => {
                    debug!(workflow_id = %id, "Workflow changed during recovery, skipped");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(recovered)
    }

    fn snapshot_of(&self, workflow: &Workflow) -> ProgressSnapshot {
        ProgressSnapshot::compute(workflow, &self.estimator, now_utc())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("registry", &self.registry)
            .field("resources", &self.resources)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}
