//! Workflow execution.
//!
//! One coordinator per workflow owns the record and is the only writer of
//! stage results. Each launched stage runs as its own task with its retry
//! loop; it reports attempt starts and retries over a channel and hands its
//! final outcome back through the join handle. Stages start as soon as all
//! of their dependencies succeeded, bounded by `max_parallel_stages`.
//!
//! After the first terminal stage failure or a cancellation no new stage is
//! launched. Stages already running settle and are recorded, then the
//! terminal status is persisted and the lease is released.

use super::RetryConfig;
use super::RetryDecision;
use crate::adapters::{AdapterRegistry, StageAdapter, StageInput, UpstreamOutput};
use crate::cancellation::CancellationToken;
use crate::core::{
    now_utc, FailureCause, OwnerId, StageErrorInfo, StageOutput, StageRecord, StageStatus,
    Timestamp, Workflow, WorkflowId, WorkflowStatus,
};
use crate::errors::{ErrorKind, RepositoryError, StageError, WorkflowError};
use crate::estimator::TimeEstimator;
use crate::events::{names, EventSink};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::repository::{StatusChange, WorkflowRepository};
use crate::resources::{ResourceLease, ResourceManager};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Per-workflow execution limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Stages of one workflow allowed to run at once.
    pub max_parallel_stages: usize,
    /// Upper bound for a single adapter call.
    pub stage_timeout_ms: Option<u64>,
    /// Budget for the whole workflow, measured from the start of execution.
    /// A timeout after the budget is spent is not retried.
    pub workflow_timeout_ms: Option<u64>,
    /// Attempts at a status write that keeps hitting version conflicts.
    pub persist_retry_limit: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel_stages: 4,
            stage_timeout_ms: None,
            workflow_timeout_ms: None,
            persist_retry_limit: 5,
        }
    }
}

impl ExecutorConfig {
    /// Sets the stage parallelism.
    #[must_use]
    pub const fn with_max_parallel_stages(mut self, max: usize) -> Self {
        self.max_parallel_stages = max;
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = Some(duration_ms(timeout));
        self
    }

    /// Sets the workflow budget.
    #[must_use]
    pub const fn with_workflow_timeout(mut self, timeout: Duration) -> Self {
        self.workflow_timeout_ms = Some(duration_ms(timeout));
        self
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

/// Progress reports from stage tasks to the coordinator.
#[derive(Debug)]
enum StageEvent {
    AttemptStarted {
        stage: String,
        attempt: u32,
        at: Timestamp,
    },
    Retrying {
        stage: String,
        attempt: u32,
        error: StageErrorInfo,
        delay: Duration,
    },
}

/// Final result of one stage task.
#[derive(Debug)]
struct StageOutcome {
    stage: String,
    attempts: u32,
    result: Result<StageOutput, StageErrorInfo>,
}

impl StageOutcome {
    /// Cancelled before its first attempt began.
    fn never_started(&self) -> bool {
        self.attempts == 0
            && matches!(&self.result, Err(info) if info.kind == ErrorKind::Cancelled)
    }
}

/// Everything a stage task needs.
struct StageRun {
    workflow_id: WorkflowId,
    owner_id: OwnerId,
    stage: StageRecord,
    upstream: Vec<UpstreamOutput>,
    lease: Arc<ResourceLease>,
    cancel: Arc<CancellationToken>,
    deadline: Option<Instant>,
    reports: mpsc::UnboundedSender<StageEvent>,
}

/// Why the coordinator stopped launching stages.
#[derive(Debug, Clone)]
enum Halt {
    Failed(FailureCause),
    Cancelled(FailureCause),
}

/// Drives workflow stage graphs through their adapters.
pub struct PipelineExecutor {
    config: ExecutorConfig,
    retry: RetryConfig,
    registry: AdapterRegistry,
    repository: Arc<dyn WorkflowRepository>,
    resources: ResourceManager,
    estimator: Arc<TimeEstimator>,
    progress: Arc<ProgressTracker>,
    events: Arc<dyn EventSink>,
}

impl PipelineExecutor {
    /// Creates an executor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutorConfig,
        retry: RetryConfig,
        registry: AdapterRegistry,
        repository: Arc<dyn WorkflowRepository>,
        resources: ResourceManager,
        estimator: Arc<TimeEstimator>,
        progress: Arc<ProgressTracker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            retry,
            registry,
            repository,
            resources,
            estimator,
            progress,
            events,
        }
    }

    /// The execution limits.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs a `Running` workflow to a terminal status and returns the final
    /// record. The lease is released before the terminal snapshot is
    /// published.
    pub async fn run(
        self: Arc<Self>,
        workflow: Workflow,
        lease: ResourceLease,
        cancel: Arc<CancellationToken>,
    ) -> Workflow {
        let span = info_span!(
            "workflow",
            workflow_id = %workflow.id,
            owner_id = %workflow.owner_id,
        );
        self.drive(workflow, Arc::new(lease), cancel).instrument(span).await
    }

    async fn drive(
        self: Arc<Self>,
        mut wf: Workflow,
        lease: Arc<ResourceLease>,
        cancel: Arc<CancellationToken>,
    ) -> Workflow {
        let started = Instant::now();
        let deadline = self
            .config
            .workflow_timeout_ms
            .and_then(|ms| started.checked_add(Duration::from_millis(ms)));
        let max_parallel = self.config.max_parallel_stages.max(1);

        let mut waiting_on: HashMap<String, usize> = wf
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Pending)
            .map(|s| {
                let unmet = s
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        wf.stage(dep).map_or(true, |d| d.status != StageStatus::Succeeded)
                    })
                    .count();
                (s.name.clone(), unmet)
            })
            .collect();
        let mut ready: VecDeque<String> = wf
            .stages
            .iter()
            .filter(|s| waiting_on.get(&s.name) == Some(&0))
            .map(|s| s.name.clone())
            .collect();
        waiting_on.retain(|_, unmet| *unmet > 0);

        let (reports, mut inbox) = mpsc::unbounded_channel();
        let mut running = FuturesUnordered::new();
        let mut halt: Option<Halt> = None;

        info!(stages = wf.stages.len(), "Executing workflow");
        self.publish(&wf);

        loop {
            while halt.is_none() && !cancel.is_cancelled() && running.len() < max_parallel {
                let Some(name) = ready.pop_front() else { break };
                let Some(stage) = wf.stage(&name).cloned() else { continue };
                let run = StageRun {
                    workflow_id: wf.id,
                    owner_id: wf.owner_id.clone(),
                    upstream: upstream_of(&wf, &stage),
                    stage,
                    lease: lease.clone(),
                    cancel: cancel.clone(),
                    deadline,
                    reports: reports.clone(),
                };
                let span = info_span!("stage", stage = %name);
                let handle = tokio::spawn(self.clone().run_stage(run).instrument(span));
                running.push(handle.map(move |joined| (name, joined)));
            }

            if running.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some(event) = inbox.recv() => self.on_stage_event(&mut wf, event).await,
                Some((name, joined)) = running.next() => {
                    let outcome = joined.unwrap_or_else(|err| StageOutcome {
                        attempts: wf.stage(&name).map_or(0, |s| s.attempts),
                        stage: name.clone(),
                        result: Err(StageErrorInfo::new(
                            ErrorKind::Permanent,
                            format!("stage task aborted: {err}"),
                        )),
                    });
                    if let Some(cause) = self.on_stage_outcome(&mut wf, outcome).await {
                        if halt.is_none() {
                            // A stage aborted by the token may settle before the cancel branch runs.
                            halt = Some(if cancel.is_cancelled() {
                                Halt::Cancelled(cancel_cause(&cancel))
                            } else {
                                Halt::Failed(cause)
                            });
                        }
                    } else if halt.is_none() {
                        release_dependents(&wf, &name, &mut waiting_on, &mut ready);
                    }
                    self.publish(&wf);
                }
                () = cancel.cancelled(), if halt.is_none() => {
                    info!(reason = ?cancel.reason(), in_flight = running.len(), "Cancellation requested");
                    halt = Some(Halt::Cancelled(cancel_cause(&cancel)));
                }
            }
        }

        // Events sent by tasks that finished in the same poll as the last join.
        while let Ok(event) = inbox.try_recv() {
            self.on_stage_event(&mut wf, event).await;
        }

        if halt.is_none() && cancel.is_cancelled() {
            halt = Some(Halt::Cancelled(cancel_cause(&cancel)));
        }

        let change = match halt {
            Some(Halt::Failed(cause)) => StatusChange::to(WorkflowStatus::Failed).with_failure(cause),
            Some(Halt::Cancelled(cause)) => {
                StatusChange::to(WorkflowStatus::Cancelled).with_failure(cause)
            }
            None if wf.all_stages_succeeded() => {
                let artifacts = wf
                    .sink_stages()
                    .iter()
                    .filter_map(|s| s.output.as_ref().map(|o| o.artifact.clone()))
                    .collect();
                StatusChange::to(WorkflowStatus::Completed).with_artifacts(artifacts)
            }
            None => StatusChange::to(WorkflowStatus::Failed).with_failure(FailureCause::workflow(
                ErrorKind::Permanent,
                "stage graph stalled with unfinished stages",
            )),
        };

        self.finalize(&mut wf, change).await;
        lease.release();
        self.publish(&wf);
        self.announce_terminal(&wf, started.elapsed());
        wf
    }

    async fn run_stage(self: Arc<Self>, run: StageRun) -> StageOutcome {
        let stage_type = run.stage.stage_type;
        let name = run.stage.name.clone();
        let mut attempt = run.stage.attempts;
        let finish = |attempts: u32, result: Result<StageOutput, StageErrorInfo>| StageOutcome {
            stage: name.clone(),
            attempts,
            result,
        };

        let Some(adapter) = self.registry.get(stage_type) else {
            return finish(
                attempt,
                Err(StageErrorInfo::new(
                    ErrorKind::Permanent,
                    format!("no adapter registered for stage type '{stage_type}'"),
                )),
            );
        };
        let policy = self.retry.policy_for(stage_type).clone();

        if run.cancel.is_cancelled() {
            return finish(attempt, Err(cancelled_info("cancelled before attempt")));
        }
        // Quota is charged per stage start; retries are free.
        if let Err(err) = self.resources.charge(&run.lease, stage_type) {
            warn!(error = %err, "Stage quota charge rejected");
            return finish(
                attempt,
                Err(StageErrorInfo::new(ErrorKind::ResourceExhausted, err.to_string())),
            );
        }

        loop {
            if run.cancel.is_cancelled() {
                return finish(attempt, Err(cancelled_info("cancelled before attempt")));
            }

            attempt += 1;
            let _ = run.reports.send(StageEvent::AttemptStarted {
                stage: name.clone(),
                attempt,
                at: now_utc(),
            });

            let input = StageInput {
                workflow_id: run.workflow_id,
                owner_id: run.owner_id.clone(),
                stage_name: name.clone(),
                stage_type,
                attempt,
                params: run.stage.params.clone(),
                upstream: run.upstream.clone(),
                cancel: run.cancel.clone(),
            };
            let call_started = Instant::now();
            let error = match self.call_adapter(adapter.as_ref(), input, run.deadline).await {
                Ok(output) => {
                    let took = call_started.elapsed();
                    self.estimator.record(stage_type, took);
                    debug!(attempt, duration_ms = duration_ms(took), "Stage attempt succeeded");
                    return finish(attempt, Ok(output));
                }
                Err(error) => error,
            };

            let budget_spent = run.deadline.is_some_and(|d| Instant::now() >= d);
            if budget_spent && error.kind() == ErrorKind::Timeout {
                return finish(
                    attempt,
                    Err(StageErrorInfo::new(
                        ErrorKind::Timeout,
                        format!("workflow time budget exhausted: {}", error.message()),
                    )),
                );
            }

            let info = StageErrorInfo::new(error.kind(), error.message());
            match policy.decide(attempt, &error) {
                RetryDecision::Retry(delay) => {
                    debug!(attempt, delay_ms = duration_ms(delay), error = %error, "Retrying stage");
                    let _ = run.reports.send(StageEvent::Retrying {
                        stage: name.clone(),
                        attempt,
                        error: info,
                        delay,
                    });
                    if !run.cancel.sleep(delay).await {
                        return finish(attempt, Err(cancelled_info("cancelled during backoff")));
                    }
                }
                RetryDecision::GiveUp => {
                    return finish(
                        attempt,
                        Err(StageErrorInfo::new(
                            info.kind,
                            format!("gave up after {attempt} attempts: {}", info.message),
                        )),
                    );
                }
                RetryDecision::NotRetryable => return finish(attempt, Err(info)),
            }
        }
    }

    async fn call_adapter(
        &self,
        adapter: &dyn StageAdapter,
        input: StageInput,
        deadline: Option<Instant>,
    ) -> Result<StageOutput, StageError> {
        let per_call = self.config.stage_timeout_ms.map(Duration::from_millis);
        let budget = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let limit = match (per_call, budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        match limit {
            Some(limit) => tokio::time::timeout(limit, adapter.execute(input))
                .await
                .unwrap_or_else(|_| {
                    Err(StageError::timeout(format!(
                        "no response within {} ms",
                        limit.as_millis()
                    )))
                }),
            None => adapter.execute(input).await,
        }
    }

    async fn on_stage_event(&self, wf: &mut Workflow, event: StageEvent) {
        match event {
            StageEvent::AttemptStarted { stage, attempt, at } => {
                let Some(mut record) = wf.stage(&stage).cloned() else { return };
                record.status = StageStatus::Running;
                record.attempts = attempt;
                record.started_at.get_or_insert(at);
                self.persist_stage(wf, record).await;
                self.events.try_emit(
                    names::STAGE_STARTED,
                    Some(json!({ "workflow_id": wf.id, "stage": stage, "attempt": attempt })),
                );
                self.publish(wf);
            }
            StageEvent::Retrying {
                stage,
                attempt,
                error,
                delay,
            } => {
                let Some(mut record) = wf.stage(&stage).cloned() else { return };
                record.last_error = Some(error.clone());
                self.persist_stage(wf, record).await;
                warn!(
                    stage = %stage,
                    attempt,
                    kind = %error.kind,
                    delay_ms = duration_ms(delay),
                    "Stage attempt failed, retrying"
                );
                self.events.try_emit(
                    names::STAGE_RETRYING,
                    Some(json!({
                        "workflow_id": wf.id,
                        "stage": stage,
                        "attempt": attempt,
                        "kind": error.kind,
                        "message": error.message,
                        "delay_ms": duration_ms(delay),
                    })),
                );
            }
        }
    }

    /// Records a stage's final outcome. Returns the failure cause if the
    /// stage failed.
    async fn on_stage_outcome(&self, wf: &mut Workflow, outcome: StageOutcome) -> Option<FailureCause> {
        if outcome.never_started() {
            debug!(stage = %outcome.stage, "Stage cancelled before it started");
            return None;
        }
        let mut record = wf.stage(&outcome.stage)?.clone();
        record.attempts = record.attempts.max(outcome.attempts);
        record.completed_at = Some(now_utc());

        match outcome.result {
            Ok(output) => {
                record.status = StageStatus::Succeeded;
                record.output = Some(output);
                info!(stage = %outcome.stage, attempts = record.attempts, "Stage succeeded");
                self.persist_stage(wf, record).await;
                self.events.try_emit(
                    names::STAGE_SUCCEEDED,
                    Some(json!({
                        "workflow_id": wf.id,
                        "stage": outcome.stage,
                        "attempts": outcome.attempts,
                    })),
                );
                None
            }
            Err(info) => {
                record.status = StageStatus::Failed;
                record.last_error = Some(info.clone());
                warn!(
                    stage = %outcome.stage,
                    attempts = record.attempts,
                    kind = %info.kind,
                    message = %info.message,
                    "Stage failed"
                );
                self.persist_stage(wf, record).await;
                self.events.try_emit(
                    names::STAGE_FAILED,
                    Some(json!({
                        "workflow_id": wf.id,
                        "stage": outcome.stage,
                        "kind": info.kind,
                        "message": info.message,
                    })),
                );
                Some(FailureCause::stage(outcome.stage, &info))
            }
        }
    }

    /// Writes a stage record. On a storage error the local copy still moves
    /// forward so execution can finish.
    async fn persist_stage(&self, wf: &mut Workflow, record: StageRecord) {
        let name = record.name.clone();
        match self.repository.append_stage_result(wf.id, &name, record.clone()).await {
            Ok(updated) => *wf = updated,
            Err(err) => {
                error!(stage = %name, error = %err, "Failed to persist stage result");
                if let Some(slot) = wf.stage_mut(&name) {
                    *slot = record;
                }
            }
        }
    }

    /// Persists the terminal status, re-reading on version conflicts.
    async fn finalize(&self, wf: &mut Workflow, change: StatusChange) {
        if let Err(err) = self.transition(wf, change.clone()).await {
            error!(error = %err, target = %change.status, "Failed to persist terminal status");
            wf.status = change.status;
            if change.failure.is_some() {
                wf.failure = change.failure;
            }
            if !change.artifacts.is_empty() {
                wf.artifacts = change.artifacts;
            }
        }
    }

    async fn transition(&self, wf: &mut Workflow, change: StatusChange) -> Result<(), WorkflowError> {
        let limit = self.config.persist_retry_limit.max(1);
        let mut expected = wf.version;
        for attempt in 1..=limit {
            match self.repository.update_status(wf.id, expected, change.clone()).await {
                Ok(updated) => {
                    *wf = updated;
                    return Ok(());
                }
                Err(RepositoryError::VersionConflict { actual, .. }) if attempt < limit => {
                    debug!(expected, actual, attempt, "Version conflict, re-reading workflow");
                    let fresh = self.repository.get(wf.id).await?;
                    expected = fresh.version;
                    *wf = fresh;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(WorkflowError::Internal(format!(
            "status write for {} kept conflicting",
            wf.id
        )))
    }

    fn publish(&self, wf: &Workflow) {
        self.progress
            .publish(ProgressSnapshot::compute(wf, &self.estimator, now_utc()));
    }

    fn announce_terminal(&self, wf: &Workflow, took: Duration) {
        let event = match wf.status {
            WorkflowStatus::Completed => names::WORKFLOW_COMPLETED,
            WorkflowStatus::Cancelled => names::WORKFLOW_CANCELLED,
            _ => names::WORKFLOW_FAILED,
        };
        info!(
            status = %wf.status,
            duration_ms = duration_ms(took),
            failure = ?wf.failure,
            "Workflow finished"
        );
        self.events.try_emit(
            event,
            Some(json!({
                "workflow_id": wf.id,
                "owner_id": wf.owner_id,
                "status": wf.status,
                "artifacts": wf.artifacts,
                "failure": wf.failure,
                "duration_ms": duration_ms(took),
            })),
        );
    }
}

impl std::fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn cancel_cause(cancel: &CancellationToken) -> FailureCause {
    let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
    FailureCause::workflow(ErrorKind::Cancelled, reason)
}

fn cancelled_info(message: &str) -> StageErrorInfo {
    StageErrorInfo::new(ErrorKind::Cancelled, message)
}

/// Outputs of a stage's direct predecessors, in declaration order.
fn upstream_of(wf: &Workflow, stage: &StageRecord) -> Vec<UpstreamOutput> {
    wf.stages
        .iter()
        .filter(|s| stage.depends_on.contains(&s.name))
        .filter_map(|s| {
            s.output.as_ref().map(|output| UpstreamOutput {
                stage: s.name.clone(),
                stage_type: s.stage_type,
                output: output.clone(),
            })
        })
        .collect()
}

/// Marks `finished` as satisfied for its dependents and queues the ones
/// with nothing left to wait for, in declaration order.
fn release_dependents(
    wf: &Workflow,
    finished: &str,
    waiting_on: &mut HashMap<String, usize>,
    ready: &mut VecDeque<String>,
) {
    for stage in wf.stages.iter().filter(|s| s.depends_on.contains(finished)) {
        if let Some(unmet) = waiting_on.get_mut(&stage.name) {
            *unmet = unmet.saturating_sub(1);
            if *unmet == 0 {
                waiting_on.remove(&stage.name);
                ready.push_back(stage.name.clone());
            }
        }
    }
}
