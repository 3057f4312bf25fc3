//! Workflow scenarios driven end to end through the engine.
//!
//! Every test runs on a paused tokio clock, so simulated stage latency and
//! retry backoff cost no wall time.

use super::WorkflowEngine;
use crate::adapters::{AdapterRegistry, MockStageAdapter, StageAdapter, StageOutput};
use crate::config::EngineConfig;
use crate::core::{
    OwnerId, StageRecord, StageRequest, StageStatus, StageType, Workflow, WorkflowId,
    WorkflowRequest, WorkflowStatus,
};
use crate::errors::{ErrorKind, ResourceError, StageError, WorkflowError};
use crate::events::{names, CollectingEventSink};
use crate::pipeline::{ExecutorConfig, RetryConfig, RetryPolicy};
use crate::progress::ProgressSnapshot;
use crate::repository::{InMemoryWorkflowRepository, StatusChange, WorkflowRepository};
use crate::resources::ResourceConfig;
use crate::testing::{diamond_request, linear_request, scripted_registry, ScriptedAdapter};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

const STAGE_TIME: Duration = Duration::from_secs(2);

struct Harness {
    engine: Arc<WorkflowEngine>,
    adapters: Vec<Arc<ScriptedAdapter>>,
    repository: Arc<InMemoryWorkflowRepository>,
    events: Arc<CollectingEventSink>,
}

impl Harness {
    fn new(config: EngineConfig, adapters: Vec<ScriptedAdapter>) -> Self {
        let (registry, adapters) = scripted_registry(adapters);
        Self::with_registry(config, registry, adapters)
    }

    fn with_registry(
        config: EngineConfig,
        registry: AdapterRegistry,
        adapters: Vec<Arc<ScriptedAdapter>>,
    ) -> Self {
        let repository = Arc::new(InMemoryWorkflowRepository::new());
        let events = Arc::new(CollectingEventSink::new());
        let engine =
            WorkflowEngine::new(config, registry, repository.clone(), events.clone()).unwrap();
        Self {
            engine: Arc::new(engine),
            adapters,
            repository,
            events,
        }
    }

    /// Adapter for a stage type, as passed to `new`.
    fn adapter(&self, stage_type: StageType) -> &ScriptedAdapter {
        self.adapters
            .iter()
            .find(|a| a.stage_type() == stage_type)
            .unwrap()
    }

    async fn run(&self, request: WorkflowRequest) -> (Workflow, ProgressSnapshot) {
        let workflow = self
            .engine
            .initialize(request, OwnerId::from("owner-1"))
            .await
            .unwrap();
        self.engine.start(workflow.id).await.unwrap();
        let last = self.engine.wait(workflow.id).await.unwrap();
        (self.engine.get_workflow(workflow.id).await.unwrap(), last)
    }
}

fn adapters(delay: Duration) -> Vec<ScriptedAdapter> {
    StageType::ALL
        .iter()
        .map(|t| ScriptedAdapter::new(*t).with_delay(delay))
        .collect()
}

fn with_overrides(delay: Duration, overrides: Vec<ScriptedAdapter>) -> Vec<ScriptedAdapter> {
    let mut all: Vec<ScriptedAdapter> = adapters(delay)
        .into_iter()
        .filter(|a| !overrides.iter().any(|o| o.stage_type() == a.stage_type()))
        .collect();
    all.extend(overrides);
    all
}

fn three_stage_chain() -> WorkflowRequest {
    linear_request(&[
        ("script", StageType::Script),
        ("voice", StageType::Voice),
        ("image", StageType::Image),
    ])
}

fn stage<'a>(workflow: &'a Workflow, name: &str) -> &'a StageRecord {
    workflow.stage(name).unwrap()
}

async fn until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_initialize_creates_pending_workflow() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let workflow = harness
        .engine
        .initialize(diamond_request(), OwnerId::from("owner-1"))
        .await
        .unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Pending);
    assert_eq!(workflow.stages.len(), 4);
    assert!(workflow.stages.iter().all(|s| s.status == StageStatus::Pending));

    let stored = harness.engine.get_workflow(workflow.id).await.unwrap();
    assert_eq!(stored, workflow);

    let status = harness.engine.get_status(workflow.id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Pending);
    assert!(status.percent_complete.abs() < f64::EPSILON);
    assert!(status.estimated_remaining_ms > 0);
    assert_eq!(harness.events.count(names::WORKFLOW_CREATED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_rejects_invalid_requests() {
    let (registry, handles) = scripted_registry(vec![
        ScriptedAdapter::new(StageType::Script),
        ScriptedAdapter::new(StageType::Voice),
    ]);
    let harness = Harness::with_registry(EngineConfig::default(), registry, handles);
    let owner = OwnerId::from("owner-1");

    let code = |result: Result<Workflow, WorkflowError>| match result {
        Err(WorkflowError::Validation(err)) => err.code,
        other => panic!("expected validation error, got {other:?}"),
    };

    let empty = harness.engine.initialize(WorkflowRequest::new(), owner.clone()).await;
    assert_eq!(code(empty), "WORKFLOW-EMPTY");

    let cyclic = WorkflowRequest::new()
        .stage(StageRequest::new("a", StageType::Script).depends_on("b"))
        .stage(StageRequest::new("b", StageType::Voice).depends_on("a"));
    assert_eq!(code(harness.engine.initialize(cyclic, owner.clone()).await), "WORKFLOW-CYCLE");

    let unknown = WorkflowRequest::new().stage(StageRequest::new("img", StageType::Image));
    assert_eq!(
        code(harness.engine.initialize(unknown, owner.clone()).await),
        "WORKFLOW-UNKNOWN_TYPE"
    );

    assert!(harness.repository.is_empty());
    assert!(harness.engine.list_workflows(&owner).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_ids_are_not_found() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let id = WorkflowId::generate();

    assert!(matches!(harness.engine.start(id).await, Err(WorkflowError::NotFound { .. })));
    assert!(matches!(harness.engine.cancel(id).await, Err(WorkflowError::NotFound { .. })));
    assert!(matches!(harness.engine.get_status(id).await, Err(WorkflowError::NotFound { .. })));
    assert!(matches!(harness.engine.subscribe(id).await, Err(WorkflowError::NotFound { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_diamond_completes_with_sink_artifacts() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let (workflow, last) = harness.run(diamond_request()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert!(workflow.all_stages_succeeded());
    assert_eq!(
        workflow.artifacts,
        [format!("assembly://{}/assembly", workflow.id)]
    );
    assert!(workflow.failure.is_none());
    assert_eq!(last.status, WorkflowStatus::Completed);
    assert!((last.percent_complete - 100.0).abs() < f64::EPSILON);
    assert_eq!(last.estimated_remaining_ms, 0);
    assert_eq!(harness.engine.resources().active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let workflow = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        harness.engine.start(workflow.id),
        harness.engine.start(workflow.id)
    );
    first.unwrap();
    second.unwrap();
    harness.engine.start(workflow.id).await.unwrap();

    harness.engine.wait(workflow.id).await.unwrap();
    for stage_type in [StageType::Script, StageType::Voice, StageType::Image] {
        assert_eq!(harness.adapter(stage_type).call_count(), 1);
    }
    assert_eq!(harness.events.count(names::WORKFLOW_STARTED), 1);

    let again = harness.engine.start(workflow.id).await;
    assert!(matches!(
        again,
        Err(WorkflowError::InvalidState {
            status: WorkflowStatus::Completed,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new(
        EngineConfig::default(),
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Script)
                .with_delay(STAGE_TIME)
                .failing(2, StageError::transient("503 from provider"))],
        ),
    );
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let script = stage(&workflow, "script");
    assert_eq!(script.attempts, 3);
    assert_eq!(script.last_error.as_ref().unwrap().kind, ErrorKind::Transient);
    assert_eq!(stage(&workflow, "voice").attempts, 1);
    assert_eq!(harness.events.count(names::STAGE_RETRYING), 2);

    let attempts: Vec<u32> = harness
        .adapter(StageType::Script)
        .calls()
        .iter()
        .map(|c| c.attempt)
        .collect();
    assert_eq!(attempts, [1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_workflow() {
    let harness = Harness::new(
        EngineConfig::default(),
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Voice)
                .always_failing(StageError::transient("rate limited"))],
        ),
    );
    let (workflow, last) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let voice = stage(&workflow, "voice");
    assert_eq!(voice.status, StageStatus::Failed);
    assert_eq!(voice.attempts, 3);
    assert!(voice.last_error.as_ref().unwrap().message.contains("gave up after 3 attempts"));
    assert_eq!(stage(&workflow, "image").status, StageStatus::Pending);

    let failure = workflow.failure.unwrap();
    assert_eq!(failure.stage.as_deref(), Some("voice"));
    assert_eq!(failure.kind, ErrorKind::Transient);
    assert_eq!(last.status, WorkflowStatus::Failed);
    assert_eq!(last.estimated_remaining_ms, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_per_stage_type() {
    let config = EngineConfig::default().with_retry(
        RetryConfig::default()
            .with_stage_policy(StageType::Script, RetryPolicy::default().with_max_attempts(5)),
    );
    let harness = Harness::new(
        config,
        with_overrides(
            Duration::ZERO,
            vec![ScriptedAdapter::new(StageType::Script)
                .failing(4, StageError::timeout("provider slow"))],
        ),
    );
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(stage(&workflow, "script").attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_lets_siblings_finish() {
    let harness = Harness::new(
        EngineConfig::default(),
        with_overrides(
            STAGE_TIME,
            vec![
                ScriptedAdapter::new(StageType::Voice)
                    .with_delay(Duration::from_secs(1))
                    .always_failing(StageError::permanent("voice rejected the script")),
                ScriptedAdapter::new(StageType::Image).with_delay(Duration::from_secs(3)),
            ],
        ),
    );
    let (workflow, last) = harness.run(diamond_request()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(stage(&workflow, "voice").attempts, 1);
    assert_eq!(stage(&workflow, "voice").status, StageStatus::Failed);
    assert_eq!(stage(&workflow, "image").status, StageStatus::Succeeded);
    assert_eq!(stage(&workflow, "assembly").status, StageStatus::Pending);
    assert_eq!(harness.adapter(StageType::Assembly).call_count(), 0);

    let failure = workflow.failure.unwrap();
    assert_eq!(failure.stage.as_deref(), Some("voice"));
    assert_eq!(failure.kind, ErrorKind::Permanent);
    assert_eq!(failure.message, "voice rejected the script");
    assert_eq!(last.failure.unwrap().kind, ErrorKind::Permanent);
    assert_eq!(harness.engine.resources().active_count(), 0);
    assert_eq!(harness.events.count(names::WORKFLOW_FAILED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stages_start_after_dependencies_complete() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let (workflow, _) = harness.run(diamond_request()).await;

    for record in &workflow.stages {
        let started = record.started_at.unwrap();
        for dep in &record.depends_on {
            let dep_done = stage(&workflow, dep).completed_at.unwrap();
            assert!(started >= dep_done, "{} started before {dep} completed", record.name);
        }
    }

    // Voice and image share a join and run side by side.
    let voice = &harness.adapter(StageType::Voice).calls()[0];
    let image = &harness.adapter(StageType::Image).calls()[0];
    let assembly = &harness.adapter(StageType::Assembly).calls()[0];
    assert_eq!(voice.started, image.started);
    assert!(assembly.started >= voice.finished.max(image.finished));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_stage_limit() {
    let config =
        EngineConfig::default().with_executor(ExecutorConfig::default().with_max_parallel_stages(1));
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let (workflow, _) = harness.run(diamond_request()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    let voice = &harness.adapter(StageType::Voice).calls()[0];
    let image = &harness.adapter(StageType::Image).calls()[0];
    assert!(voice.finished <= image.started || image.finished <= voice.started);
}

#[tokio::test(start_paused = true)]
async fn test_upstream_outputs_reach_dependents() {
    let (mut registry, handles) = scripted_registry(vec![
        ScriptedAdapter::new(StageType::Script),
        ScriptedAdapter::new(StageType::Voice),
        ScriptedAdapter::new(StageType::Image),
    ]);
    let mut assembly = MockStageAdapter::new();
    assembly.expect_stage_type().return_const(StageType::Assembly);
    assembly
        .expect_execute()
        .withf(|input| {
            input.upstream.len() == 2
                && input.upstream_of(StageType::Voice).is_some()
                && input.upstream_of(StageType::Image).is_some()
                && input.attempt == 1
        })
        .times(1)
        .returning(|_| Ok(StageOutput::new("s3://renders/final.mp4")));
    registry.register(Arc::new(assembly));

    let harness = Harness::with_registry(EngineConfig::default(), registry, handles);
    let (workflow, _) = harness.run(diamond_request()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(workflow.artifacts, ["s3://renders/final.mp4"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_pipeline() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let workflow = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();
    harness.engine.start(workflow.id).await.unwrap();

    // Script is done, voice is halfway.
    tokio::time::sleep(Duration::from_secs(3)).await;
    harness.engine.cancel(workflow.id).await.unwrap();
    let last = harness.engine.wait(workflow.id).await.unwrap();

    let workflow = harness.engine.get_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    assert_eq!(last.status, WorkflowStatus::Cancelled);
    assert_eq!(stage(&workflow, "script").status, StageStatus::Succeeded);
    let voice = stage(&workflow, "voice");
    assert_eq!(voice.status, StageStatus::Failed);
    assert_eq!(voice.last_error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(stage(&workflow, "image").status, StageStatus::Pending);
    assert_eq!(harness.adapter(StageType::Image).call_count(), 0);
    assert_eq!(workflow.failure.as_ref().unwrap().kind, ErrorKind::Cancelled);
    assert_eq!(harness.engine.resources().active_count(), 0);

    // Terminal workflows ignore further cancels.
    harness.engine.cancel(workflow.id).await.unwrap();
    assert_eq!(harness.events.count(names::WORKFLOW_CANCELLED), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff() {
    let harness = Harness::new(
        EngineConfig::default().with_retry(RetryConfig::uniform(
            RetryPolicy::default().with_base_delay_ms(60_000).with_jitter(0.0),
        )),
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Script)
                .failing(1, StageError::transient("busy"))],
        ),
    );
    let workflow = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();
    harness.engine.start(workflow.id).await.unwrap();

    until(|| harness.events.count(names::STAGE_RETRYING) == 1).await;
    harness.engine.cancel(workflow.id).await.unwrap();
    harness.engine.wait(workflow.id).await.unwrap();

    let workflow = harness.engine.get_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Cancelled);
    assert_eq!(stage(&workflow, "script").attempts, 1);
    assert_eq!(harness.adapter(StageType::Script).call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_pending_workflow() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let workflow = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();

    harness.engine.cancel(workflow.id).await.unwrap();
    let status = harness.engine.get_status(workflow.id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Cancelled);

    let start = harness.engine.start(workflow.id).await;
    assert!(matches!(
        start,
        Err(WorkflowError::InvalidState {
            status: WorkflowStatus::Cancelled,
            action: "start",
            ..
        })
    ));
    assert_eq!(harness.adapter(StageType::Script).call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_bounds_running_workflows() {
    let config = EngineConfig::default()
        .with_resources(ResourceConfig::default().with_limits(2, 10));
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let request = || linear_request(&[("script", StageType::Script)]);

    let mut ids = Vec::new();
    for _ in 0..5 {
        let wf = harness
            .engine
            .initialize(request(), OwnerId::from("owner-1"))
            .await
            .unwrap();
        ids.push(wf.id);
    }

    let starts: Vec<_> = ids
        .iter()
        .map(|id| {
            let engine = harness.engine.clone();
            let id = *id;
            tokio::spawn(async move { engine.start(id).await })
        })
        .collect();

    let resources = harness.engine.resources().clone();
    loop {
        let mut running = 0;
        for id in &ids {
            if harness.engine.get_workflow(*id).await.unwrap().status == WorkflowStatus::Running {
                running += 1;
            }
        }
        if running == 2 && resources.queued_count() == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(resources.active_count(), 2);

    for start in starts {
        start.await.unwrap().unwrap();
    }
    for id in &ids {
        let last = harness.engine.wait(*id).await.unwrap();
        assert_eq!(last.status, WorkflowStatus::Completed);
    }
    assert_eq!(harness.adapter(StageType::Script).max_in_flight(), 2);
    assert_eq!(harness.adapter(StageType::Script).call_count(), 5);
    assert_eq!(resources.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_lease() {
    let config = EngineConfig::default()
        .with_resources(ResourceConfig::default().with_limits(1, 1));
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let owner = OwnerId::from("owner-1");
    let first = harness.engine.initialize(three_stage_chain(), owner.clone()).await.unwrap();
    let second = harness.engine.initialize(three_stage_chain(), owner).await.unwrap();
    harness.engine.start(first.id).await.unwrap();

    let second_id = second.id;
    let engine = harness.engine.clone();
    let waiting = tokio::spawn(async move { engine.start(second_id).await });
    let resources = harness.engine.resources().clone();
    until(|| resources.queued_count() == 1).await;

    harness.engine.cancel(second_id).await.unwrap();
    let result = waiting.await.unwrap();
    assert!(matches!(
        result,
        Err(WorkflowError::InvalidState {
            status: WorkflowStatus::Cancelled,
            ..
        })
    ));
    assert_eq!(resources.queued_count(), 0);

    harness.engine.wait(first.id).await.unwrap();
    let second = harness.engine.get_workflow(second_id).await.unwrap();
    assert_eq!(second.status, WorkflowStatus::Cancelled);
    assert!(second.stages.iter().all(|s| s.attempts == 0));
    assert_eq!(resources.active_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_full_admission_queue_surfaces_from_start() {
    let config = EngineConfig::default()
        .with_resources(ResourceConfig::default().with_limits(1, 1).with_max_queue_depth(0));
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let owner = OwnerId::from("owner-1");
    let first = harness.engine.initialize(three_stage_chain(), owner.clone()).await.unwrap();
    let second = harness.engine.initialize(three_stage_chain(), owner).await.unwrap();

    harness.engine.start(first.id).await.unwrap();
    let err = harness.engine.start(second.id).await.unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::ResourceExhausted(ResourceError::QueueFull { limit: 0, .. })
    ));

    // Still pending, so it can be started once capacity frees.
    harness.engine.wait(first.id).await.unwrap();
    harness.engine.start(second.id).await.unwrap();
    let last = harness.engine.wait(second.id).await.unwrap();
    assert_eq!(last.status, WorkflowStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_owner_quota_exhaustion_fails_workflow() {
    let config = EngineConfig::default().with_resources(
        ResourceConfig::default()
            .with_owner_quota(2)
            .with_stage_cost(StageType::Script, 1)
            .with_stage_cost(StageType::Voice, 1),
    );
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let image = stage(&workflow, "image");
    assert_eq!(image.status, StageStatus::Failed);
    assert_eq!(image.attempts, 0);
    assert_eq!(harness.adapter(StageType::Image).call_count(), 0);

    let failure = workflow.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::ResourceExhausted);
    assert_eq!(failure.stage.as_deref(), Some("image"));
    assert_eq!(
        harness.engine.resources().quota_remaining(&OwnerId::from("owner-1")),
        Some(0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_do_not_charge_quota_again() {
    let config = EngineConfig::default().with_resources(ResourceConfig::default().with_owner_quota(2));
    let harness = Harness::new(
        config,
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Voice)
                .with_delay(STAGE_TIME)
                .failing(1, StageError::transient("provider hiccup"))],
        ),
    );
    let request = linear_request(&[("script", StageType::Script), ("voice", StageType::Voice)]);
    let (workflow, _) = harness.run(request).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(stage(&workflow, "voice").attempts, 2);
    assert_eq!(
        harness.engine.resources().quota_remaining(&OwnerId::from("owner-1")),
        Some(0)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_workflow_budget_does_not_overflow() {
    let config = EngineConfig::default().with_executor(ExecutorConfig {
        workflow_timeout_ms: Some(u64::MAX),
        ..ExecutorConfig::default()
    });
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_is_retried() {
    let config = EngineConfig::default()
        .with_executor(ExecutorConfig::default().with_stage_timeout(Duration::from_secs(1)));
    let harness = Harness::new(
        config,
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Script).with_delay(Duration::from_secs(5))],
        ),
    );
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    let script = stage(&workflow, "script");
    assert_eq!(script.attempts, 3);
    assert_eq!(script.last_error.as_ref().unwrap().kind, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_budget_makes_timeout_terminal() {
    let config = EngineConfig::default().with_executor(
        ExecutorConfig::default().with_workflow_timeout(Duration::from_secs(3)),
    );
    let harness = Harness::new(config, adapters(STAGE_TIME));
    let (workflow, _) = harness.run(three_stage_chain()).await;

    assert_eq!(workflow.status, WorkflowStatus::Failed);
    assert_eq!(stage(&workflow, "script").status, StageStatus::Succeeded);
    let voice = stage(&workflow, "voice");
    assert_eq!(voice.attempts, 1);
    assert!(voice.last_error.as_ref().unwrap().message.contains("budget"));

    let failure = workflow.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Timeout);
    assert_eq!(failure.stage.as_deref(), Some("voice"));
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_monotonic_and_terminal_is_last() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let workflow = harness
        .engine
        .initialize(diamond_request(), OwnerId::from("owner-1"))
        .await
        .unwrap();
    let stream = harness.engine.subscribe(workflow.id).await.unwrap();
    harness.engine.start(workflow.id).await.unwrap();

    let snapshots: Vec<ProgressSnapshot> = stream.collect().await;
    assert!(snapshots.len() > 4);
    for pair in snapshots.windows(2) {
        assert!(pair[1].percent_complete >= pair[0].percent_complete);
        assert!(pair[1].sequence > pair[0].sequence);
        assert!(!pair[0].is_terminal());
    }
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, WorkflowStatus::Completed);
    assert_eq!(last.completed_stages.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_linear_scenario_progress_and_retry() {
    let harness = Harness::new(
        EngineConfig::default(),
        with_overrides(
            STAGE_TIME,
            vec![ScriptedAdapter::new(StageType::Voice)
                .with_delay(STAGE_TIME)
                .failing(1, StageError::transient("voice provider hiccup"))],
        ),
    );
    for stage_type in [StageType::Script, StageType::Voice, StageType::Image] {
        harness.engine.estimator().seed(stage_type, STAGE_TIME);
    }

    let workflow = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();
    let stream = harness.engine.subscribe(workflow.id).await.unwrap();
    harness.engine.start(workflow.id).await.unwrap();
    let snapshots: Vec<ProgressSnapshot> = stream.collect().await;

    let after_script = snapshots
        .iter()
        .find(|s| s.completed_stages == ["script"])
        .unwrap();
    assert!((after_script.percent_complete - 100.0 / 3.0).abs() < 0.5);
    assert!(after_script.estimated_remaining_ms.abs_diff(4000) <= 50);

    let workflow = harness.engine.get_workflow(workflow.id).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    assert_eq!(stage(&workflow, "voice").attempts, 2);
    assert_eq!(stage(&workflow, "script").attempts, 1);
    assert_eq!(stage(&workflow, "image").attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recover_fails_orphaned_running_workflows() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let repository = harness.repository.clone();

    // Left behind as Running by a previous process.
    let orphan = Workflow::new(OwnerId::from("owner-1"), None, &three_stage_chain().stages);
    let id = repository.create(orphan).await.unwrap();
    let running = repository
        .update_status(id, 0, StatusChange::to(WorkflowStatus::Running))
        .await
        .unwrap();
    let mut script = running.stage("script").unwrap().clone();
    script.status = StageStatus::Running;
    script.attempts = 1;
    repository.append_stage_result(id, "script", script).await.unwrap();

    let untouched = harness
        .engine
        .initialize(three_stage_chain(), OwnerId::from("owner-1"))
        .await
        .unwrap();

    assert_eq!(harness.engine.recover().await.unwrap(), [id]);

    let recovered = harness.engine.get_workflow(id).await.unwrap();
    assert_eq!(recovered.status, WorkflowStatus::Failed);
    assert_eq!(recovered.failure.as_ref().unwrap().kind, ErrorKind::Interrupted);
    let script = stage(&recovered, "script");
    assert_eq!(script.status, StageStatus::Failed);
    assert_eq!(script.last_error.as_ref().unwrap().kind, ErrorKind::Interrupted);

    let status = harness.engine.get_status(id).await.unwrap();
    assert_eq!(status.status, WorkflowStatus::Failed);
    assert_eq!(
        harness.engine.get_workflow(untouched.id).await.unwrap().status,
        WorkflowStatus::Pending
    );
    assert!(harness.engine.recover().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lifecycle_events() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    harness.run(linear_request(&[("script", StageType::Script)])).await;

    assert_eq!(
        harness.events.event_types(),
        [
            "workflow.created",
            "resource.acquired",
            "workflow.started",
            "stage.started",
            "stage.succeeded",
            "resource.released",
            "workflow.completed",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_list_workflows_by_owner() {
    let harness = Harness::new(EngineConfig::default(), adapters(STAGE_TIME));
    let alice = OwnerId::from("alice");
    for _ in 0..2 {
        harness.engine.initialize(diamond_request(), alice.clone()).await.unwrap();
    }
    harness
        .engine
        .initialize(diamond_request(), OwnerId::from("bob"))
        .await
        .unwrap();

    let listed = harness.engine.list_workflows(&alice).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|wf| wf.owner_id == alice));
}
