//! Benchmarks for request validation and completion estimates.

use contentflow::core::{now_utc, OwnerId, StageRequest, StageType, Workflow, WorkflowRequest};
use contentflow::estimator::{EstimatorConfig, TimeEstimator};
use contentflow::pipeline::{topological_order, validate_request};
use contentflow::testing::{scripted_registry, ScriptedAdapter};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

/// A wide graph: one script fanning out to `width` voice/image pairs that
/// join in a single assembly.
fn fan_out_request(width: usize) -> WorkflowRequest {
    let mut request = WorkflowRequest::new().stage(StageRequest::new("script", StageType::Script));
    let mut assembly = StageRequest::new("assembly", StageType::Assembly);
    for i in 0..width {
        let voice = format!("voice-{i}");
        let image = format!("image-{i}");
        request = request
            .stage(StageRequest::new(&voice, StageType::Voice).depends_on("script"))
            .stage(StageRequest::new(&image, StageType::Image).depends_on(&voice));
        assembly = assembly.depends_on(image);
    }
    request.stage(assembly)
}

fn validation_benchmark(c: &mut Criterion) {
    let (registry, _) = scripted_registry(
        StageType::ALL.iter().map(|t| ScriptedAdapter::new(*t)).collect(),
    );
    let standard = WorkflowRequest::standard_video("bench");
    let wide = fan_out_request(50);

    c.bench_function("validate_standard_video", |b| {
        b.iter(|| validate_request(black_box(&standard), &registry));
    });
    c.bench_function("validate_fan_out_50", |b| {
        b.iter(|| validate_request(black_box(&wide), &registry));
    });

    let workflow = Workflow::new(OwnerId::from("bench"), None, &wide.stages);
    c.bench_function("topological_order_fan_out_50", |b| {
        b.iter(|| topological_order(black_box(&workflow.stages)).len());
    });
}

fn estimate_benchmark(c: &mut Criterion) {
    let estimator = TimeEstimator::new(EstimatorConfig::default());
    for (i, stage_type) in StageType::ALL.iter().enumerate() {
        estimator.seed(*stage_type, Duration::from_secs(2 + i as u64));
    }
    let workflow = Workflow::new(OwnerId::from("bench"), None, &fan_out_request(50).stages);
    let now = now_utc();

    c.bench_function("estimate_fan_out_50", |b| {
        b.iter(|| estimator.estimate(black_box(&workflow), now));
    });
    c.bench_function("record_sample", |b| {
        b.iter(|| estimator.record(StageType::Voice, black_box(Duration::from_millis(1500))));
    });
}

criterion_group!(benches, validation_benchmark, estimate_benchmark);
criterion_main!(benches);
