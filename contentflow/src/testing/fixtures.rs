//! Request and registry fixtures.

use super::ScriptedAdapter;
use crate::adapters::AdapterRegistry;
use crate::core::{StageRequest, StageType, WorkflowRequest};
use std::sync::Arc;

/// A chain where each stage depends on the previous one.
#[must_use]
pub fn linear_request(stages: &[(&str, StageType)]) -> WorkflowRequest {
    let mut request = WorkflowRequest::new();
    let mut previous: Option<&str> = None;
    for (name, stage_type) in stages {
        let mut stage = StageRequest::new(*name, *stage_type);
        if let Some(prev) = previous {
            stage = stage.depends_on(prev);
        }
        request = request.stage(stage);
        previous = Some(*name);
    }
    request
}

/// script -> {voice, image} -> assembly.
#[must_use]
pub fn diamond_request() -> WorkflowRequest {
    WorkflowRequest::standard_video("fixture brief")
}

/// A registry with the given scripted adapters, returned alongside it.
#[must_use]
pub fn scripted_registry(
    adapters: Vec<ScriptedAdapter>,
) -> (AdapterRegistry, Vec<Arc<ScriptedAdapter>>) {
    let mut registry = AdapterRegistry::new();
    let handles: Vec<Arc<ScriptedAdapter>> = adapters.into_iter().map(Arc::new).collect();
    for adapter in &handles {
        registry.register(adapter.clone());
    }
    (registry, handles)
}
