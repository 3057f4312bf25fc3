//! Stage adapters: the uniform boundary over external generators.
//!
//! The engine only knows the [`StageAdapter`] contract. Each [`StageType`]
//! maps to exactly one adapter in an [`AdapterRegistry`].

mod generation;
#[cfg(feature = "http")]
mod http;

pub use generation::{
    standard_registry, AssemblyStage, GenerationProvider, ImageStage, ProviderError,
    ProviderRequest, ProviderResponse, ScriptStage, VoiceStage,
};
#[cfg(feature = "http")]
pub use http::HttpProvider;

#[cfg(test)]
pub use generation::MockGenerationProvider;

pub use crate::core::StageOutput;

use crate::cancellation::CancellationToken;
use crate::core::{OwnerId, StageType, WorkflowId};
use crate::errors::StageError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Output of a direct predecessor, handed to its dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamOutput {
    /// The predecessor's name.
    pub stage: String,
    /// The predecessor's capability.
    pub stage_type: StageType,
    /// What it produced.
    pub output: StageOutput,
}

/// Everything an adapter receives for one attempt.
#[derive(Debug, Clone)]
pub struct StageInput {
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The workflow's owner.
    pub owner_id: OwnerId,
    /// The stage name.
    pub stage_name: String,
    /// The stage capability.
    pub stage_type: StageType,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Parameters from the request.
    pub params: serde_json::Value,
    /// Outputs of direct predecessors, in declaration order.
    pub upstream: Vec<UpstreamOutput>,
    /// Cancelled when the workflow is cancelled.
    pub cancel: Arc<CancellationToken>,
}

impl StageInput {
    /// Returns the first upstream output of the given type.
    #[must_use]
    pub fn upstream_of(&self, stage_type: StageType) -> Option<&UpstreamOutput> {
        self.upstream.iter().find(|u| u.stage_type == stage_type)
    }
}

/// Capability boundary over one external generator.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageAdapter: Send + Sync {
    /// The stage type this adapter serves.
    fn stage_type(&self) -> StageType;

    /// Runs one attempt.
    ///
    /// Errors are classified by the caller's retry policy: `Transient` and
    /// `Timeout` may be retried, `Permanent` and `Cancelled` are final.
    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError>;
}

/// Maps each stage type to its adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<StageType, Arc<dyn StageAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under its stage type, replacing any previous one.
    pub fn register(&mut self, adapter: Arc<dyn StageAdapter>) {
        let stage_type = adapter.stage_type();
        if self.adapters.insert(stage_type, adapter).is_some() {
            warn!(stage_type = %stage_type, "Replaced existing stage adapter");
        }
    }

    /// Builder-style registration.
    #[must_use]
    pub fn with(mut self, adapter: Arc<dyn StageAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Returns the adapter for a stage type.
    #[must_use]
    pub fn get(&self, stage_type: StageType) -> Option<Arc<dyn StageAdapter>> {
        self.adapters.get(&stage_type).cloned()
    }

    /// Returns true if the stage type has an adapter.
    #[must_use]
    pub fn contains(&self, stage_type: StageType) -> bool {
        self.adapters.contains_key(&stage_type)
    }

    /// Registered stage types, sorted.
    #[must_use]
    pub fn stage_types(&self) -> Vec<StageType> {
        let mut types: Vec<_> = self.adapters.keys().copied().collect();
        types.sort();
        types
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("stage_types", &self.stage_types())
            .finish()
    }
}
