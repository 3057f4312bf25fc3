//! Adapters for the four generation capabilities.
//!
//! Each adapter shapes a [`ProviderRequest`] from the stage input and hands it
//! to a [`GenerationProvider`], the client of the external service. Provider
//! failures are classified into [`StageError`]s here so the executor never
//! sees transport details.

use super::{AdapterRegistry, StageAdapter, StageInput};
use crate::core::{StageOutput, StageType};
use crate::errors::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Request sent to an external generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Capability being invoked.
    pub capability: StageType,
    /// Idempotency key: workflow, stage and attempt.
    pub request_id: String,
    /// Capability-specific payload.
    pub payload: serde_json::Value,
}

/// Response from an external generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Reference to the generated artifact.
    pub artifact: String,
    /// Provider metadata (durations, model, cost, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Transport-level failures reported by a provider client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider answered with a non-success status.
    #[error("provider returned status {status}: {message}")]
    Status {
        /// HTTP-style status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The provider could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The provider did not answer in time.
    #[error("provider timed out: {0}")]
    Timeout(String),

    /// The provider answered with something unusable.
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Maps the failure onto the stage error taxonomy.
    ///
    /// 408, 429 and 5xx are transient, other statuses are permanent.
    #[must_use]
    pub fn classify(&self) -> StageError {
        match self {
            Self::Status { status, .. } if *status == 408 || *status == 429 || *status >= 500 => {
                StageError::Transient(self.to_string())
            }
            Self::Status { .. } | Self::InvalidResponse(_) => StageError::Permanent(self.to_string()),
            Self::Connection(_) => StageError::Transient(self.to_string()),
            Self::Timeout(_) => StageError::Timeout(self.to_string()),
        }
    }
}

/// Client of an external generation service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Submits one generation request.
    async fn generate(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Sends the request, racing it against workflow cancellation.
async fn invoke(
    provider: &dyn GenerationProvider,
    input: &StageInput,
    payload: serde_json::Value,
) -> Result<StageOutput, StageError> {
    let request = ProviderRequest {
        capability: input.stage_type,
        request_id: format!("{}:{}:{}", input.workflow_id, input.stage_name, input.attempt),
        payload,
    };
    debug!(
        workflow_id = %input.workflow_id,
        stage = %input.stage_name,
        attempt = input.attempt,
        "Submitting generation request"
    );

    tokio::select! {
        result = provider.generate(request) => result
            .map(|r| StageOutput::new(r.artifact).with_metadata(r.metadata))
            .map_err(|e| e.classify()),
        () = input.cancel.cancelled() => Err(StageError::Cancelled(
            input.cancel.reason().unwrap_or_else(|| "workflow cancelled".to_string()),
        )),
    }
}

/// Writes the script from the project brief.
pub struct ScriptStage {
    provider: Arc<dyn GenerationProvider>,
}

impl ScriptStage {
    /// Creates the adapter.
    #[must_use]
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageAdapter for ScriptStage {
    fn stage_type(&self) -> StageType {
        StageType::Script
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let payload = serde_json::json!({ "params": input.params });
        invoke(self.provider.as_ref(), &input, payload).await
    }
}

/// Synthesizes narration for a script.
pub struct VoiceStage {
    provider: Arc<dyn GenerationProvider>,
}

impl VoiceStage {
    /// Creates the adapter.
    #[must_use]
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageAdapter for VoiceStage {
    fn stage_type(&self) -> StageType {
        StageType::Voice
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let script = match input.upstream_of(StageType::Script) {
            Some(upstream) => serde_json::Value::String(upstream.output.artifact.clone()),
            None => input
                .params
                .get("text")
                .cloned()
                .ok_or_else(|| StageError::permanent("voice stage needs a script input or a 'text' param"))?,
        };
        let payload = serde_json::json!({ "script": script, "params": input.params });
        invoke(self.provider.as_ref(), &input, payload).await
    }
}

/// Generates scene imagery, guided by the script when one is upstream.
pub struct ImageStage {
    provider: Arc<dyn GenerationProvider>,
}

impl ImageStage {
    /// Creates the adapter.
    #[must_use]
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageAdapter for ImageStage {
    fn stage_type(&self) -> StageType {
        StageType::Image
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let script = input
            .upstream_of(StageType::Script)
            .map(|u| u.output.artifact.clone());
        let payload = serde_json::json!({ "script": script, "params": input.params });
        invoke(self.provider.as_ref(), &input, payload).await
    }
}

/// Combines every upstream artifact into the final media.
pub struct AssemblyStage {
    provider: Arc<dyn GenerationProvider>,
}

impl AssemblyStage {
    /// Creates the adapter.
    #[must_use]
    pub fn new(provider: Arc<dyn GenerationProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl StageAdapter for AssemblyStage {
    fn stage_type(&self) -> StageType {
        StageType::Assembly
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        if input.upstream.is_empty() {
            return Err(StageError::permanent("assembly stage has nothing to assemble"));
        }
        let inputs: Vec<_> = input
            .upstream
            .iter()
            .map(|u| {
                serde_json::json!({
                    "stage": u.stage,
                    "type": u.stage_type,
                    "artifact": u.output.artifact,
                })
            })
            .collect();
        let payload = serde_json::json!({ "inputs": inputs, "params": input.params });
        invoke(self.provider.as_ref(), &input, payload).await
    }
}

/// Registers all four generation adapters over one provider.
#[must_use]
pub fn standard_registry(provider: Arc<dyn GenerationProvider>) -> AdapterRegistry {
    AdapterRegistry::new()
        .with(Arc::new(ScriptStage::new(provider.clone())))
        .with(Arc::new(VoiceStage::new(provider.clone())))
        .with(Arc::new(ImageStage::new(provider.clone())))
        .with(Arc::new(AssemblyStage::new(provider)))
}
