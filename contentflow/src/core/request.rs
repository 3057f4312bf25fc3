//! Workflow requests as handed over by the gateway layer.

use super::StageType;
use serde::{Deserialize, Serialize};

/// One requested stage of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    /// Unique stage name within the workflow.
    pub name: String,
    /// The capability to invoke.
    pub stage_type: StageType,
    /// Names of stages that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Opaque parameters forwarded to the adapter.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl StageRequest {
    /// Creates a root stage request.
    #[must_use]
    pub fn new(name: impl Into<String>, stage_type: StageType) -> Self {
        Self {
            name: name.into(),
            stage_type,
            depends_on: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, stage: impl Into<String>) -> Self {
        self.depends_on.push(stage.into());
        self
    }

    /// Sets the adapter parameters.
    #[must_use]
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// A request to generate content through a stage graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Project the content belongs to, if any.
    #[serde(default)]
    pub project_id: Option<String>,
    /// The stage graph, in declaration order.
    #[serde(default)]
    pub stages: Vec<StageRequest>,
}

impl WorkflowRequest {
    /// Creates an empty request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the project id.
    #[must_use]
    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageRequest) -> Self {
        self.stages.push(stage);
        self
    }

    /// Builds the common linear pipeline script -> voice -> image -> assembly.
    #[must_use]
    pub fn standard_video(brief: impl Into<String>) -> Self {
        let brief = brief.into();
        Self::new()
            .stage(
                StageRequest::new("script", StageType::Script)
                    .with_params(serde_json::json!({ "brief": brief })),
            )
            .stage(StageRequest::new("voice", StageType::Voice).depends_on("script"))
            .stage(StageRequest::new("image", StageType::Image).depends_on("script"))
            .stage(
                StageRequest::new("assembly", StageType::Assembly)
                    .depends_on("voice")
                    .depends_on("image"),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_deserializes_with_defaults() {
        let json = r#"{"stages":[{"name":"script","stage_type":"script"}]}"#;
        let request: WorkflowRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.project_id, None);
        assert_eq!(request.stages.len(), 1);
        assert!(request.stages[0].depends_on.is_empty());
        assert!(request.stages[0].params.is_null());
    }

    #[test]
    fn test_standard_video_shape() {
        let request = WorkflowRequest::standard_video("a day at the beach");
        let names: Vec<_> = request.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["script", "voice", "image", "assembly"]);
        assert_eq!(request.stages[3].depends_on, ["voice", "image"]);
    }
}
