//! Error types for the workflow engine.
//!
//! Validation and lookup errors surface synchronously to callers; stage-level
//! errors are classified here and recorded on the workflow as diagnostics.

use crate::core::{OwnerId, WorkflowId, WorkflowStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for engine operations.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The workflow definition was rejected.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// No workflow with this id exists.
    #[error("Workflow not found: {id}")]
    NotFound {
        /// The requested id.
        id: WorkflowId,
    },

    /// The operation is not allowed in the workflow's current status.
    #[error("Cannot {action} workflow {id} in status '{status}'")]
    InvalidState {
        /// The workflow id.
        id: WorkflowId,
        /// The status at the time of the call.
        status: WorkflowStatus,
        /// The attempted operation.
        action: &'static str,
    },

    /// Capacity or quota is exhausted.
    #[error("{0}")]
    ResourceExhausted(#[from] ResourceError),

    /// A persistence race could not be resolved within the retry limit.
    #[error("Version conflict on workflow {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The workflow id.
        id: WorkflowId,
        /// The version the writer read.
        expected: u64,
        /// The version found in the store.
        actual: u64,
    },

    /// The repository failed.
    #[error("Repository error: {0}")]
    Repository(String),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RepositoryError> for WorkflowError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => Self::NotFound { id },
            RepositoryError::VersionConflict {
                id,
                expected,
                actual,
            } => Self::VersionConflict {
                id,
                expected,
                actual,
            },
            RepositoryError::InvalidTransition { id, from, .. } => Self::InvalidState {
                id,
                status: from,
                action: "transition",
            },
            other => Self::Repository(other.to_string()),
        }
    }
}

/// Error raised when a workflow request fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The error message.
    pub message: String,
    /// Machine readable code (e.g., "WORKFLOW-CYCLE").
    pub code: &'static str,
    /// The stages involved.
    pub stages: Vec<String>,
    /// Hint for fixing the request.
    pub fix_hint: Option<&'static str>,
}

impl ValidationError {
    /// Creates a validation error.
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            stages: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub const fn with_fix_hint(mut self, hint: &'static str) -> Self {
        self.fix_hint = Some(hint);
        self
    }

    /// The request has no stages.
    #[must_use]
    pub fn empty() -> Self {
        Self::new("WORKFLOW-EMPTY", "Workflow request has no stages")
            .with_fix_hint("Add at least one stage to the request.")
    }
}

/// Error raised when the stage graph contains a dependency cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in workflow: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub const fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for ValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self::new("WORKFLOW-CYCLE", err.to_string())
            .with_stages(err.cycle_path)
            .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
    }
}

/// Serializable classification of a stage or workflow failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable provider error.
    Transient,
    /// Non-retryable provider error.
    Permanent,
    /// The call or the workflow ran out of time.
    Timeout,
    /// Capacity or quota exhausted.
    ResourceExhausted,
    /// Aborted by a cancellation request.
    Cancelled,
    /// Interrupted by a process restart.
    Interrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Timeout => write!(f, "timeout"),
            Self::ResourceExhausted => write!(f, "resource_exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Errors returned by a stage adapter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The provider failed in a way that may succeed on retry.
    #[error("Transient stage error: {0}")]
    Transient(String),

    /// The provider rejected the work; retrying will not help.
    #[error("Permanent stage error: {0}")]
    Permanent(String),

    /// The call did not finish in time.
    #[error("Stage timed out: {0}")]
    Timeout(String),

    /// The adapter aborted the call because the workflow was cancelled.
    #[error("Stage cancelled: {0}")]
    Cancelled(String),
}

impl StageError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    /// Returns the classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Returns the message without the classification prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Permanent(m) | Self::Timeout(m) | Self::Cancelled(m) => m,
        }
    }

    /// Returns true if the retry policy may try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// Errors returned by a [`crate::repository::WorkflowRepository`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// No workflow with this id.
    #[error("Workflow not found: {0}")]
    NotFound(WorkflowId),

    /// A workflow with this id already exists.
    #[error("Workflow already exists: {0}")]
    AlreadyExists(WorkflowId),

    /// The stored version differs from the expected one.
    #[error("Version conflict on workflow {id}: expected {expected}, found {actual}")]
    VersionConflict {
        /// The workflow id.
        id: WorkflowId,
        /// The version the writer read.
        expected: u64,
        /// The stored version.
        actual: u64,
    },

    /// The status change is not allowed by the state machine.
    #[error("Invalid transition on workflow {id}: {from} -> {to}")]
    InvalidTransition {
        /// The workflow id.
        id: WorkflowId,
        /// Current status.
        from: WorkflowStatus,
        /// Requested status.
        to: WorkflowStatus,
    },

    /// The workflow has no stage with this name.
    #[error("Workflow {id} has no stage '{stage}'")]
    StageNotFound {
        /// The workflow id.
        id: WorkflowId,
        /// The stage name.
        stage: String,
    },

    /// The stage already reached a terminal status, or the workflow did.
    #[error("Stage '{stage}' of workflow {id} is immutable")]
    Immutable {
        /// The workflow id.
        id: WorkflowId,
        /// The stage name.
        stage: String,
    },

    /// The storage backend failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Errors raised by the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// Too many workflows are already waiting for capacity.
    #[error("Resource exhausted: admission queue is full ({queued}/{limit} waiting)")]
    QueueFull {
        /// Waiters currently queued.
        queued: usize,
        /// Configured queue limit.
        limit: usize,
    },

    /// The owner's stage quota cannot cover the requested cost.
    #[error("Resource exhausted: owner '{owner}' needs {requested} quota units, {remaining} left")]
    QuotaExceeded {
        /// The owner.
        owner: OwnerId,
        /// Units requested.
        requested: u64,
        /// Units remaining.
        remaining: u64,
    },

    /// The lease was already released.
    #[error("Lease for workflow {0} was already released")]
    LeaseReleased(WorkflowId),

    /// A queued request was dropped without being granted.
    #[error("Admission request for workflow {0} was abandoned")]
    Abandoned(WorkflowId),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_detected_error_converts_to_validation() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let validation: ValidationError = err.into();
        assert_eq!(validation.code, "WORKFLOW-CYCLE");
        assert_eq!(validation.stages, ["a", "b", "a"]);
        assert!(validation.fix_hint.is_some());
    }

    #[test]
    fn test_stage_error_classification() {
        assert!(StageError::transient("503").is_retryable());
        assert!(StageError::timeout("slow").is_retryable());
        assert!(!StageError::permanent("400").is_retryable());
        assert!(!StageError::Cancelled("stop".into()).is_retryable());

        assert_eq!(StageError::permanent("x").kind(), ErrorKind::Permanent);
        assert_eq!(StageError::timeout("x").message(), "x");
    }

    #[test]
    fn test_repository_error_mapping() {
        let id = WorkflowId::generate();

        let err: WorkflowError = RepositoryError::NotFound(id).into();
        assert!(matches!(err, WorkflowError::NotFound { id: found } if found == id));

        let err: WorkflowError = RepositoryError::VersionConflict {
            id,
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(matches!(err, WorkflowError::VersionConflict { expected: 1, actual: 2, .. }));

        let err: WorkflowError = RepositoryError::Backend("disk full".into()).into();
        assert!(matches!(err, WorkflowError::Repository(_)));
    }

    #[test]
    fn test_error_kind_serialize() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, r#""resource_exhausted""#);
        assert_eq!(ErrorKind::Interrupted.to_string(), "interrupted");
    }
}
