//! Core workflow types.
//!
//! This module provides:
//! - Identifiers for workflows and owners
//! - The closed set of stage types and the status state machines
//! - Workflow and stage records as persisted by a repository
//! - Workflow requests submitted by the gateway layer

mod ids;
mod request;
mod status;
mod workflow;

pub use ids::{OwnerId, WorkflowId};
pub use request::{StageRequest, WorkflowRequest};
pub use status::{StageStatus, StageType, WorkflowStatus};
pub use workflow::{FailureCause, StageErrorInfo, StageOutput, StageRecord, Workflow};

/// Timestamps used throughout the engine.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    chrono::Utc::now()
}
