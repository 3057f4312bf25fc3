//! Lifecycle events.
//!
//! Engine components emit named events (`workflow.started`,
//! `stage.retrying`, `resource.queued`, ...) to an injected [`EventSink`].
//! Emission never fails the caller.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names.
pub mod names {
    /// A workflow was persisted in `Pending`.
    pub const WORKFLOW_CREATED: &str = "workflow.created";
    /// A workflow was admitted and handed to the executor.
    pub const WORKFLOW_STARTED: &str = "workflow.started";
    /// All stages succeeded.
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
    /// A stage failed terminally, or the workflow was interrupted.
    pub const WORKFLOW_FAILED: &str = "workflow.failed";
    /// The workflow was cancelled.
    pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
    /// A stage attempt began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A stage attempt failed and will be retried after a delay.
    pub const STAGE_RETRYING: &str = "stage.retrying";
    /// A stage succeeded.
    pub const STAGE_SUCCEEDED: &str = "stage.succeeded";
    /// A stage failed terminally.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A workflow is waiting for capacity.
    pub const RESOURCE_QUEUED: &str = "resource.queued";
    /// A lease was granted.
    pub const RESOURCE_ACQUIRED: &str = "resource.acquired";
    /// A lease was returned.
    pub const RESOURCE_RELEASED: &str = "resource.released";
}
