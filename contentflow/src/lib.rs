//! # Contentflow
//!
//! A workflow engine for multi-stage content generation.
//!
//! A workflow is a dependency graph of stages (script, voice, image,
//! assembly), each backed by an external generator behind a
//! [`adapters::StageAdapter`]. The engine provides:
//!
//! - **Lifecycle management**: validate, persist, start and cancel workflows
//! - **Dependency-ordered execution**: stages start as soon as their
//!   dependencies succeed, independent stages run in parallel
//! - **Retries**: per stage type, exponential backoff with jitter
//! - **Admission control**: global and per-owner concurrency limits with a
//!   FIFO queue, optional per-owner quotas
//! - **Progress**: weighted percent complete and remaining-time estimates,
//!   pollable or streamed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use contentflow::prelude::*;
//!
//! let engine = WorkflowEngine::in_memory(registry);
//! let workflow = engine
//!     .initialize(WorkflowRequest::standard_video("a day at the beach"), OwnerId::from("user-1"))
//!     .await?;
//! engine.start(workflow.id).await?;
//!
//! let mut progress = engine.subscribe(workflow.id).await?;
//! while let Some(snapshot) = progress.recv().await {
//!     println!("{:.0}% ({} ms left)", snapshot.percent_complete, snapshot.estimated_remaining_ms);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod adapters;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod engine;
pub mod errors;
pub mod estimator;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod progress;
pub mod repository;
pub mod resources;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapters::{
        AdapterRegistry, StageAdapter, StageInput, StageOutput, UpstreamOutput,
    };
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        FailureCause, OwnerId, StageRecord, StageRequest, StageStatus, StageType, Workflow,
        WorkflowId, WorkflowRequest, WorkflowStatus,
    };
    pub use crate::engine::WorkflowEngine;
    pub use crate::errors::{
        ErrorKind, RepositoryError, ResourceError, StageError, ValidationError, WorkflowError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LoggingConfig};
    pub use crate::pipeline::{ExecutorConfig, RetryConfig, RetryPolicy};
    pub use crate::progress::{ProgressSnapshot, ProgressStream};
    pub use crate::repository::{InMemoryWorkflowRepository, WorkflowRepository};
    pub use crate::resources::{ResourceConfig, ResourceLease, ResourceManager};
}
