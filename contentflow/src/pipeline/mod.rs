//! Stage graph validation, retry policy and workflow execution.
//!
//! This module provides:
//! - Request validation (names, types, dependencies, cycles)
//! - Deterministic topological ordering
//! - Exponential backoff with jitter, per stage type
//! - The executor that drives one workflow's stage graph

mod executor;
mod graph;
mod retry;

pub use executor::{ExecutorConfig, PipelineExecutor};
pub use graph::{topological_order, validate_request};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
