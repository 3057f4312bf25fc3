//! Test doubles and fixtures.
//!
//! [`ScriptedAdapter`] stands in for a real generator with configurable
//! latency and failures; the fixtures build common workflow shapes.

mod adapters;
mod fixtures;

pub use adapters::{CallRecord, ScriptedAdapter};
pub use fixtures::{diamond_request, linear_request, scripted_registry};
