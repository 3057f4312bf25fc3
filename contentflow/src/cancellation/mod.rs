//! Cooperative cancellation.
//!
//! Workflows are cancelled by flipping a shared token; the executor checks it
//! at stage-start boundaries and races it against backoff waits, and adapters
//! may race it against their in-flight provider call.

mod token;

pub use token::CancellationToken;
