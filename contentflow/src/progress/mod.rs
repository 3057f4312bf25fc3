//! Progress snapshots and their publish/subscribe channel.

mod snapshot;
mod tracker;

pub use snapshot::ProgressSnapshot;
pub use tracker::{ProgressStream, ProgressTracker, DEFAULT_FINISHED_RETENTION};
