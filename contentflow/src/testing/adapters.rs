//! Scripted stage adapter.

use crate::adapters::{StageAdapter, StageInput, StageOutput};
use crate::core::StageType;
use crate::errors::StageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// One recorded adapter call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    /// Stage name from the input.
    pub stage: String,
    /// Attempt number from the input.
    pub attempt: u32,
    /// When the call began.
    pub started: Instant,
    /// When the call returned.
    pub finished: Instant,
    /// Whether it returned an output.
    pub succeeded: bool,
}

/// An adapter that sleeps, then fails or succeeds as scripted.
///
/// Queued failures are returned first, one per call, before the adapter
/// starts succeeding. Sleeps use tokio time, so paused-clock tests run
/// instantly.
#[derive(Debug)]
pub struct ScriptedAdapter {
    stage_type: StageType,
    delay: Duration,
    failures: Mutex<VecDeque<StageError>>,
    always_fail: Option<StageError>,
    calls: Mutex<Vec<CallRecord>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    /// Creates an adapter that succeeds immediately.
    #[must_use]
    pub fn new(stage_type: StageType) -> Self {
        Self {
            stage_type,
            delay: Duration::ZERO,
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sets the simulated latency.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails the next `times` calls with `error`.
    #[must_use]
    pub fn failing(self, times: usize, error: StageError) -> Self {
        self.failures.lock().extend(std::iter::repeat(error).take(times));
        self
    }

    /// Fails every call with `error`.
    #[must_use]
    pub fn always_failing(mut self, error: StageError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// Returns all calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of concurrent calls observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageAdapter for ScriptedAdapter {
    fn stage_type(&self) -> StageType {
        self.stage_type
    }

    async fn execute(&self, input: StageInput) -> Result<StageOutput, StageError> {
        let started = Instant::now();
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let result = if input.cancel.sleep(self.delay).await {
            let queued = self.failures.lock().pop_front();
            match queued.or_else(|| self.always_fail.clone()) {
                Some(error) => Err(error),
                None => Ok(StageOutput::new(format!(
                    "{}://{}/{}",
                    self.stage_type, input.workflow_id, input.stage_name
                ))
                .with_metadata(serde_json::json!({ "attempt": input.attempt }))),
            }
        } else {
            Err(StageError::Cancelled("aborted by cancellation".to_string()))
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().push(CallRecord {
            stage: input.stage_name,
            attempt: input.attempt,
            started,
            finished: Instant::now(),
            succeeded: result.is_ok(),
        });
        result
    }
}
