//! Per-workflow progress fan-out.
//!
//! Every subscriber gets its own unbounded channel, so a slow reader never
//! loses a snapshot and never blocks the publisher. The terminal snapshot
//! closes all channels after delivery.

use super::ProgressSnapshot;
use crate::core::{WorkflowId, WorkflowStatus};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Finished workflows whose terminal snapshot stays cached by default.
pub const DEFAULT_FINISHED_RETENTION: usize = 1024;

#[derive(Default)]
struct Entry {
    latest: Option<ProgressSnapshot>,
    subscribers: Vec<mpsc::UnboundedSender<ProgressSnapshot>>,
}

struct State {
    entries: HashMap<WorkflowId, Entry>,
    /// Terminal workflows, oldest first.
    finished: VecDeque<WorkflowId>,
    retention: usize,
}

impl State {
    fn entry(&mut self, workflow_id: WorkflowId) -> &mut Entry {
        self.entries.entry(workflow_id).or_default()
    }

    /// Records a terminal workflow and evicts the oldest ones past the
    /// retention limit.
    fn mark_finished(&mut self, workflow_id: WorkflowId) {
        self.finished.push_back(workflow_id);
        while self.finished.len() > self.retention {
            if let Some(evicted) = self.finished.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }
}

/// Publishes progress snapshots and fans them out to subscribers.
///
/// Terminal snapshots of the most recent finished workflows stay cached;
/// older ones are dropped and must be recomputed from the persisted record.
pub struct ProgressTracker {
    state: Mutex<State>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::with_retention(DEFAULT_FINISHED_RETENTION)
    }
}

impl ProgressTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracker that caches at most `retention` finished workflows.
    #[must_use]
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                finished: VecDeque::new(),
                retention,
            }),
        }
    }

    /// Publishes a snapshot and returns the stored version of it.
    ///
    /// Percent never decreases and `Completed` always reports 100. Once a
    /// terminal snapshot is stored, later publishes are ignored and the
    /// stored terminal snapshot is returned.
    pub fn publish(&self, mut snapshot: ProgressSnapshot) -> ProgressSnapshot {
        let mut state = self.state.lock();
        let workflow_id = snapshot.workflow_id;
        let entry = state.entry(workflow_id);

        if let Some(latest) = &entry.latest {
            if latest.is_terminal() {
                tracing::debug!(
                    workflow_id = %snapshot.workflow_id,
                    "Ignoring progress published after terminal snapshot"
                );
                return latest.clone();
            }
            snapshot.percent_complete = snapshot.percent_complete.max(latest.percent_complete);
            snapshot.sequence = latest.sequence + 1;
        }
        if snapshot.status == WorkflowStatus::Completed {
            snapshot.percent_complete = 100.0;
            snapshot.estimated_remaining_ms = 0;
        }
        if snapshot.is_terminal() {
            snapshot.estimated_remaining_ms = 0;
        }

        entry
            .subscribers
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        entry.latest = Some(snapshot.clone());
        if snapshot.is_terminal() {
            entry.subscribers.clear();
            state.mark_finished(workflow_id);
        }
        snapshot
    }

    /// Stores `snapshot` as the first snapshot unless one already exists.
    pub fn ensure(&self, snapshot: ProgressSnapshot) -> ProgressSnapshot {
        let mut state = self.state.lock();
        Self::ensure_locked(&mut state, snapshot)
    }

    fn ensure_locked(state: &mut State, snapshot: ProgressSnapshot) -> ProgressSnapshot {
        let workflow_id = snapshot.workflow_id;
        let entry = state.entry(workflow_id);
        if let Some(latest) = &entry.latest {
            return latest.clone();
        }
        entry.latest = Some(snapshot.clone());
        if snapshot.is_terminal() {
            state.mark_finished(workflow_id);
        }
        snapshot
    }

    /// Returns the latest snapshot, if any is cached.
    #[must_use]
    pub fn latest(&self, workflow_id: WorkflowId) -> Option<ProgressSnapshot> {
        self.state
            .lock()
            .entries
            .get(&workflow_id)
            .and_then(|entry| entry.latest.clone())
    }

    /// Subscribes to a workflow's snapshots. `current` seeds the cache when
    /// nothing is cached for the workflow.
    ///
    /// The stream yields the latest snapshot first, then every later one in
    /// publish order, and ends after the terminal snapshot.
    pub fn subscribe(&self, current: ProgressSnapshot) -> ProgressStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let workflow_id = current.workflow_id;
        let mut state = self.state.lock();
        let latest = Self::ensure_locked(&mut state, current);

        let terminal = latest.is_terminal();
        let _ = tx.send(latest);
        if !terminal {
            state.entry(workflow_id).subscribers.push(tx);
        }
        ProgressStream { rx }
    }

    /// Number of open subscriptions for a workflow.
    #[must_use]
    pub fn subscriber_count(&self, workflow_id: WorkflowId) -> usize {
        self.state
            .lock()
            .entries
            .get(&workflow_id)
            .map_or(0, |entry| {
                entry.subscribers.iter().filter(|tx| !tx.is_closed()).count()
            })
    }

    /// Number of workflows with cached state.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("workflows", &self.tracked_count())
            .finish()
    }
}

/// Stream of snapshots for one workflow.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressSnapshot>,
}

impl ProgressStream {
    /// Waits for the next snapshot. Returns `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ProgressSnapshot> {
        self.rx.recv().await
    }

    /// Drains the stream and returns the final snapshot.
    pub async fn last(mut self) -> Option<ProgressSnapshot> {
        let mut last = None;
        while let Some(snapshot) = self.rx.recv().await {
            last = Some(snapshot);
        }
        last
    }
}

impl Stream for ProgressStream {
    type Item = ProgressSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
