//! Global and per-owner admission control.
//!
//! All counters live behind one mutex. Waiters queue in arrival order; when
//! a slot frees, the first waiter whose owner is under its own cap gets it,
//! so one saturated owner never blocks the others.

use super::{ResourceConfig, ResourceLease};
use crate::core::{now_utc, OwnerId, StageType, WorkflowId};
use crate::errors::ResourceError;
use crate::events::{names, EventSink, NoOpEventSink};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

struct Waiter {
    owner: OwnerId,
    workflow_id: WorkflowId,
    tx: oneshot::Sender<ResourceLease>,
}

#[derive(Default)]
struct State {
    active: usize,
    per_owner: HashMap<OwnerId, usize>,
    waiters: VecDeque<Waiter>,
    quota_used: HashMap<OwnerId, u64>,
}

impl State {
    fn owner_active(&self, owner: &OwnerId) -> usize {
        self.per_owner.get(owner).copied().unwrap_or(0)
    }

    fn has_capacity(&self, owner: &OwnerId, config: &ResourceConfig) -> bool {
        self.active < config.max_concurrent_workflows && self.owner_active(owner) < config.max_per_owner
    }

    fn admit(&mut self, owner: &OwnerId) {
        self.active += 1;
        *self.per_owner.entry(owner.clone()).or_insert(0) += 1;
    }

    fn free(&mut self, owner: &OwnerId) {
        self.active = self.active.saturating_sub(1);
        if let Some(count) = self.per_owner.get_mut(owner) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_owner.remove(owner);
            }
        }
    }
}

type Grant = (oneshot::Sender<ResourceLease>, ResourceLease);

struct Inner {
    config: ResourceConfig,
    state: Mutex<State>,
    events: Arc<dyn EventSink>,
}

/// Bounds how many workflows run at once and charges owner quotas.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<Inner>,
}

impl ResourceManager {
    /// Creates a manager with the given limits.
    #[must_use]
    pub fn new(config: ResourceConfig) -> Self {
        Self::with_events(config, Arc::new(NoOpEventSink))
    }

    /// Creates a manager that reports `resource.*` events to `events`.
    #[must_use]
    pub fn with_events(config: ResourceConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                events,
            }),
        }
    }

    /// The configured limits.
    #[must_use]
    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Acquires an execution slot, waiting in the admission queue when the
    /// global or per-owner limit is reached.
    ///
    /// Dropping the returned future gives up the place in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError::QueueFull`] without waiting when the queue
    /// already holds `max_queue_depth` waiters.
    pub async fn acquire(
        &self,
        owner: &OwnerId,
        workflow_id: WorkflowId,
    ) -> Result<ResourceLease, ResourceError> {
        let config = &self.inner.config;
        let (rx, position) = {
            let mut state = self.inner.state.lock();
            state.waiters.retain(|w| !w.tx.is_closed());

            if state.has_capacity(owner, config) {
                state.admit(owner);
                drop(state);
                self.announce_acquired(owner, workflow_id);
                return Ok(ResourceLease::new(workflow_id, owner.clone(), now_utc(), self.clone()));
            }

            if let Some(limit) = config.max_queue_depth {
                if state.waiters.len() >= limit {
                    return Err(ResourceError::QueueFull {
                        queued: state.waiters.len(),
                        limit,
                    });
                }
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                owner: owner.clone(),
                workflow_id,
                tx,
            });
            (rx, state.waiters.len())
        };

        debug!(workflow_id = %workflow_id, owner_id = %owner, position, "Waiting for capacity");
        self.inner.events.try_emit(
            names::RESOURCE_QUEUED,
            Some(json!({
                "workflow_id": workflow_id,
                "owner_id": owner,
                "position": position,
            })),
        );

        rx.await.map_err(|_| ResourceError::Abandoned(workflow_id))
    }

    /// Charges the quota cost of starting one `stage_type` stage to the
    /// lease's owner.
    ///
    /// # Errors
    ///
    /// [`ResourceError::QuotaExceeded`] when the owner's remaining budget is
    /// smaller than the cost; nothing is charged in that case.
    pub fn charge(&self, lease: &ResourceLease, stage_type: StageType) -> Result<(), ResourceError> {
        if lease.is_released() {
            return Err(ResourceError::LeaseReleased(lease.workflow_id()));
        }
        let cost = self.inner.config.cost_of(stage_type);
        if let Some(quota) = self.inner.config.owner_quota {
            let mut state = self.inner.state.lock();
            let used = state.quota_used.entry(lease.owner_id().clone()).or_insert(0);
            let remaining = quota.saturating_sub(*used);
            if cost > remaining {
                return Err(ResourceError::QuotaExceeded {
                    owner: lease.owner_id().clone(),
                    requested: cost,
                    remaining,
                });
            }
            *used += cost;
        }
        lease.add_quota(cost);
        Ok(())
    }

    /// Gives a lease back. Same as [`ResourceLease::release`].
    pub fn release(&self, lease: &ResourceLease) -> bool {
        lease.release()
    }

    /// Workflows currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Slots held by one owner.
    #[must_use]
    pub fn active_for(&self, owner: &OwnerId) -> usize {
        self.inner.state.lock().owner_active(owner)
    }

    /// Requests waiting in the admission queue.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    /// Quota left for an owner, or `None` when quotas are disabled.
    #[must_use]
    pub fn quota_remaining(&self, owner: &OwnerId) -> Option<u64> {
        let quota = self.inner.config.owner_quota?;
        let used = self.inner.state.lock().quota_used.get(owner).copied().unwrap_or(0);
        Some(quota.saturating_sub(used))
    }

    /// Restores an owner's full quota.
    pub fn reset_quota(&self, owner: &OwnerId) {
        self.inner.state.lock().quota_used.remove(owner);
    }

    /// Called by the lease on its first release.
    pub(super) fn return_slot(&self, lease: &ResourceLease) {
        let grants = {
            let mut state = self.inner.state.lock();
            state.free(lease.owner_id());
            self.take_grants(&mut state)
        };
        debug!(workflow_id = %lease.workflow_id(), owner_id = %lease.owner_id(), "Lease released");
        self.inner.events.try_emit(
            names::RESOURCE_RELEASED,
            Some(json!({
                "workflow_id": lease.workflow_id(),
                "owner_id": lease.owner_id(),
                "quota_consumed": lease.quota_consumed(),
            })),
        );
        self.deliver(grants);
    }

    fn take_grants(&self, state: &mut State) -> Vec<Grant> {
        let config = &self.inner.config;
        let mut grants = Vec::new();
        let mut index = 0;
        while index < state.waiters.len() && state.active < config.max_concurrent_workflows {
            let waiter = &state.waiters[index];
            if waiter.tx.is_closed() {
                state.waiters.remove(index);
                continue;
            }
            if state.owner_active(&waiter.owner) >= config.max_per_owner {
                index += 1;
                continue;
            }
            if let Some(waiter) = state.waiters.remove(index) {
                state.admit(&waiter.owner);
                let lease = ResourceLease::new(waiter.workflow_id, waiter.owner, now_utc(), self.clone());
                grants.push((waiter.tx, lease));
            }
        }
        grants
    }

    fn deliver(&self, grants: Vec<Grant>) {
        for (tx, lease) in grants {
            let owner = lease.owner_id().clone();
            let workflow_id = lease.workflow_id();
            // A rejected lease drops here and frees its slot for the next waiter.
            if tx.send(lease).is_ok() {
                self.announce_acquired(&owner, workflow_id);
            } else {
                debug!(workflow_id = %workflow_id, "Waiter left the queue before admission");
            }
        }
    }

    fn announce_acquired(&self, owner: &OwnerId, workflow_id: WorkflowId) {
        debug!(workflow_id = %workflow_id, owner_id = %owner, "Lease acquired");
        self.inner.events.try_emit(
            names::RESOURCE_ACQUIRED,
            Some(json!({ "workflow_id": workflow_id, "owner_id": owner })),
        );
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourceManager")
            .field("config", &self.inner.config)
            .field("active", &state.active)
            .field("queued", &state.waiters.len())
            .finish_non_exhaustive()
    }
}
