//! Execution leases.

use super::ResourceManager;
use crate::core::{OwnerId, Timestamp, WorkflowId};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// A workflow's execution slot.
///
/// Returned to the manager by [`ResourceLease::release`] or on drop,
/// whichever happens first.
pub struct ResourceLease {
    workflow_id: WorkflowId,
    owner_id: OwnerId,
    acquired_at: Timestamp,
    quota_consumed: AtomicU64,
    released: AtomicBool,
    manager: ResourceManager,
}

impl ResourceLease {
    pub(super) fn new(
        workflow_id: WorkflowId,
        owner_id: OwnerId,
        acquired_at: Timestamp,
        manager: ResourceManager,
    ) -> Self {
        Self {
            workflow_id,
            owner_id,
            acquired_at,
            quota_consumed: AtomicU64::new(0),
            released: AtomicBool::new(false),
            manager,
        }
    }

    /// The workflow holding the lease.
    #[must_use]
    pub const fn workflow_id(&self) -> WorkflowId {
        self.workflow_id
    }

    /// The owner the slot is counted against.
    #[must_use]
    pub const fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// When the slot was granted.
    #[must_use]
    pub const fn acquired_at(&self) -> Timestamp {
        self.acquired_at
    }

    /// Quota units charged through this lease.
    #[must_use]
    pub fn quota_consumed(&self) -> u64 {
        self.quota_consumed.load(Ordering::Acquire)
    }

    /// Returns true once the slot has been given back.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Gives the slot back. Only the first call has an effect.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.manager.return_slot(self);
        true
    }

    pub(super) fn add_quota(&self, units: u64) {
        self.quota_consumed.fetch_add(units, Ordering::AcqRel);
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if !self.is_released() {
            tracing::debug!(workflow_id = %self.workflow_id, "Lease dropped without release");
        }
        self.release();
    }
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease")
            .field("workflow_id", &self.workflow_id)
            .field("owner_id", &self.owner_id)
            .field("acquired_at", &self.acquired_at)
            .field("quota_consumed", &self.quota_consumed())
            .field("released", &self.is_released())
            .finish()
    }
}
