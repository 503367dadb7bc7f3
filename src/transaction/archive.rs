//! Serializable transaction snapshots.

use serde::{Deserialize, Serialize};

use super::id::GlobalId;
use super::state::TransactionStatus;
use crate::branch::BranchRecord;
use crate::resource::Vote;

/// Snapshot of a transaction as persisted to the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionArchive {
    pub global_id: GlobalId,
    pub status: TransactionStatus,
    pub vote: Option<Vote>,
    pub coordinator: bool,
    pub propagated_by: Option<String>,
    /// Creation time in unix milliseconds.
    pub created_at: u64,
    pub recovered_times: u32,
    pub native_branches: Vec<BranchRecord>,
    pub remote_branches: Vec<BranchRecord>,
}

impl TransactionArchive {
    /// An archive with no branches.
    pub fn new(global_id: GlobalId, status: TransactionStatus, coordinator: bool) -> Self {
        Self {
            global_id,
            status,
            vote: None,
            coordinator,
            propagated_by: None,
            created_at: global_id.created_millis(),
            recovered_times: 0,
            native_branches: Vec::new(),
            remote_branches: Vec::new(),
        }
    }

    /// Every branch, native side first.
    pub fn branches(&self) -> impl Iterator<Item = &BranchRecord> {
        self.native_branches.iter().chain(self.remote_branches.iter())
    }

    pub fn branch_count(&self) -> usize {
        self.native_branches.len() + self.remote_branches.len()
    }

    /// Replaces the record with the same branch id, or appends it to the side its
    /// descriptor belongs to.
    pub fn apply_branch(&mut self, record: &BranchRecord) {
        let existing = self
            .native_branches
            .iter_mut()
            .chain(self.remote_branches.iter_mut())
            .find(|r| r.xid == record.xid);
        match existing {
            Some(slot) => *slot = record.clone(),
            None if record.descriptor.is_remote() => self.remote_branches.push(record.clone()),
            None => self.native_branches.push(record.clone()),
        }
    }

    /// True if a branch without two-phase support is recorded committed: the last
    /// resource took the commit decision.
    pub fn last_resource_committed(&self) -> bool {
        self.branches()
            .any(|r| r.is_last_resource() && r.committed && !r.rolledback)
    }

    /// True for a single branch driven one-phase that never reported back.
    pub fn has_incomplete_one_phase(&self) -> bool {
        self.branch_count() == 1
            && self
                .branches()
                .all(|r| r.vote.is_none() && !r.is_resolved())
    }
}
