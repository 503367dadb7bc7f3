//! Branch records.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::resource::{ResourceDescriptor, Vote, XaResource};
use crate::transaction::Xid;

/// Persistent state of one branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRecord {
    pub xid: Xid,
    pub descriptor: ResourceDescriptor,
    /// Vote recorded at prepare; never requested twice.
    pub vote: Option<Vote>,
    pub committed: bool,
    pub rolledback: bool,
    pub readonly: bool,
    pub completed: bool,
    pub heuristic: bool,
}

impl BranchRecord {
    pub fn new(xid: Xid, descriptor: ResourceDescriptor) -> Self {
        Self {
            xid,
            descriptor,
            vote: None,
            committed: false,
            rolledback: false,
            readonly: false,
            completed: false,
            heuristic: false,
        }
    }

    pub fn record_vote(&mut self, vote: Vote) {
        self.vote = Some(vote);
        if vote == Vote::ReadOnly {
            self.readonly = true;
            self.completed = true;
        }
    }

    pub fn mark_committed(&mut self, heuristic: bool) {
        self.committed = true;
        self.completed = true;
        self.heuristic |= heuristic;
    }

    pub fn mark_rolledback(&mut self, heuristic: bool) {
        self.rolledback = true;
        self.completed = true;
        self.heuristic |= heuristic;
    }

    /// Part committed, part rolled back.
    pub fn mark_mixed(&mut self) {
        self.committed = true;
        self.rolledback = true;
        self.completed = true;
        self.heuristic = true;
    }

    /// Completed with an outcome nobody can tell.
    pub fn mark_hazard(&mut self) {
        self.completed = true;
        self.heuristic = true;
    }

    /// True once no further commit or rollback call is needed.
    pub fn is_resolved(&self) -> bool {
        self.completed || self.readonly
    }

    /// True for branches driven through the last-resource one-phase path.
    pub fn is_last_resource(&self) -> bool {
        !self.descriptor.two_phase
    }
}

/// A branch held by a terminator: its record and, when known, the live resource.
pub struct EnlistedBranch {
    pub record: BranchRecord,
    /// `None` when the branch was rebuilt from the log and its resource is not registered.
    pub resource: Option<Arc<dyn XaResource>>,
    /// Set once `end` was issued with success or fail.
    pub ended: bool,
    /// Set while the association is suspended.
    pub suspended: bool,
}

impl EnlistedBranch {
    pub fn new(record: BranchRecord, resource: Arc<dyn XaResource>) -> Self {
        Self {
            record,
            resource: Some(resource),
            ended: false,
            suspended: false,
        }
    }

    /// A branch rebuilt from an archive; it is no longer associated with any work.
    pub fn rehydrated(record: BranchRecord, resource: Option<Arc<dyn XaResource>>) -> Self {
        Self {
            record,
            resource,
            ended: true,
            suspended: false,
        }
    }

    /// Identity check: the same resource object, or the same resource manager.
    pub fn holds(&self, resource: &Arc<dyn XaResource>) -> bool {
        match &self.resource {
            Some(own) => Arc::ptr_eq(own, resource) || own.is_same_rm(resource.as_ref()),
            None => false,
        }
    }
}

impl std::fmt::Debug for EnlistedBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnlistedBranch")
            .field("record", &self.record)
            .field("attached", &self.resource.is_some())
            .field("ended", &self.ended)
            .field("suspended", &self.suspended)
            .finish()
    }
}
