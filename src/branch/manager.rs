//! Branch manager for one side of a transaction.

use std::sync::Arc;

use super::multi::MultiTerminator;
use super::outcome::{CompletionTally, PrepareOutcome};
use super::record::{BranchRecord, EnlistedBranch};
use super::single::SingleTerminator;
use super::{BranchContext, Terminator};
use crate::resource::{
    ResourceDescriptor, ResourceRegistry, Vote, XaError, XaFlags, XaResource, XaResult,
};
use crate::transaction::Xid;

/// Which side of the transaction a manager drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Directly attached resources.
    Native,
    /// Participants reached through peer coordinators.
    Remote,
}

/// Result of enlisting a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enlistment {
    pub xid: Xid,
    /// True if the resource joined a branch that was already enlisted.
    pub joined: bool,
}

/// Owns the terminator of one side and switches from the single-branch shape to the
/// multi-branch one when a second branch is enlisted.
pub struct BranchManager {
    side: Side,
    terminator: Box<dyn Terminator>,
}

impl BranchManager {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            terminator: Box::new(SingleTerminator::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.terminator.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terminator.is_empty()
    }

    pub fn records(&self) -> Vec<BranchRecord> {
        self.terminator.records()
    }

    fn add(&mut self, branch: EnlistedBranch) {
        if let Err(branch) = self.terminator.push(branch) {
            let mut multi = MultiTerminator::from_branches(self.terminator.take_all());
            let _ = multi.push(branch);
            log::debug!("{:?} side now holds {} branches", self.side, multi.len());
            self.terminator = Box::new(multi);
        }
    }

    /// Enlists `resource`. A resource that is already enlisted, or that talks to the
    /// same resource manager as an enlisted one, joins the existing branch.
    pub fn enlist(
        &mut self,
        resource: Arc<dyn XaResource>,
        descriptor: ResourceDescriptor,
        next_xid: impl FnOnce() -> Xid,
    ) -> XaResult<Enlistment> {
        if let Some(branch) = self.terminator.find_mut(&|b| b.holds(&resource)) {
            let xid = branch.record.xid;
            if branch.ended {
                resource.start(&xid, XaFlags::JOIN)?;
                branch.ended = false;
            } else if branch.suspended {
                resource.start(&xid, XaFlags::RESUME)?;
                branch.suspended = false;
            }
            return Ok(Enlistment { xid, joined: true });
        }

        let xid = next_xid();
        resource.start(&xid, XaFlags::NO_FLAGS)?;
        self.add(EnlistedBranch::new(
            BranchRecord::new(xid, descriptor),
            resource,
        ));
        Ok(Enlistment { xid, joined: false })
    }

    /// Ends the association of `resource` with `flags`. Returns false if the resource
    /// is not enlisted on this side.
    pub fn delist(&mut self, resource: &Arc<dyn XaResource>, flags: XaFlags) -> XaResult<bool> {
        let Some(branch) = self.terminator.find_mut(&|b| b.holds(resource)) else {
            return Ok(false);
        };
        if branch.ended {
            return Ok(true);
        }
        resource.end(&branch.record.xid, flags)?;
        if flags.contains(XaFlags::SUSPEND) {
            branch.suspended = true;
        } else {
            branch.ended = true;
            branch.suspended = false;
        }
        Ok(true)
    }

    /// Suspends every active association. Every branch is attempted.
    pub fn suspend_all(&mut self) -> Vec<XaError> {
        self.bulk(|branch| {
            if branch.ended || branch.suspended {
                return None;
            }
            let resource = branch.resource.as_ref()?;
            match resource.end(&branch.record.xid, XaFlags::SUSPEND) {
                Ok(()) => {
                    branch.suspended = true;
                    None
                }
                Err(e) => Some(e),
            }
        })
    }

    /// Resumes every suspended association. Every branch is attempted.
    pub fn resume_all(&mut self) -> Vec<XaError> {
        self.bulk(|branch| {
            if !branch.suspended {
                return None;
            }
            let resource = branch.resource.as_ref()?;
            match resource.start(&branch.record.xid, XaFlags::RESUME) {
                Ok(()) => {
                    branch.suspended = false;
                    None
                }
                Err(e) => Some(e),
            }
        })
    }

    /// Ends every association with `flags`. Every branch is attempted.
    pub fn delist_all(&mut self, flags: XaFlags) -> Vec<XaError> {
        self.bulk(|branch| {
            if branch.ended {
                return None;
            }
            let resource = branch.resource.as_ref()?;
            let result = resource.end(&branch.record.xid, flags);
            branch.ended = true;
            branch.suspended = false;
            result.err()
        })
    }

    fn bulk(
        &mut self,
        mut op: impl FnMut(&mut EnlistedBranch) -> Option<XaError>,
    ) -> Vec<XaError> {
        let mut failures = Vec::new();
        self.terminator.for_each_mut(&mut |branch| {
            if let Some(e) = op(branch) {
                log::warn!("branch {} failed bulk operation: {}", branch.record.xid, e);
                failures.push(e);
            }
        });
        failures
    }

    /// Prepares the side: two-phase branches first, the last resource after them.
    pub fn prepare(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        let two_phase = match self.terminator.prepare_two_phase(ctx) {
            PrepareOutcome::Vote(vote) => vote,
            declined => return declined,
        };
        match self.terminator.prepare_last_resource(ctx) {
            PrepareOutcome::Vote(Vote::Ok) => PrepareOutcome::Vote(Vote::Ok),
            PrepareOutcome::Vote(Vote::ReadOnly) => PrepareOutcome::Vote(two_phase),
            declined => declined,
        }
    }

    /// Prepares only the branches that support two-phase commit.
    pub fn prepare_two_phase(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        self.terminator.prepare_two_phase(ctx)
    }

    /// Commits the last resource, if this side holds one.
    pub fn prepare_last_resource(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        self.terminator.prepare_last_resource(ctx)
    }

    /// Returns true if a branch without two-phase support is enlisted.
    pub fn has_last_resource(&self) -> bool {
        self.records().iter().any(|r| r.is_last_resource())
    }

    pub fn commit(&mut self, ctx: &BranchContext<'_>, one_phase: bool) -> CompletionTally {
        self.terminator.commit(ctx, one_phase)
    }

    pub fn rollback(&mut self, ctx: &BranchContext<'_>) -> CompletionTally {
        self.terminator.rollback(ctx)
    }

    pub fn forget(&self) {
        self.terminator.forget();
    }

    /// Replaces the branches with records read from an archive, resolving each
    /// resource through the registry.
    pub fn rehydrate(&mut self, records: Vec<BranchRecord>, registry: &ResourceRegistry) {
        self.terminator.take_all();
        self.terminator = Box::new(SingleTerminator::new());
        for record in records {
            let resource = registry.lookup(&record.descriptor);
            if resource.is_none() {
                log::warn!(
                    "branch {}: resource {} is not registered",
                    record.xid,
                    record.descriptor.identifier
                );
            }
            self.add(EnlistedBranch::rehydrated(record, resource));
        }
    }
}

impl std::fmt::Debug for BranchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchManager")
            .field("side", &self.side)
            .field("branches", &self.records())
            .finish()
    }
}
