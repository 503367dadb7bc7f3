//! Terminator for exactly one branch, without collection overhead.

use super::driver;
use super::outcome::{CompletionTally, PrepareOutcome};
use super::record::{BranchRecord, EnlistedBranch};
use super::{BranchContext, Terminator};
use crate::resource::Vote;

/// Terminator holding at most one branch.
#[derive(Debug, Default)]
pub struct SingleTerminator {
    branch: Option<EnlistedBranch>,
}

impl SingleTerminator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Terminator for SingleTerminator {
    fn len(&self) -> usize {
        usize::from(self.branch.is_some())
    }

    fn push(&mut self, branch: EnlistedBranch) -> Result<(), EnlistedBranch> {
        if self.branch.is_some() {
            return Err(branch);
        }
        self.branch = Some(branch);
        Ok(())
    }

    fn take_all(&mut self) -> Vec<EnlistedBranch> {
        self.branch.take().into_iter().collect()
    }

    fn find_mut(
        &mut self,
        pred: &dyn Fn(&EnlistedBranch) -> bool,
    ) -> Option<&mut EnlistedBranch> {
        self.branch.as_mut().filter(|b| pred(b))
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut EnlistedBranch)) {
        if let Some(branch) = self.branch.as_mut() {
            f(branch);
        }
    }

    fn records(&self) -> Vec<BranchRecord> {
        self.branch.iter().map(|b| b.record.clone()).collect()
    }

    fn prepare_two_phase(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        match self.branch.as_mut() {
            Some(branch) if !branch.record.is_last_resource() => {
                match driver::prepare_branch(branch, ctx) {
                    Ok(vote) => PrepareOutcome::Vote(vote),
                    Err(cause) => PrepareOutcome::RollbackRequired { cause },
                }
            }
            _ => PrepareOutcome::Vote(Vote::ReadOnly),
        }
    }

    fn prepare_last_resource(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        match self.branch.as_mut() {
            Some(branch) if branch.record.is_last_resource() => {
                match driver::commit_last_resource(branch, ctx) {
                    Ok(vote) => PrepareOutcome::Vote(vote),
                    Err(cause) => PrepareOutcome::RollbackRequired { cause },
                }
            }
            _ => PrepareOutcome::Vote(Vote::ReadOnly),
        }
    }

    fn commit(&mut self, ctx: &BranchContext<'_>, one_phase: bool) -> CompletionTally {
        let mut tally = CompletionTally::default();
        match self.branch.as_mut() {
            Some(branch) => driver::commit_branch(branch, ctx, one_phase, &mut tally),
            None if one_phase => {
                log::error!("{}: one-phase commit requested with no branch", ctx.global_id)
            }
            None => {}
        }
        tally
    }

    fn rollback(&mut self, ctx: &BranchContext<'_>) -> CompletionTally {
        let mut tally = CompletionTally::default();
        if let Some(branch) = self.branch.as_mut() {
            driver::rollback_branch(branch, ctx, &mut tally);
        }
        tally
    }

    fn forget(&self) {
        if let Some(branch) = &self.branch {
            driver::forget_branch(branch);
        }
    }
}
