//! General terminator over any number of branches.

use super::driver;
use super::outcome::{CompletionTally, PrepareOutcome};
use super::record::{BranchRecord, EnlistedBranch};
use super::{BranchContext, Terminator};
use crate::resource::Vote;

/// Terminator holding branches in enlistment order.
#[derive(Debug, Default)]
pub struct MultiTerminator {
    branches: Vec<EnlistedBranch>,
}

impl MultiTerminator {
    pub fn from_branches(branches: Vec<EnlistedBranch>) -> Self {
        Self { branches }
    }

    fn last_resource_count(&self) -> usize {
        self.branches
            .iter()
            .filter(|b| b.record.is_last_resource())
            .count()
    }
}

impl Terminator for MultiTerminator {
    fn len(&self) -> usize {
        self.branches.len()
    }

    fn push(&mut self, branch: EnlistedBranch) -> Result<(), EnlistedBranch> {
        self.branches.push(branch);
        Ok(())
    }

    fn take_all(&mut self) -> Vec<EnlistedBranch> {
        std::mem::take(&mut self.branches)
    }

    fn find_mut(
        &mut self,
        pred: &dyn Fn(&EnlistedBranch) -> bool,
    ) -> Option<&mut EnlistedBranch> {
        self.branches.iter_mut().find(|b| pred(b))
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut EnlistedBranch)) {
        for branch in self.branches.iter_mut() {
            f(branch);
        }
    }

    fn records(&self) -> Vec<BranchRecord> {
        self.branches.iter().map(|b| b.record.clone()).collect()
    }

    fn prepare_two_phase(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        let last_resources = self.last_resource_count();
        if last_resources > 1 {
            log::warn!(
                "{}: {} branches lack two-phase support, only one can commit last",
                ctx.global_id,
                last_resources
            );
            return PrepareOutcome::rollback(format!(
                "{} one-phase resources enlisted",
                last_resources
            ));
        }

        let mut voted_ok = false;
        for branch in self
            .branches
            .iter_mut()
            .filter(|b| !b.record.is_last_resource())
        {
            match driver::prepare_branch(branch, ctx) {
                Ok(Vote::Ok) => voted_ok = true,
                Ok(Vote::ReadOnly) => {}
                Err(cause) => return PrepareOutcome::RollbackRequired { cause },
            }
        }

        PrepareOutcome::Vote(if voted_ok { Vote::Ok } else { Vote::ReadOnly })
    }

    fn prepare_last_resource(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome {
        match self
            .branches
            .iter_mut()
            .find(|b| b.record.is_last_resource())
        {
            Some(branch) => match driver::commit_last_resource(branch, ctx) {
                Ok(vote) => PrepareOutcome::Vote(vote),
                Err(cause) => PrepareOutcome::RollbackRequired { cause },
            },
            None => PrepareOutcome::Vote(Vote::ReadOnly),
        }
    }

    fn commit(&mut self, ctx: &BranchContext<'_>, one_phase: bool) -> CompletionTally {
        if one_phase && self.branches.len() != 1 {
            log::error!(
                "{}: one-phase commit requested over {} branches, rolling back",
                ctx.global_id,
                self.branches.len()
            );
            return self.rollback(ctx);
        }

        let mut tally = CompletionTally::default();
        for branch in self.branches.iter_mut() {
            driver::commit_branch(branch, ctx, one_phase, &mut tally);
        }
        tally
    }

    fn rollback(&mut self, ctx: &BranchContext<'_>) -> CompletionTally {
        let mut tally = CompletionTally::default();
        for branch in self.branches.iter_mut() {
            driver::rollback_branch(branch, ctx, &mut tally);
        }
        tally
    }

    fn forget(&self) {
        for branch in &self.branches {
            driver::forget_branch(branch);
        }
    }
}
