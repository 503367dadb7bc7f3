//! Branch management.
//!
//! A branch manager (terminator) drives the two-phase protocol over the branches
//! enlisted on one side of a transaction:
//! - Prepare, including the last-resource one-phase optimization
//! - Commit (one-phase or two-phase) and rollback, persisting every branch outcome
//! - Forget for heuristically completed branches
//! - Bulk suspend/resume/delist that never stops at the first failing branch
//!
//! Two terminator shapes exist: a general multi-branch one and a single-branch one
//! used while only one branch is enlisted.

mod driver;
pub mod manager;
pub mod multi;
pub mod outcome;
pub mod record;
pub mod single;

pub use manager::{BranchManager, Enlistment, Side};
pub use multi::MultiTerminator;
pub use outcome::{BranchOutcome, CompletionTally, PrepareOutcome, RoundResult};
pub use record::{BranchRecord, EnlistedBranch};
pub use single::SingleTerminator;

use crate::transaction::GlobalId;
use crate::txlog::TransactionStore;

/// What a terminator needs to know about the transaction it works for.
pub struct BranchContext<'a> {
    pub global_id: GlobalId,
    pub store: &'a dyn TransactionStore,
    /// Set while recovery re-drives the transaction; tolerates replayed outcomes.
    pub recovery: bool,
}

/// Protocol operations shared by both terminator shapes.
pub trait Terminator: Send {
    /// Number of enlisted branches.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a branch. Hands the branch back if this shape cannot hold another one.
    fn push(&mut self, branch: EnlistedBranch) -> Result<(), EnlistedBranch>;

    /// Removes and returns every branch, in enlistment order.
    fn take_all(&mut self) -> Vec<EnlistedBranch>;

    /// Returns the first branch matching `pred`.
    fn find_mut(
        &mut self,
        pred: &dyn Fn(&EnlistedBranch) -> bool,
    ) -> Option<&mut EnlistedBranch>;

    /// Visits every branch in enlistment order.
    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut EnlistedBranch));

    /// Snapshot of the branch records, in enlistment order.
    fn records(&self) -> Vec<BranchRecord>;

    /// Prepares every two-phase branch that has not voted yet.
    fn prepare_two_phase(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome;

    /// Commits the branch lacking two-phase support, if any, in place of prepare.
    fn prepare_last_resource(&mut self, ctx: &BranchContext<'_>) -> PrepareOutcome;

    /// Commits the side. `one_phase` requires exactly one branch.
    fn commit(&mut self, ctx: &BranchContext<'_>, one_phase: bool) -> CompletionTally;

    /// Rolls back the side.
    fn rollback(&mut self, ctx: &BranchContext<'_>) -> CompletionTally;

    /// Forgets heuristically completed branches.
    fn forget(&self);
}
