//! Protocol calls against a single branch.
//!
//! Both terminator shapes go through these functions so a branch is driven the
//! same way whether it is alone on its side or one of many.

use super::outcome::{BranchOutcome, CompletionTally};
use super::record::{BranchRecord, EnlistedBranch};
use super::BranchContext;
use crate::resource::{Vote, XaErrorKind};

/// Writes the branch record through to the store. A failure is logged; the terminal
/// archive written by the transaction carries the same information.
fn persist(ctx: &BranchContext<'_>, record: &BranchRecord) {
    if let Err(e) = ctx.store.update_resource(&ctx.global_id, record) {
        log::error!(
            "failed to persist branch {} of {}: {}",
            record.xid,
            ctx.global_id,
            e
        );
    }
}

/// Adds an already resolved record to the tally.
fn count_resolved(record: &BranchRecord, tally: &mut CompletionTally) {
    if record.readonly {
        tally.read_only += 1;
        return;
    }
    match (record.committed, record.rolledback) {
        (true, true) => tally.mixed += 1,
        (true, false) => tally.committed += 1,
        (false, true) => tally.rolled_back += 1,
        (false, false) => tally.hazard += 1,
    }
    if record.heuristic {
        tally.heuristic += 1;
    }
}

/// Applies a heuristic or rollback report to the record. Returns false for kinds
/// that leave the branch unresolved.
fn apply_reported(record: &mut BranchRecord, kind: XaErrorKind) -> bool {
    match BranchOutcome::from(kind) {
        BranchOutcome::RollbackRequired => record.mark_rolledback(false),
        BranchOutcome::HeuristicRollback => record.mark_rolledback(true),
        BranchOutcome::HeuristicCommit => record.mark_committed(true),
        BranchOutcome::HeuristicMixed => record.mark_mixed(),
        BranchOutcome::HeuristicHazard => record.mark_hazard(),
        _ => return false,
    }
    true
}

/// Prepares one two-phase branch. A vote already on record is returned as is.
pub(super) fn prepare_branch(
    branch: &mut EnlistedBranch,
    ctx: &BranchContext<'_>,
) -> Result<Vote, String> {
    if let Some(vote) = branch.record.vote {
        return Ok(vote);
    }
    if branch.record.is_resolved() {
        return Err(format!("branch {} already completed", branch.record.xid));
    }
    let Some(resource) = branch.resource.clone() else {
        return Err(format!(
            "resource {} of branch {} is not available",
            branch.record.descriptor.identifier, branch.record.xid
        ));
    };

    match resource.prepare(&branch.record.xid) {
        Ok(vote) => {
            log::debug!("branch {} voted {:?}", branch.record.xid, vote);
            branch.record.record_vote(vote);
            persist(ctx, &branch.record);
            Ok(vote)
        }
        Err(e) => {
            log::warn!("branch {} failed to prepare: {}", branch.record.xid, e);
            if apply_reported(&mut branch.record, e.kind) {
                persist(ctx, &branch.record);
            }
            Err(format!("branch {} declined prepare: {}", branch.record.xid, e))
        }
    }
}

/// Drives the last resource through a one-phase commit in place of prepare.
pub(super) fn commit_last_resource(
    branch: &mut EnlistedBranch,
    ctx: &BranchContext<'_>,
) -> Result<Vote, String> {
    if branch.record.committed {
        return Ok(Vote::Ok);
    }
    if branch.record.is_resolved() {
        return Err(format!(
            "last resource {} already completed without commit",
            branch.record.xid
        ));
    }
    let Some(resource) = branch.resource.clone() else {
        return Err(format!(
            "last resource {} is not available",
            branch.record.descriptor.identifier
        ));
    };

    let outcome = match resource.commit(&branch.record.xid, true) {
        Ok(()) => {
            branch.record.mark_committed(false);
            Ok(Vote::Ok)
        }
        Err(e) if e.kind == XaErrorKind::HeuristicCommit => {
            branch.record.mark_committed(true);
            Ok(Vote::Ok)
        }
        Err(e) => {
            apply_reported(&mut branch.record, e.kind);
            Err(format!(
                "last resource {} failed to commit: {}",
                branch.record.xid, e
            ))
        }
    };
    if outcome.is_ok() {
        log::debug!("last resource {} committed", branch.record.xid);
        branch.record.vote = Some(Vote::Ok);
    }
    persist(ctx, &branch.record);
    outcome
}

/// Commits one branch and counts its outcome.
pub(super) fn commit_branch(
    branch: &mut EnlistedBranch,
    ctx: &BranchContext<'_>,
    one_phase: bool,
    tally: &mut CompletionTally,
) {
    if branch.record.is_resolved() {
        count_resolved(&branch.record, tally);
        return;
    }
    let Some(resource) = branch.resource.clone() else {
        log::warn!(
            "cannot commit branch {}: resource {} not registered",
            branch.record.xid,
            branch.record.descriptor.identifier
        );
        tally.incomplete += 1;
        return;
    };

    let xid = branch.record.xid;
    match resource.commit(&xid, one_phase) {
        Ok(()) => branch.record.mark_committed(false),
        Err(e) => {
            log::warn!("commit of branch {} reported {}", xid, e);
            if !apply_reported(&mut branch.record, e.kind) {
                match e.kind {
                    XaErrorKind::Unavailable => {}
                    // A replayed commit the resource already completed and forgot.
                    XaErrorKind::UnknownBranch if ctx.recovery && !one_phase => {
                        branch.record.mark_committed(false)
                    }
                    XaErrorKind::UnknownBranch if !one_phase => branch.record.mark_hazard(),
                    _ if one_phase => match resource.rollback(&xid) {
                        Ok(()) => branch.record.mark_rolledback(false),
                        Err(e) => {
                            log::error!("forced rollback of branch {} failed: {}", xid, e);
                            apply_reported(&mut branch.record, e.kind);
                        }
                    },
                    _ => log::error!("branch {} left unresolved: {}", xid, e),
                }
            }
        }
    }

    if branch.record.is_resolved() {
        persist(ctx, &branch.record);
        count_resolved(&branch.record, tally);
    } else {
        tally.incomplete += 1;
    }
}

/// Rolls back one branch and counts its outcome.
pub(super) fn rollback_branch(
    branch: &mut EnlistedBranch,
    ctx: &BranchContext<'_>,
    tally: &mut CompletionTally,
) {
    if branch.record.is_resolved() {
        count_resolved(&branch.record, tally);
        return;
    }
    let Some(resource) = branch.resource.clone() else {
        log::warn!(
            "cannot roll back branch {}: resource {} not registered",
            branch.record.xid,
            branch.record.descriptor.identifier
        );
        tally.incomplete += 1;
        return;
    };

    let xid = branch.record.xid;
    match resource.rollback(&xid) {
        Ok(()) => branch.record.mark_rolledback(false),
        Err(e) => {
            if !apply_reported(&mut branch.record, e.kind) {
                match e.kind {
                    // Never prepared: the resource manager already discarded the work.
                    XaErrorKind::UnknownBranch
                        if branch.record.vote.is_none() || ctx.recovery =>
                    {
                        branch.record.mark_rolledback(false)
                    }
                    _ => log::error!("rollback of branch {} failed: {}", xid, e),
                }
            } else {
                log::warn!("rollback of branch {} reported {}", xid, e);
            }
        }
    }

    if branch.record.is_resolved() {
        persist(ctx, &branch.record);
        count_resolved(&branch.record, tally);
    } else {
        tally.incomplete += 1;
    }
}

/// Releases resource-manager state kept for a heuristically completed branch.
pub(super) fn forget_branch(branch: &EnlistedBranch) {
    if !branch.record.heuristic {
        return;
    }
    let Some(resource) = &branch.resource else {
        return;
    };
    if let Err(e) = resource.forget(&branch.record.xid) {
        log::warn!("forget of branch {} failed: {}", branch.record.xid, e);
    }
}
