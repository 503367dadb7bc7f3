//! Timer-driven re-drive of in-error transactions.

use std::sync::Arc;

use super::backoff::Backoff;
use crate::resource::{XaErrorKind, XaFlags};
use crate::transaction::{
    now_millis, Outcome, Repository, Transaction, TransactionArchive, TransactionServices,
    TransactionStatus,
};

/// What recovery does with a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Commit,
    Rollback,
    /// Already terminal: forget heuristic branches and drop the archive.
    Cleanup,
}

/// Chooses the recovery action for a logged state.
///
/// A commit decision exists once the archive reached Prepared or Committing, or once
/// a last resource committed during prepare. A single branch that was being committed
/// in one phase and never reported back is rolled back instead.
pub fn decide(archive: &TransactionArchive) -> RecoveryAction {
    match archive.status {
        TransactionStatus::Committed | TransactionStatus::RolledBack => RecoveryAction::Cleanup,
        status if status.is_commit_decided() && archive.has_incomplete_one_phase() => {
            RecoveryAction::Rollback
        }
        status if status.is_commit_decided() => RecoveryAction::Commit,
        TransactionStatus::Preparing if archive.last_resource_committed() => {
            RecoveryAction::Commit
        }
        _ => RecoveryAction::Rollback,
    }
}

/// Counters of one recovery pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// In-error transactions looked at.
    pub examined: usize,
    /// Transactions not yet due for another attempt.
    pub skipped: usize,
    pub committed: usize,
    pub rolled_back: usize,
    /// Terminal transactions whose archive was dropped.
    pub cleaned: usize,
    /// Resolved with a heuristic outcome.
    pub heuristic: usize,
    /// Attempts that left the transaction in error.
    pub unresolved: usize,
    pub orphans_rolled_back: usize,
}

/// Re-drives in-error transactions with exponential backoff and rolls back orphan
/// branches.
pub struct RecoveryEngine {
    services: TransactionServices,
    repository: Arc<Repository>,
    backoff: Backoff,
}

impl RecoveryEngine {
    pub fn new(
        services: TransactionServices,
        repository: Arc<Repository>,
        backoff: Backoff,
    ) -> Self {
        Self {
            services,
            repository,
            backoff,
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Runs one pass at the current time.
    pub fn run_once(&self) -> RecoveryStats {
        self.run_at(now_millis())
    }

    /// Runs one pass as if the clock read `now` (unix millis).
    pub fn run_at(&self, now: u64) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        for txn in self.repository.in_error() {
            stats.examined += 1;
            if !self
                .backoff
                .is_eligible(txn.created_at(), txn.recovered_times(), now)
            {
                stats.skipped += 1;
                continue;
            }
            self.recover(&txn, &mut stats);
        }
        stats.orphans_rolled_back = self.resolve_orphans();

        if stats.examined > 0 || stats.orphans_rolled_back > 0 {
            log::info!(
                "recovery pass: {} examined, {} skipped, {} committed, {} rolled back, {} cleaned, {} unresolved, {} orphans",
                stats.examined,
                stats.skipped,
                stats.committed,
                stats.rolled_back,
                stats.cleaned,
                stats.unresolved,
                stats.orphans_rolled_back
            );
        }
        stats
    }

    fn recover(&self, txn: &Transaction, stats: &mut RecoveryStats) {
        let global_id = txn.global_id();
        let archive = txn.to_archive();
        let action = decide(&archive);
        log::debug!(
            "recovering {} from {} (attempt {}): {:?}",
            global_id,
            archive.status,
            archive.recovered_times + 1,
            action
        );

        let outcome = match action {
            RecoveryAction::Commit => Some(txn.recovery_commit().outcome),
            RecoveryAction::Rollback => Some(txn.recovery_rollback().outcome),
            RecoveryAction::Cleanup => match txn.forget() {
                Ok(()) => None,
                Err(e) => {
                    log::warn!("cleanup of {} failed: {}", global_id, e);
                    txn.set_in_error(true);
                    None
                }
            },
        };

        if txn.is_in_error() {
            txn.record_recovery_attempt();
            stats.unresolved += 1;
            log::warn!(
                "transaction {} still unresolved after {} recovery attempts",
                global_id,
                txn.recovered_times()
            );
            return;
        }

        self.repository.remove(&global_id);
        match outcome {
            None => stats.cleaned += 1,
            Some(outcome) => {
                if outcome.is_heuristic() {
                    stats.heuristic += 1;
                }
                match outcome {
                    Outcome::Committed | Outcome::HeuristicCommit => stats.committed += 1,
                    _ => stats.rolled_back += 1,
                }
                log::info!("recovered transaction {}: {}", global_id, outcome);
            }
        }
    }

    /// Rolls back branches a resource holds for transactions this node issued but no
    /// longer knows. Returns how many were rolled back.
    pub fn resolve_orphans(&self) -> usize {
        let factory = &self.services.xid_factory;
        let mut rolled_back = 0;
        for resource in self.services.registry.all_resources() {
            let xids = match resource.recover(XaFlags::START_RSCAN | XaFlags::END_RSCAN) {
                Ok(xids) => xids,
                Err(e) => {
                    log::warn!("recovery scan of {} failed: {}", resource.resource_key(), e);
                    continue;
                }
            };

            for xid in xids {
                if !factory.owns(&xid) {
                    continue;
                }
                let global_id = xid.global_id();
                if self.repository.get(&global_id).is_some()
                    || self.services.store.get(&global_id).is_some()
                {
                    continue;
                }
                match resource.rollback(&xid) {
                    Ok(()) => {
                        log::info!("rolled back orphan branch {}", xid);
                        rolled_back += 1;
                    }
                    Err(e) if e.kind == XaErrorKind::UnknownBranch => {}
                    Err(e) => log::warn!("rollback of orphan branch {} failed: {}", xid, e),
                }
            }
        }
        rolled_back
    }
}
