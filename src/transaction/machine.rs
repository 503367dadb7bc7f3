//! The transaction state machine.
//!
//! A [`Transaction`] owns the native-side and remote-side branch managers and drives
//! them through commit or rollback. Every mutation happens inside the transaction's
//! exclusive section; status, the rollback-only flag and the deadline are mirrored in
//! atomics so listeners and background scanners can read them without the lock.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::archive::TransactionArchive;
use super::error::{Completion, Outcome, TransactionError, TransactionResult};
use super::id::{GlobalId, Xid};
use super::services::TransactionServices;
use super::state::{TransactionContext, TransactionStatus};
use super::synchronization::Synchronization;
use crate::branch::{
    BranchContext, BranchManager, CompletionTally, PrepareOutcome, RoundResult, Side,
};
use crate::resource::{ResourceDescriptor, Vote, XaErrorKind, XaFlags, XaResource};
use crate::txlog::{LogError, LogResult};

/// State guarded by the exclusive section.
struct Inner {
    status: TransactionStatus,
    context: TransactionContext,
    vote: Option<Vote>,
    native: BranchManager,
    remote: BranchManager,
    next_branch: u32,
    /// Archive of a reconstructed transaction whose branches were not rebuilt yet.
    pending: Option<TransactionArchive>,
}

/// A global transaction, as coordinator or as participant.
pub struct Transaction {
    global_id: GlobalId,
    coordinator: bool,
    created_at: u64,
    /// Rebuilt from the log rather than begun or imported by this process.
    reconstructed: bool,
    services: TransactionServices,
    status: AtomicU8,
    rollback_only: AtomicBool,
    in_error: AtomicBool,
    expires_at: AtomicU64,
    inner: Mutex<Inner>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
}

impl Transaction {
    fn create(
        services: TransactionServices,
        global_id: GlobalId,
        status: TransactionStatus,
        context: TransactionContext,
        pending: Option<TransactionArchive>,
    ) -> Self {
        let next_branch = pending
            .as_ref()
            .and_then(|a| a.branches().map(|r| r.xid.branch_qualifier()).max())
            .unwrap_or(0);
        Self {
            global_id,
            coordinator: context.coordinator,
            created_at: context.created_at,
            reconstructed: context.recovery,
            services,
            status: AtomicU8::new(status.to_u8()),
            rollback_only: AtomicBool::new(status == TransactionStatus::MarkedRollback),
            in_error: AtomicBool::new(false),
            expires_at: AtomicU64::new(context.expires_at),
            inner: Mutex::new(Inner {
                status,
                context,
                vote: pending.as_ref().and_then(|a| a.vote),
                native: BranchManager::new(Side::Native),
                remote: BranchManager::new(Side::Remote),
                next_branch,
                pending,
            }),
            synchronizations: Mutex::new(Vec::new()),
        }
    }

    /// Starts a transaction coordinated by this node and logs its archive.
    pub fn begin(services: TransactionServices, timeout: Duration) -> TransactionResult<Arc<Self>> {
        let global_id = services.xid_factory.create_global_id();
        let mut context = TransactionContext::coordinator(timeout);
        context.created_at = global_id.created_millis();
        let txn = Self::create(
            services,
            global_id,
            TransactionStatus::Active,
            context,
            None,
        );
        txn.services.store.create_transaction(&txn.to_archive())?;
        log::debug!("began transaction {}", global_id);
        Ok(Arc::new(txn))
    }

    /// Starts the local part of a transaction coordinated by `origin`.
    pub fn import(
        services: TransactionServices,
        global_id: GlobalId,
        origin: &str,
        timeout: Duration,
    ) -> TransactionResult<Arc<Self>> {
        let context = TransactionContext::participant(origin, timeout);
        let txn = Self::create(
            services,
            global_id,
            TransactionStatus::Active,
            context,
            None,
        );
        txn.services.store.create_transaction(&txn.to_archive())?;
        log::debug!("imported transaction {} from {}", global_id, origin);
        Ok(Arc::new(txn))
    }

    /// Rebuilds a transaction from its archive. Branches are rehydrated lazily by the
    /// first completion operation.
    pub fn from_archive(services: TransactionServices, archive: TransactionArchive) -> Arc<Self> {
        let context = TransactionContext {
            propagated_by: archive.propagated_by.clone(),
            coordinator: archive.coordinator,
            created_at: archive.created_at,
            expires_at: archive.created_at,
            recovery: true,
            recovered_times: archive.recovered_times,
        };
        Arc::new(Self::create(
            services,
            archive.global_id,
            archive.status,
            context,
            Some(archive),
        ))
    }

    pub fn global_id(&self) -> GlobalId {
        self.global_id
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator
    }

    /// Creation time in unix milliseconds.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// True if the transaction was rebuilt from the log. Only recovery and the peer
    /// coordinator finish such a transaction.
    pub fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }

    pub fn propagated_by(&self) -> Option<String> {
        self.inner.lock().context.propagated_by.clone()
    }

    /// Current status, readable from listeners without blocking.
    pub fn status(&self) -> TransactionStatus {
        let status = TransactionStatus::from_u8(self.status.load(Ordering::SeqCst));
        if status == TransactionStatus::Active && self.is_rollback_only() {
            TransactionStatus::MarkedRollback
        } else {
            status
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Restricts the outcome to rollback.
    pub fn set_rollback_only(&self) {
        if !self.rollback_only.swap(true, Ordering::SeqCst) {
            log::debug!("transaction {} marked rollback-only", self.global_id);
        }
        // Callers inside a completion already hold the lock; the flag is enough there.
        if let Some(mut inner) = self.inner.try_lock() {
            if inner.status == TransactionStatus::Active {
                self.set_status(&mut inner, TransactionStatus::MarkedRollback);
            }
        }
    }

    /// True once an unresolved completion was handed over to recovery.
    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_error(&self, in_error: bool) {
        self.in_error.store(in_error, Ordering::SeqCst);
    }

    /// Moves the deadline to `timeout` from now.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.inner.lock();
        inner.context.reset_timeout(timeout);
        self.expires_at
            .store(inner.context.expires_at, Ordering::SeqCst);
    }

    /// True if the transaction is still active past its deadline at `now` (unix millis).
    /// Reconstructed transactions never time out; recovery owns them.
    pub fn is_timed_out(&self, now: u64) -> bool {
        !self.reconstructed
            && self.status().is_active()
            && now >= self.expires_at.load(Ordering::SeqCst)
    }

    pub fn recovered_times(&self) -> u32 {
        self.inner.lock().context.recovered_times
    }

    /// Counts a recovery attempt that left the transaction unresolved.
    pub fn record_recovery_attempt(&self) {
        let mut inner = self.inner.lock();
        inner.context.recovered_times = inner.context.recovered_times.saturating_add(1);
        if let Err(e) = self.persist(&inner) {
            log::warn!(
                "failed to log recovery attempt of {}: {}",
                self.global_id,
                e
            );
        }
    }

    pub fn branch_count(&self) -> usize {
        let inner = self.inner.lock();
        match &inner.pending {
            Some(archive) => archive.branch_count(),
            None => inner.native.len() + inner.remote.len(),
        }
    }

    /// Snapshot for the log.
    pub fn to_archive(&self) -> TransactionArchive {
        self.archive_of(&self.inner.lock())
    }

    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> TransactionResult<()> {
        match self.status() {
            TransactionStatus::Active => {
                self.synchronizations.lock().push(synchronization);
                Ok(())
            }
            TransactionStatus::MarkedRollback => Err(self.rollback_only_error()),
            status => Err(self.illegal_state(status)),
        }
    }

    /// Enlists `resource` on the side its descriptor names and returns the branch id.
    pub fn enlist_resource(
        &self,
        resource: Arc<dyn XaResource>,
        descriptor: ResourceDescriptor,
    ) -> TransactionResult<Xid> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.check_enlistable(inner)?;

        let factory = &self.services.xid_factory;
        let global_id = self.global_id;
        let next_branch = &mut inner.next_branch;
        let manager = if descriptor.is_remote() {
            &mut inner.remote
        } else {
            &mut inner.native
        };
        let enlisted = manager.enlist(resource, descriptor, || {
            *next_branch += 1;
            factory.create_branch_id(global_id, *next_branch)
        });

        let enlistment = match enlisted {
            Ok(enlistment) => enlistment,
            Err(e) => {
                if e.kind == XaErrorKind::RollbackRequired {
                    self.mark_rollback_only(inner);
                }
                return Err(e.into());
            }
        };

        if !enlistment.joined {
            if let Err(e) = self.persist(inner) {
                log::error!(
                    "failed to log enlistment of {}, marking {} rollback-only: {}",
                    enlistment.xid,
                    self.global_id,
                    e
                );
                self.mark_rollback_only(inner);
                return Err(e.into());
            }
            log::debug!("enlisted branch {}", enlistment.xid);
        }
        Ok(enlistment.xid)
    }

    /// Ends the association of `resource`. Returns false if it is not enlisted.
    /// Delisting with [`XaFlags::FAIL`] marks the transaction rollback-only.
    pub fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flags: XaFlags,
    ) -> TransactionResult<bool> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.status.is_active() {
            return Err(self.illegal_state(inner.status));
        }

        let delisted = match inner.native.delist(resource, flags) {
            Ok(false) => inner.remote.delist(resource, flags),
            other => other,
        };
        let found = match delisted {
            Ok(found) => found,
            Err(e) => {
                log::warn!("delist from {} failed: {}", self.global_id, e);
                self.mark_rollback_only(inner);
                return Err(e.into());
            }
        };
        if flags.contains(XaFlags::FAIL) {
            self.mark_rollback_only(inner);
        }
        Ok(found)
    }

    /// Suspends every branch association. Failures mark the transaction rollback-only.
    pub fn suspend(&self) -> TransactionResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.status.is_active() {
            return Err(self.illegal_state(inner.status));
        }
        let mut failures = inner.native.suspend_all();
        failures.extend(inner.remote.suspend_all());
        if !failures.is_empty() {
            log::warn!(
                "{} branches of {} failed to suspend",
                failures.len(),
                self.global_id
            );
            self.mark_rollback_only(inner);
        }
        Ok(())
    }

    /// Resumes suspended associations. Failures mark the transaction rollback-only.
    pub fn resume(&self) -> TransactionResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !inner.status.is_active() {
            return Err(self.illegal_state(inner.status));
        }
        let mut failures = inner.native.resume_all();
        failures.extend(inner.remote.resume_all());
        if !failures.is_empty() {
            log::warn!(
                "{} branches of {} failed to resume",
                failures.len(),
                self.global_id
            );
            self.mark_rollback_only(inner);
        }
        Ok(())
    }

    /// Commits as coordinator.
    pub fn commit(&self) -> TransactionResult<Completion> {
        if !self.coordinator {
            return Err(self.illegal_state(self.status()));
        }
        if self.status() == TransactionStatus::Active {
            self.before_completion();
        }

        let completion = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.rehydrate(inner);
            match inner.status {
                TransactionStatus::Committed => return Ok(Completion::new(Outcome::Committed)),
                TransactionStatus::RolledBack => {
                    return Ok(Completion::new(Outcome::RolledBack))
                }
                TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                    self.complete_commit(inner)
                }
                status => return Err(self.illegal_state(status)),
            }
        };

        self.after_completion();
        log::info!("transaction {} completed: {}", self.global_id, completion);
        Ok(completion)
    }

    /// Rolls back an active transaction.
    pub fn rollback(&self) -> TransactionResult<Completion> {
        let completion = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.rehydrate(inner);
            match inner.status {
                TransactionStatus::RolledBack => return Ok(Completion::new(Outcome::RolledBack)),
                TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                    self.delist_all(inner, XaFlags::FAIL);
                    self.rollback_sides(inner, self.reconstructed)
                }
                status => return Err(self.illegal_state(status)),
            }
        };

        self.after_completion();
        log::info!("transaction {} completed: {}", self.global_id, completion);
        Ok(completion)
    }

    /// First phase on behalf of the remote coordinator.
    pub fn participant_prepare(&self) -> TransactionResult<Vote> {
        if self.status() == TransactionStatus::Active {
            self.before_completion();
        }

        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.rehydrate(inner);
            match inner.status {
                TransactionStatus::Prepared => return Ok(inner.vote.unwrap_or(Vote::Ok)),
                TransactionStatus::Active | TransactionStatus::MarkedRollback => {}
                status => return Err(self.illegal_state(status)),
            }

            self.delist_all(inner, XaFlags::SUCCESS);
            if self.is_rollback_only() || inner.status == TransactionStatus::MarkedRollback {
                self.rollback_sides(inner, false);
                Err(self.rollback_only_error())
            } else {
                self.prepare_locally(inner)
            }
        };

        if self.status().is_terminal() {
            self.after_completion();
        }
        result
    }

    fn prepare_locally(&self, inner: &mut Inner) -> TransactionResult<Vote> {
        self.set_status(inner, TransactionStatus::Preparing);
        if let Err(e) = self.persist(inner) {
            self.rollback_sides(inner, false);
            return Err(e.into());
        }

        match self.prepare_sides(inner) {
            Err(cause) => {
                self.rollback_sides(inner, false);
                Err(TransactionError::RollbackOnly {
                    global_id: self.global_id,
                    cause,
                })
            }
            Ok(Vote::ReadOnly) => {
                inner.vote = Some(Vote::ReadOnly);
                self.conclude(
                    inner,
                    Completion::new(Outcome::Committed),
                    &CompletionTally::default(),
                    TransactionStatus::Committed,
                );
                Ok(Vote::ReadOnly)
            }
            Ok(Vote::Ok) => {
                inner.vote = Some(Vote::Ok);
                self.set_status(inner, TransactionStatus::Prepared);
                if let Err(e) = self.persist(inner) {
                    self.rollback_sides(inner, false);
                    return Err(e.into());
                }
                Ok(Vote::Ok)
            }
        }
    }

    /// Second phase (or single phase) on behalf of the remote coordinator.
    pub fn participant_commit(&self, one_phase: bool) -> TransactionResult<Completion> {
        if one_phase && self.status() == TransactionStatus::Active {
            self.before_completion();
        }

        let completion = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.rehydrate(inner);
            match inner.status {
                TransactionStatus::Committed => return Ok(Completion::new(Outcome::Committed)),
                TransactionStatus::RolledBack if one_phase => {
                    return Ok(Completion::new(Outcome::RolledBack))
                }
                TransactionStatus::RolledBack => {
                    return Ok(Completion::with_cause(
                        Outcome::HeuristicRollback,
                        "branch rolled back before the commit decision arrived",
                    ))
                }
                TransactionStatus::Active | TransactionStatus::MarkedRollback if one_phase => {
                    self.complete_commit(inner)
                }
                TransactionStatus::Prepared | TransactionStatus::Committing if !one_phase => {
                    self.set_status(inner, TransactionStatus::Committing);
                    self.commit_sides(inner, false, self.reconstructed)
                }
                status => return Err(self.illegal_state(status)),
            }
        };

        self.after_completion();
        Ok(completion)
    }

    /// Rollback on behalf of the remote coordinator.
    pub fn participant_rollback(&self) -> TransactionResult<Completion> {
        let completion = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.rehydrate(inner);
            match inner.status {
                TransactionStatus::RolledBack => return Ok(Completion::new(Outcome::RolledBack)),
                TransactionStatus::Committed => {
                    return Ok(Completion::with_cause(
                        Outcome::HeuristicCommit,
                        "branch committed before the rollback decision arrived",
                    ))
                }
                TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                    self.delist_all(inner, XaFlags::FAIL);
                    self.rollback_sides(inner, self.reconstructed)
                }
                TransactionStatus::Prepared
                | TransactionStatus::RollingBack
                | TransactionStatus::Unknown => self.rollback_sides(inner, self.reconstructed),
                status => return Err(self.illegal_state(status)),
            }
        };

        self.after_completion();
        Ok(completion)
    }

    /// Re-drives commit from the logged state. Callbacks are not fired.
    pub fn recovery_commit(&self) -> Completion {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.rehydrate(inner);
        if inner.status.is_terminal() {
            return self.cleanup(inner);
        }
        self.set_status(inner, TransactionStatus::Committing);
        self.commit_sides(inner, false, true)
    }

    /// Re-drives rollback from the logged state. Callbacks are not fired.
    pub fn recovery_rollback(&self) -> Completion {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.rehydrate(inner);
        if inner.status.is_terminal() {
            return self.cleanup(inner);
        }
        self.rollback_sides(inner, true)
    }

    /// Forgets heuristic branches on both sides and removes the archive.
    pub fn forget(&self) -> TransactionResult<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        self.rehydrate(inner);
        inner.native.forget();
        inner.remote.forget();
        self.services.store.delete_transaction(&self.global_id)?;
        self.set_in_error(false);
        Ok(())
    }

    /// Commit algorithm shared by the coordinator and a one-phase participant. Runs
    /// with the transaction active or marked rollback-only.
    fn complete_commit(&self, inner: &mut Inner) -> Completion {
        self.delist_all(inner, XaFlags::SUCCESS);

        if self.is_rollback_only() || inner.status == TransactionStatus::MarkedRollback {
            let completion = self.rollback_sides(inner, false);
            return match completion.outcome {
                Outcome::RolledBack => Completion::with_cause(
                    Outcome::HeuristicRollback,
                    "transaction was marked rollback-only",
                ),
                _ => completion,
            };
        }

        match inner.native.len() + inner.remote.len() {
            0 => self.conclude(
                inner,
                Completion::new(Outcome::Committed),
                &CompletionTally::default(),
                TransactionStatus::Committed,
            ),
            1 => {
                self.set_status(inner, TransactionStatus::Committing);
                if let Err(e) = self.persist(inner) {
                    return self.rollback_after_log_failure(inner, e);
                }
                self.commit_sides(inner, true, false)
            }
            _ => self.commit_two_phase(inner),
        }
    }

    fn commit_two_phase(&self, inner: &mut Inner) -> Completion {
        self.set_status(inner, TransactionStatus::Preparing);
        if let Err(e) = self.persist(inner) {
            return self.rollback_after_log_failure(inner, e);
        }

        match self.prepare_sides(inner) {
            Err(cause) => {
                log::info!("transaction {} rolls back: {}", self.global_id, cause);
                let completion = self.rollback_sides(inner, false);
                Completion {
                    outcome: completion.outcome,
                    cause: Some(cause),
                }
            }
            Ok(Vote::ReadOnly) => {
                inner.vote = Some(Vote::ReadOnly);
                self.conclude(
                    inner,
                    Completion::new(Outcome::Committed),
                    &CompletionTally::default(),
                    TransactionStatus::Committed,
                )
            }
            Ok(Vote::Ok) => {
                inner.vote = Some(Vote::Ok);
                self.set_status(inner, TransactionStatus::Prepared);
                if let Err(e) = self.persist(inner) {
                    return self.rollback_after_log_failure(inner, e);
                }
                self.set_status(inner, TransactionStatus::Committing);
                self.commit_sides(inner, false, false)
            }
        }
    }

    /// Prepares native two-phase branches, then the remote side, then the native last
    /// resource. Returns the combined vote, or the cause of a required rollback.
    fn prepare_sides(&self, inner: &mut Inner) -> Result<Vote, String> {
        if inner.native.has_last_resource() && inner.remote.has_last_resource() {
            return Err("more than one resource lacks two-phase support".to_string());
        }

        let ctx = self.branch_context(false);
        let mut voted_ok = false;
        let mut count = |outcome: PrepareOutcome| match outcome {
            PrepareOutcome::Vote(Vote::Ok) => {
                voted_ok = true;
                Ok(())
            }
            PrepareOutcome::Vote(Vote::ReadOnly) => Ok(()),
            PrepareOutcome::RollbackRequired { cause } => Err(cause),
        };

        count(inner.native.prepare_two_phase(&ctx))?;
        count(inner.remote.prepare(&ctx))?;
        count(inner.native.prepare_last_resource(&ctx))?;
        Ok(if voted_ok { Vote::Ok } else { Vote::ReadOnly })
    }

    /// Commits the remote side, then the native side.
    fn commit_sides(&self, inner: &mut Inner, one_phase: bool, recovery: bool) -> Completion {
        let ctx = self.branch_context(recovery);
        let tally = if one_phase {
            if inner.remote.is_empty() {
                inner.native.commit(&ctx, true)
            } else {
                inner.remote.commit(&ctx, true)
            }
        } else {
            inner
                .remote
                .commit(&ctx, false)
                .merged(inner.native.commit(&ctx, false))
        };

        let outcome = match tally.classify() {
            RoundResult::Committed | RoundResult::ReadOnly => Outcome::Committed,
            RoundResult::RolledBack if one_phase && tally.heuristic == 0 => Outcome::RolledBack,
            RoundResult::RolledBack => Outcome::HeuristicRollback,
            RoundResult::Mixed => Outcome::HeuristicMixed,
            RoundResult::Hazard => Outcome::HeuristicHazard,
            RoundResult::Incomplete => Outcome::CompletionRequired,
        };
        self.conclude(
            inner,
            Completion::new(outcome),
            &tally,
            TransactionStatus::Committed,
        )
    }

    /// Rolls back the remote side, then the native side.
    fn rollback_sides(&self, inner: &mut Inner, recovery: bool) -> Completion {
        self.set_status(inner, TransactionStatus::RollingBack);
        if let Err(e) = self.persist(inner) {
            log::warn!("failed to log rollback of {}: {}", self.global_id, e);
        }

        let ctx = self.branch_context(recovery);
        let tally = inner
            .remote
            .rollback(&ctx)
            .merged(inner.native.rollback(&ctx));

        let outcome = match tally.classify() {
            RoundResult::RolledBack | RoundResult::ReadOnly => Outcome::RolledBack,
            RoundResult::Committed => Outcome::HeuristicCommit,
            RoundResult::Mixed => Outcome::HeuristicMixed,
            RoundResult::Hazard => Outcome::HeuristicHazard,
            RoundResult::Incomplete => Outcome::CompletionRequired,
        };
        self.conclude(
            inner,
            Completion::new(outcome),
            &tally,
            TransactionStatus::RolledBack,
        )
    }

    fn rollback_after_log_failure(&self, inner: &mut Inner, error: LogError) -> Completion {
        log::error!(
            "failed to log state of {}, rolling back: {}",
            self.global_id,
            error
        );
        let completion = self.rollback_sides(inner, false);
        Completion {
            outcome: completion.outcome,
            cause: Some(format!("transaction log write failed: {}", error)),
        }
    }

    /// Settles a finished round. An incomplete round leaves the transaction in error
    /// with its archive in place; otherwise the final status is set, heuristic branches
    /// are forgotten and the archive is removed.
    fn conclude(
        &self,
        inner: &mut Inner,
        completion: Completion,
        tally: &CompletionTally,
        decided: TransactionStatus,
    ) -> Completion {
        if completion.outcome == Outcome::CompletionRequired || tally.needs_completion() {
            self.set_in_error(true);
            if let Err(e) = self.persist(inner) {
                log::error!("failed to log state of {}: {}", self.global_id, e);
            }
            log::warn!(
                "transaction {} has {} unresolved branches, handing over to recovery",
                self.global_id,
                tally.incomplete
            );
            return completion;
        }

        let status = match completion.outcome {
            Outcome::Committed | Outcome::HeuristicCommit => TransactionStatus::Committed,
            Outcome::RolledBack | Outcome::HeuristicRollback => TransactionStatus::RolledBack,
            _ => decided,
        };
        self.set_status(inner, status);

        if tally.heuristic > 0 || completion.outcome.is_heuristic() {
            log::warn!(
                "transaction {} completed heuristically: {}",
                self.global_id,
                completion
            );
            if let Err(e) = self.persist(inner) {
                log::error!("failed to log outcome of {}: {}", self.global_id, e);
            }
            inner.native.forget();
            inner.remote.forget();
        }

        match self.services.store.delete_transaction(&self.global_id) {
            Ok(()) => self.set_in_error(false),
            Err(e) => {
                log::error!("failed to remove archive of {}: {}", self.global_id, e);
                self.set_in_error(true);
            }
        }
        completion
    }

    /// Finishes a transaction found already terminal.
    fn cleanup(&self, inner: &mut Inner) -> Completion {
        let outcome = if inner.status == TransactionStatus::Committed {
            Outcome::Committed
        } else {
            Outcome::RolledBack
        };
        inner.native.forget();
        inner.remote.forget();
        match self.services.store.delete_transaction(&self.global_id) {
            Ok(()) => {
                self.set_in_error(false);
                Completion::new(outcome)
            }
            Err(e) => {
                log::error!("failed to remove archive of {}: {}", self.global_id, e);
                self.set_in_error(true);
                Completion::with_cause(Outcome::CompletionRequired, e.to_string())
            }
        }
    }

    fn rehydrate(&self, inner: &mut Inner) {
        if let Some(archive) = inner.pending.take() {
            let registry = &self.services.registry;
            inner.native.rehydrate(archive.native_branches, registry);
            inner.remote.rehydrate(archive.remote_branches, registry);
        }
    }

    fn delist_all(&self, inner: &mut Inner, flags: XaFlags) {
        let mut failures = inner.native.delist_all(flags);
        failures.extend(inner.remote.delist_all(flags));
        if !failures.is_empty() && flags != XaFlags::FAIL {
            log::warn!(
                "{} branches of {} failed to delist, rolling back",
                failures.len(),
                self.global_id
            );
            self.rollback_only.store(true, Ordering::SeqCst);
        }
    }

    fn before_completion(&self) {
        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in synchronizations {
            if let Err(e) = synchronization.before_completion() {
                log::warn!(
                    "before-completion callback of {} failed: {:#}",
                    self.global_id,
                    e
                );
                self.set_rollback_only();
                break;
            }
        }
    }

    fn after_completion(&self) {
        let status = self.status();
        let synchronizations = self.synchronizations.lock().clone();
        for synchronization in synchronizations {
            synchronization.after_completion(status);
        }
    }

    fn check_enlistable(&self, inner: &Inner) -> TransactionResult<()> {
        match inner.status {
            TransactionStatus::Active if !self.is_rollback_only() => Ok(()),
            TransactionStatus::Active | TransactionStatus::MarkedRollback => {
                Err(self.rollback_only_error())
            }
            status => Err(self.illegal_state(status)),
        }
    }

    fn mark_rollback_only(&self, inner: &mut Inner) {
        self.rollback_only.store(true, Ordering::SeqCst);
        if inner.status == TransactionStatus::Active {
            self.set_status(inner, TransactionStatus::MarkedRollback);
        }
    }

    fn set_status(&self, inner: &mut Inner, status: TransactionStatus) {
        inner.status = status;
        self.status.store(status.to_u8(), Ordering::SeqCst);
    }

    fn branch_context(&self, recovery: bool) -> BranchContext<'_> {
        BranchContext {
            global_id: self.global_id,
            store: self.services.store.as_ref(),
            recovery,
        }
    }

    fn persist(&self, inner: &Inner) -> LogResult<()> {
        self.services
            .store
            .update_transaction(&self.archive_of(inner))
    }

    fn archive_of(&self, inner: &Inner) -> TransactionArchive {
        if let Some(pending) = &inner.pending {
            let mut archive = pending.clone();
            archive.status = inner.status;
            archive.vote = inner.vote;
            archive.recovered_times = inner.context.recovered_times;
            return archive;
        }
        TransactionArchive {
            global_id: self.global_id,
            status: inner.status,
            vote: inner.vote,
            coordinator: self.coordinator,
            propagated_by: inner.context.propagated_by.clone(),
            created_at: self.created_at,
            recovered_times: inner.context.recovered_times,
            native_branches: inner.native.records(),
            remote_branches: inner.remote.records(),
        }
    }

    fn illegal_state(&self, status: TransactionStatus) -> TransactionError {
        TransactionError::IllegalState {
            global_id: self.global_id,
            status,
        }
    }

    fn rollback_only_error(&self) -> TransactionError {
        TransactionError::RollbackOnly {
            global_id: self.global_id,
            cause: "transaction is marked rollback-only".to_string(),
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("global_id", &self.global_id)
            .field("coordinator", &self.coordinator)
            .field("status", &self.status())
            .field("in_error", &self.is_in_error())
            .finish()
    }
}
