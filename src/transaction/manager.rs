//! Application entry points with thread association.

use dashmap::DashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;

use super::error::{Completion, TransactionError, TransactionResult};
use super::id::{GlobalId, Xid};
use super::machine::Transaction;
use super::repository::Repository;
use super::services::TransactionServices;
use super::state::{now_millis, TransactionStatus};
use super::synchronization::Synchronization;
use crate::resource::{ResourceDescriptor, XaFlags, XaResource};

/// Begins, completes and tracks transactions on behalf of calling threads.
///
/// Each thread carries at most one transaction at a time. `suspend` detaches it from
/// the thread and `resume` attaches it again, possibly on another thread.
pub struct TransactionManager {
    services: TransactionServices,
    repository: Arc<Repository>,
    default_timeout: Duration,
    /// Per-thread timeout for subsequent begins.
    thread_timeouts: DashMap<ThreadId, Duration>,
}

impl TransactionManager {
    pub fn new(
        services: TransactionServices,
        repository: Arc<Repository>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            services,
            repository,
            default_timeout,
            thread_timeouts: DashMap::new(),
        }
    }

    pub fn services(&self) -> &TransactionServices {
        &self.services
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Starts a transaction coordinated here and binds it to the calling thread.
    pub fn begin(&self) -> TransactionResult<GlobalId> {
        let thread = thread::current().id();
        if let Some(current) = self.repository.current(thread) {
            return Err(TransactionError::AlreadyAssociated(current.global_id()));
        }

        let timeout = self
            .thread_timeouts
            .get(&thread)
            .map(|t| *t.value())
            .unwrap_or(self.default_timeout);
        let txn = Transaction::begin(self.services.clone(), timeout)?;
        let global_id = txn.global_id();
        self.repository.put(txn);
        self.repository.associate(thread, global_id)?;
        Ok(global_id)
    }

    /// Commits the calling thread's transaction. The thread is released whatever the
    /// outcome.
    pub fn commit(&self) -> TransactionResult<Completion> {
        let txn = self.current_or_err()?;
        self.repository.dissociate(thread::current().id());
        let result = txn.commit();
        self.repository.settle(&txn);
        result
    }

    /// Rolls back the calling thread's transaction and releases the thread.
    pub fn rollback(&self) -> TransactionResult<Completion> {
        let txn = self.current_or_err()?;
        self.repository.dissociate(thread::current().id());
        let result = txn.rollback();
        self.repository.settle(&txn);
        result
    }

    pub fn set_rollback_only(&self) -> TransactionResult<()> {
        self.current_or_err()?.set_rollback_only();
        Ok(())
    }

    /// Status of the calling thread's transaction, `NoTransaction` if there is none.
    pub fn status(&self) -> TransactionStatus {
        self.current()
            .map(|txn| txn.status())
            .unwrap_or(TransactionStatus::NoTransaction)
    }

    /// Detaches the calling thread's transaction after suspending its branches.
    pub fn suspend(&self) -> TransactionResult<GlobalId> {
        let txn = self.current_or_err()?;
        txn.suspend()?;
        self.repository.dissociate(thread::current().id());
        log::debug!("suspended transaction {}", txn.global_id());
        Ok(txn.global_id())
    }

    /// Attaches a suspended transaction to the calling thread.
    pub fn resume(&self, global_id: GlobalId) -> TransactionResult<()> {
        let txn = self
            .repository
            .get(&global_id)
            .ok_or(TransactionError::NotFound(global_id))?;
        let thread = thread::current().id();
        self.repository.associate(thread, global_id)?;
        if let Err(e) = txn.resume() {
            self.repository.dissociate(thread);
            return Err(e);
        }
        log::debug!("resumed transaction {}", global_id);
        Ok(())
    }

    /// Timeout for transactions the calling thread begins from now on. Zero restores
    /// the default.
    pub fn set_transaction_timeout(&self, timeout: Duration) {
        let thread = thread::current().id();
        if timeout.is_zero() {
            self.thread_timeouts.remove(&thread);
        } else {
            self.thread_timeouts.insert(thread, timeout);
        }
    }

    pub fn enlist_resource(
        &self,
        resource: Arc<dyn XaResource>,
        descriptor: ResourceDescriptor,
    ) -> TransactionResult<Xid> {
        self.current_or_err()?.enlist_resource(resource, descriptor)
    }

    pub fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flags: XaFlags,
    ) -> TransactionResult<bool> {
        self.current_or_err()?.delist_resource(resource, flags)
    }

    pub fn register_synchronization(
        &self,
        synchronization: Arc<dyn Synchronization>,
    ) -> TransactionResult<()> {
        self.current_or_err()?
            .register_synchronization(synchronization)
    }

    /// Transaction bound to the calling thread.
    pub fn current(&self) -> Option<Arc<Transaction>> {
        self.repository.current(thread::current().id())
    }

    pub fn lookup(&self, global_id: &GlobalId) -> Option<Arc<Transaction>> {
        self.repository.get(global_id)
    }

    /// Returns the local part of a transaction coordinated by `origin`, creating it on
    /// first contact.
    pub fn import(&self, global_id: GlobalId, origin: &str) -> TransactionResult<Arc<Transaction>> {
        if let Some(txn) = self.repository.get(&global_id) {
            return Ok(txn);
        }
        let txn = Transaction::import(
            self.services.clone(),
            global_id,
            origin,
            self.default_timeout,
        )?;
        self.repository.put(Arc::clone(&txn));
        Ok(txn)
    }

    /// Rolls back every transaction past its deadline. Returns how many were rolled
    /// back.
    pub fn timeout_scan(&self) -> usize {
        let now = now_millis();
        let mut rolled_back = 0;
        for txn in self.repository.transactions() {
            if txn.is_in_error() || !txn.is_timed_out(now) {
                continue;
            }
            log::warn!("transaction {} timed out, rolling back", txn.global_id());
            match txn.rollback() {
                Ok(completion) => {
                    log::debug!("timed out transaction {}: {}", txn.global_id(), completion);
                    rolled_back += 1;
                }
                Err(e) => log::warn!("timeout rollback of {} failed: {}", txn.global_id(), e),
            }
            // A thread still holding it learns the outcome on its next call.
            if !self.repository.is_associated(&txn.global_id()) {
                self.repository.settle(&txn);
            } else if txn.is_in_error() {
                self.repository.mark_in_error(txn.global_id());
            }
        }
        rolled_back
    }

    fn current_or_err(&self) -> TransactionResult<Arc<Transaction>> {
        self.current().ok_or(TransactionError::NoTransaction)
    }
}
