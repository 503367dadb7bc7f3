//! In-memory index of live transactions and of thread associations.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::thread::ThreadId;

use super::error::{TransactionError, TransactionResult};
use super::id::GlobalId;
use super::machine::Transaction;
use super::services::TransactionServices;

/// Live transactions by global id, the calling threads they are bound to, and the
/// set of transactions waiting for recovery.
#[derive(Default)]
pub struct Repository {
    transactions: DashMap<GlobalId, Arc<Transaction>>,
    associations: DashMap<ThreadId, GlobalId>,
    in_error: DashSet<GlobalId>,
}

impl Repository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, txn: Arc<Transaction>) {
        self.transactions.insert(txn.global_id(), txn);
    }

    pub fn get(&self, global_id: &GlobalId) -> Option<Arc<Transaction>> {
        self.transactions.get(global_id).map(|e| Arc::clone(e.value()))
    }

    pub fn remove(&self, global_id: &GlobalId) -> Option<Arc<Transaction>> {
        self.in_error.remove(global_id);
        self.transactions.remove(global_id).map(|(_, txn)| txn)
    }

    /// Binds `global_id` to `thread`. A thread carries at most one transaction.
    pub fn associate(&self, thread: ThreadId, global_id: GlobalId) -> TransactionResult<()> {
        match self.associations.entry(thread) {
            dashmap::mapref::entry::Entry::Occupied(e) => {
                Err(TransactionError::AlreadyAssociated(*e.get()))
            }
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(global_id);
                Ok(())
            }
        }
    }

    /// Unbinds `thread`, returning the transaction it carried.
    pub fn dissociate(&self, thread: ThreadId) -> Option<GlobalId> {
        self.associations.remove(&thread).map(|(_, gid)| gid)
    }

    /// Transaction bound to `thread`.
    pub fn current(&self, thread: ThreadId) -> Option<Arc<Transaction>> {
        let global_id = *self.associations.get(&thread)?;
        self.get(&global_id)
    }

    /// True if some thread carries `global_id`.
    pub fn is_associated(&self, global_id: &GlobalId) -> bool {
        self.associations.iter().any(|e| e.value() == global_id)
    }

    pub fn mark_in_error(&self, global_id: GlobalId) {
        if self.in_error.insert(global_id) {
            log::debug!("transaction {} is waiting for recovery", global_id);
        }
    }

    pub fn clear_in_error(&self, global_id: &GlobalId) {
        self.in_error.remove(global_id);
    }

    /// Transactions waiting for recovery.
    pub fn in_error(&self) -> Vec<Arc<Transaction>> {
        self.in_error
            .iter()
            .filter_map(|gid| self.get(gid.key()))
            .collect()
    }

    pub fn in_error_count(&self) -> usize {
        self.in_error.len()
    }

    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        self.transactions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Files a transaction after a completion attempt: in-error transactions are kept
    /// for recovery, finished ones are dropped.
    pub fn settle(&self, txn: &Transaction) {
        let global_id = txn.global_id();
        if txn.is_in_error() {
            self.mark_in_error(global_id);
        } else if txn.status().is_terminal() {
            self.remove(&global_id);
        }
    }

    /// Rebuilds every logged transaction. Each one starts in error so that the
    /// recovery engine decides its fate. Returns the number loaded.
    pub fn load_from_store(&self, services: &TransactionServices) -> usize {
        let mut loaded = 0;
        services.store.recover(&mut |archive| {
            let txn = Transaction::from_archive(services.clone(), archive);
            txn.set_in_error(true);
            self.mark_in_error(txn.global_id());
            self.put(txn);
            loaded += 1;
        });
        if loaded > 0 {
            log::info!("loaded {} transactions from the log", loaded);
        }
        loaded
    }
}
