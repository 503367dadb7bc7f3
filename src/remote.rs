//! Participant side of the remote coordinator contract.
//!
//! A peer coordinator enlists this node as one remote branch. [`ParticipantEndpoint`]
//! answers that branch protocol by driving the local part of the transaction, keyed by
//! the peer's global id. Transports wrap an endpoint; nothing here touches the network.

use std::sync::Arc;

use crate::resource::{Vote, XaError, XaErrorKind, XaFlags, XaResource, XaResult};
use crate::transaction::{
    Completion, Outcome, Transaction, TransactionError, TransactionManager, TransactionStatus,
    Xid,
};

/// Exposes a local [`TransactionManager`] as an [`XaResource`].
pub struct ParticipantEndpoint {
    manager: Arc<TransactionManager>,
    address: String,
}

impl ParticipantEndpoint {
    /// `address` is how peers name this node; it doubles as the resource key.
    pub fn new(manager: Arc<TransactionManager>, address: impl Into<String>) -> Self {
        Self {
            manager,
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn lookup(&self, xid: &Xid) -> XaResult<Arc<Transaction>> {
        self.manager.lookup(&xid.global_id()).ok_or_else(|| {
            XaError::new(
                XaErrorKind::UnknownBranch,
                format!("{}: no transaction {}", self.address, xid.global_id()),
            )
        })
    }

    fn to_xa(&self, error: TransactionError) -> XaError {
        let kind = match &error {
            TransactionError::RollbackOnly { .. } => XaErrorKind::RollbackRequired,
            TransactionError::NotFound(_) => XaErrorKind::UnknownBranch,
            TransactionError::IllegalState { .. }
            | TransactionError::NoTransaction
            | TransactionError::AlreadyAssociated(_) => XaErrorKind::Protocol,
            TransactionError::Resource(e) => e.kind,
            TransactionError::Log(_) => XaErrorKind::ResourceFailure,
        };
        XaError::new(kind, format!("{}: {}", self.address, error))
    }

    /// Maps a local completion to the branch answer. `requested` is the outcome the
    /// peer asked for.
    fn answer(&self, completion: Completion, requested: Outcome) -> XaResult<()> {
        let kind = match completion.outcome {
            outcome if outcome == requested => return Ok(()),
            Outcome::Committed | Outcome::HeuristicCommit if requested == Outcome::Committed => {
                return Ok(())
            }
            Outcome::RolledBack | Outcome::HeuristicRollback
                if requested == Outcome::RolledBack =>
            {
                return Ok(())
            }
            Outcome::RolledBack => XaErrorKind::RollbackRequired,
            Outcome::Committed | Outcome::HeuristicCommit => XaErrorKind::HeuristicCommit,
            Outcome::HeuristicRollback => XaErrorKind::HeuristicRollback,
            Outcome::HeuristicMixed => XaErrorKind::HeuristicMixed,
            Outcome::HeuristicHazard => XaErrorKind::HeuristicHazard,
            Outcome::CompletionRequired => XaErrorKind::Unavailable,
        };
        Err(XaError::new(
            kind,
            format!("{}: {}", self.address, completion),
        ))
    }

    fn settle(&self, txn: &Transaction) {
        self.manager.repository().settle(txn);
    }
}

impl XaResource for ParticipantEndpoint {
    fn resource_key(&self) -> String {
        self.address.clone()
    }

    fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        if flags.contains(XaFlags::JOIN) {
            self.lookup(xid)?;
            return Ok(());
        }
        if flags.contains(XaFlags::RESUME) {
            return self.lookup(xid)?.resume().map_err(|e| self.to_xa(e));
        }
        let origin = format!("node-{}", xid.global_id().node_id());
        self.manager
            .import(xid.global_id(), &origin)
            .map(|_| ())
            .map_err(|e| self.to_xa(e))
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()> {
        let txn = self.lookup(xid)?;
        if flags.contains(XaFlags::FAIL) {
            txn.set_rollback_only();
        } else if flags.contains(XaFlags::SUSPEND) {
            txn.suspend().map_err(|e| self.to_xa(e))?;
        }
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        let txn = self.lookup(xid)?;
        let result = txn.participant_prepare();
        self.settle(&txn);
        match result {
            Ok(vote) => Ok(vote),
            // The local part already rolled back.
            Err(TransactionError::Log(e)) => Err(XaError::new(
                XaErrorKind::RollbackRequired,
                format!("{}: {}", self.address, e),
            )),
            Err(e) => Err(self.to_xa(e)),
        }
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        let txn = self.lookup(xid)?;
        let result = txn.participant_commit(one_phase);
        self.settle(&txn);
        let completion = result.map_err(|e| self.to_xa(e))?;
        self.answer(completion, Outcome::Committed)
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        let txn = self.lookup(xid)?;
        let result = txn.participant_rollback();
        self.settle(&txn);
        let completion = result.map_err(|e| self.to_xa(e))?;
        self.answer(completion, Outcome::RolledBack)
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        let Some(txn) = self.manager.lookup(&xid.global_id()) else {
            return Ok(());
        };
        txn.forget().map_err(|e| self.to_xa(e))?;
        self.manager.repository().remove(&xid.global_id());
        Ok(())
    }

    /// Lists participant transactions that are prepared or still committing.
    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>> {
        if !flags.contains(XaFlags::START_RSCAN) {
            return Ok(Vec::new());
        }
        Ok(self
            .manager
            .repository()
            .transactions()
            .into_iter()
            .filter(|txn| !txn.is_coordinator())
            .filter(|txn| {
                matches!(
                    txn.status(),
                    TransactionStatus::Prepared | TransactionStatus::Committing
                )
            })
            .map(|txn| Xid::for_transaction(txn.global_id()))
            .collect())
    }
}
