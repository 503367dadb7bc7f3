//! Shared fakes for the integration tests.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use xacoord::branch::BranchRecord;
use xacoord::resource::{Vote, XaError, XaErrorKind, XaFlags, XaResource, XaResult};
use xacoord::transaction::{GlobalId, TransactionArchive, Xid};
use xacoord::txlog::{LogResult, TransactionLog, TransactionStore};

/// Knobs and bookkeeping of a [`FakeRm`].
#[derive(Debug, Default)]
pub struct RmState {
    pub active: HashSet<Xid>,
    pub prepared: HashSet<Xid>,
    pub committed: Vec<Xid>,
    pub rolled_back: Vec<Xid>,
    pub forgotten: Vec<Xid>,
    pub read_only: bool,
    pub prepare_error: Option<XaErrorKind>,
    pub commit_error: Option<XaErrorKind>,
    pub panic_on_commit: bool,
}

/// An in-memory resource manager following the branch protocol.
pub struct FakeRm {
    key: String,
    pub state: Mutex<RmState>,
}

impl FakeRm {
    pub fn new(key: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            state: Mutex::new(RmState::default()),
        })
    }

    pub fn committed(&self) -> usize {
        self.state.lock().committed.len()
    }

    pub fn rolled_back(&self) -> usize {
        self.state.lock().rolled_back.len()
    }

    pub fn in_doubt(&self) -> usize {
        self.state.lock().prepared.len()
    }

    fn error(&self, kind: XaErrorKind) -> XaError {
        XaError::new(kind, self.key.clone())
    }
}

impl XaResource for FakeRm {
    fn resource_key(&self) -> String {
        self.key.clone()
    }

    fn start(&self, xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.state.lock().active.insert(*xid);
        Ok(())
    }

    fn end(&self, _xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        let mut state = self.state.lock();
        state.active.remove(xid);
        if let Some(kind) = state.prepare_error {
            state.rolled_back.push(*xid);
            return Err(self.error(kind));
        }
        if state.read_only {
            return Ok(Vote::ReadOnly);
        }
        state.prepared.insert(*xid);
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        let mut state = self.state.lock();
        if state.panic_on_commit {
            drop(state);
            panic!("{} crashed before committing {}", self.key, xid);
        }
        let known = if one_phase {
            state.active.remove(xid)
        } else {
            state.prepared.remove(xid)
        };
        if !known {
            return Err(self.error(XaErrorKind::UnknownBranch));
        }
        match state.commit_error {
            Some(XaErrorKind::HeuristicRollback) => {
                state.rolled_back.push(*xid);
                Err(self.error(XaErrorKind::HeuristicRollback))
            }
            Some(kind) => {
                state.prepared.insert(*xid);
                Err(self.error(kind))
            }
            None => {
                state.committed.push(*xid);
                Ok(())
            }
        }
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        let mut state = self.state.lock();
        if state.prepared.remove(xid) || state.active.remove(xid) {
            state.rolled_back.push(*xid);
            Ok(())
        } else {
            Err(self.error(XaErrorKind::UnknownBranch))
        }
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.state.lock().forgotten.push(*xid);
        Ok(())
    }

    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>> {
        if flags.contains(XaFlags::START_RSCAN) {
            Ok(self.state.lock().prepared.iter().copied().collect())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Passes everything through to a [`TransactionLog`] and keeps every branch update.
pub struct RecordingStore {
    pub log: TransactionLog,
    pub branch_updates: Mutex<Vec<BranchRecord>>,
}

impl RecordingStore {
    pub fn new(log: TransactionLog) -> Arc<Self> {
        Arc::new(Self {
            log,
            branch_updates: Mutex::new(Vec::new()),
        })
    }
}

impl TransactionStore for RecordingStore {
    fn create_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.log.create_transaction(archive)
    }

    fn update_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.log.update_transaction(archive)
    }

    fn delete_transaction(&self, global_id: &GlobalId) -> LogResult<()> {
        self.log.delete_transaction(global_id)
    }

    fn update_resource(&self, global_id: &GlobalId, record: &BranchRecord) -> LogResult<()> {
        self.branch_updates.lock().push(record.clone());
        self.log.update_resource(global_id, record)
    }

    fn recover(&self, callback: &mut dyn FnMut(TransactionArchive)) {
        self.log.recover(callback)
    }

    fn get(&self, global_id: &GlobalId) -> Option<TransactionArchive> {
        self.log.get(global_id)
    }
}
