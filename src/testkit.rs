//! Scripted resources and an in-memory store for unit tests.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::branch::BranchRecord;
use crate::resource::{Vote, XaError, XaErrorKind, XaFlags, XaResource, XaResult};
use crate::transaction::{GlobalId, TransactionArchive, Xid};
use crate::txlog::{LogError, LogResult, TransactionStore};

/// Orders calls across every scripted resource.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Canned answers of a [`ScriptedResource`].
#[derive(Debug, Clone)]
pub struct Script {
    pub start: Result<(), XaErrorKind>,
    pub end: Result<(), XaErrorKind>,
    pub prepare: Result<Vote, XaErrorKind>,
    pub commit: Result<(), XaErrorKind>,
    pub rollback: Result<(), XaErrorKind>,
    pub forget: Result<(), XaErrorKind>,
    /// Returned by a recovery scan.
    pub in_doubt: Vec<Xid>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            start: Ok(()),
            end: Ok(()),
            prepare: Ok(Vote::Ok),
            commit: Ok(()),
            rollback: Ok(()),
            forget: Ok(()),
            in_doubt: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Call {
    op: &'static str,
    seq: u64,
    xid: Option<Xid>,
}

/// A resource answering from a [`Script`] and recording every call.
pub struct ScriptedResource {
    name: String,
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedResource {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_script(name, Script::default())
    }

    pub fn with_script(name: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock() = script;
    }

    /// Number of calls of `op`.
    pub fn calls(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    /// Branch of the latest call of `op`.
    pub fn last_xid(&self, op: &str) -> Option<Xid> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|c| c.op == op)
            .and_then(|c| c.xid)
    }

    /// True if the first `op` here happened before the first `other_op` on `other`.
    pub fn called_before(&self, op: &str, other: &ScriptedResource, other_op: &str) -> bool {
        let first = |calls: &[Call], op: &str| calls.iter().find(|c| c.op == op).map(|c| c.seq);
        let mine = first(&self.calls.lock(), op);
        let theirs = first(&other.calls.lock(), other_op);
        matches!((mine, theirs), (Some(a), Some(b)) if a < b)
    }

    fn record(&self, op: &'static str, xid: Option<&Xid>) {
        self.calls.lock().push(Call {
            op,
            seq: SEQUENCE.fetch_add(1, Ordering::SeqCst),
            xid: xid.copied(),
        });
    }

    fn answer<T: Clone>(&self, result: &Result<T, XaErrorKind>) -> XaResult<T> {
        result
            .clone()
            .map_err(|kind| XaError::new(kind, self.name.clone()))
    }
}

impl XaResource for ScriptedResource {
    fn resource_key(&self) -> String {
        self.name.clone()
    }

    fn start(&self, xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.record("start", Some(xid));
        let script = self.script.lock();
        self.answer(&script.start)
    }

    fn end(&self, xid: &Xid, _flags: XaFlags) -> XaResult<()> {
        self.record("end", Some(xid));
        let script = self.script.lock();
        self.answer(&script.end)
    }

    fn prepare(&self, xid: &Xid) -> XaResult<Vote> {
        self.record("prepare", Some(xid));
        let script = self.script.lock();
        self.answer(&script.prepare)
    }

    fn commit(&self, xid: &Xid, _one_phase: bool) -> XaResult<()> {
        self.record("commit", Some(xid));
        let script = self.script.lock();
        self.answer(&script.commit)
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.record("rollback", Some(xid));
        let script = self.script.lock();
        self.answer(&script.rollback)
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.record("forget", Some(xid));
        let script = self.script.lock();
        self.answer(&script.forget)
    }

    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>> {
        self.record("recover", None);
        if flags.contains(XaFlags::START_RSCAN) {
            Ok(self.script.lock().in_doubt.clone())
        } else {
            Ok(Vec::new())
        }
    }
}

/// Store keeping archives in a map.
#[derive(Default)]
pub struct MemoryStore {
    archives: Mutex<HashMap<GlobalId, TransactionArchive>>,
    branch_updates: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch_updates(&self) -> usize {
        self.branch_updates.load(Ordering::SeqCst)
    }

    /// Makes every write fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.archives.lock().len()
    }

    fn check(&self) -> LogResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "store offline",
            )));
        }
        Ok(())
    }
}

impl TransactionStore for MemoryStore {
    fn create_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.check()?;
        self.archives
            .lock()
            .insert(archive.global_id, archive.clone());
        Ok(())
    }

    fn update_transaction(&self, archive: &TransactionArchive) -> LogResult<()> {
        self.create_transaction(archive)
    }

    fn delete_transaction(&self, global_id: &GlobalId) -> LogResult<()> {
        self.check()?;
        self.archives.lock().remove(global_id);
        Ok(())
    }

    fn update_resource(&self, global_id: &GlobalId, record: &BranchRecord) -> LogResult<()> {
        self.check()?;
        self.branch_updates.fetch_add(1, Ordering::SeqCst);
        if let Some(archive) = self.archives.lock().get_mut(global_id) {
            archive.apply_branch(record);
        }
        Ok(())
    }

    fn recover(&self, callback: &mut dyn FnMut(TransactionArchive)) {
        let archives: Vec<_> = self.archives.lock().values().cloned().collect();
        for archive in archives {
            callback(archive);
        }
    }

    fn get(&self, global_id: &GlobalId) -> Option<TransactionArchive> {
        self.archives.lock().get(global_id).cloned()
    }
}
