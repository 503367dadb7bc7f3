//! Persistence contract consumed by the transaction and recovery layers.

use super::error::LogResult;
use crate::branch::BranchRecord;
use crate::transaction::{GlobalId, TransactionArchive};

/// Durable store of transaction archives.
pub trait TransactionStore: Send + Sync {
    /// Persists a new archive.
    fn create_transaction(&self, archive: &TransactionArchive) -> LogResult<()>;

    /// Replaces the archive with the same global id.
    fn update_transaction(&self, archive: &TransactionArchive) -> LogResult<()>;

    /// Removes the archive of a finished transaction.
    fn delete_transaction(&self, global_id: &GlobalId) -> LogResult<()>;

    /// Replaces one branch record inside an archive.
    fn update_resource(&self, global_id: &GlobalId, record: &BranchRecord) -> LogResult<()>;

    /// Invokes `callback` once per archive that has not been deleted.
    fn recover(&self, callback: &mut dyn FnMut(TransactionArchive));

    /// Looks up the archive of `global_id`.
    fn get(&self, global_id: &GlobalId) -> Option<TransactionArchive>;
}
