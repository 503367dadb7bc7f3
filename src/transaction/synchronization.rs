//! Completion listeners.

use super::state::TransactionStatus;

/// Callbacks around the completion of a transaction.
///
/// Callbacks may read the transaction status or mark it rollback-only, but must not
/// complete it.
pub trait Synchronization: Send + Sync {
    /// Called before a commit starts. An error marks the transaction rollback-only.
    fn before_completion(&self) -> anyhow::Result<()>;

    /// Called once the transaction completed, whatever the outcome.
    fn after_completion(&self, status: TransactionStatus);
}
