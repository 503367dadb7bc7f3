//! Distributed transaction coordinator implementing two-phase commit over an
//! XA-style branch protocol.
//!
//! - [`transaction`]: the transaction state machine, repository and manager
//! - [`branch`]: prepare/commit/rollback/forget over one side's branches
//! - [`recovery`]: re-drive of unfinished transactions with exponential backoff
//! - [`txlog`]: the append-only transaction log with online compaction
//! - [`remote`]: the participant endpoint peers enlist as a remote branch
//! - [`coordinator`]: wiring of all of the above plus the background workers

pub mod branch;
pub mod config;
pub mod coordinator;
pub mod recovery;
pub mod remote;
pub mod resource;
pub mod transaction;
pub mod txlog;
pub mod worker;

#[cfg(test)]
mod testkit;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
