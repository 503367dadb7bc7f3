//! Crash recovery.
//!
//! This module re-drives transactions that could not finish, including:
//! - Transactions whose completion left branches unresolved
//! - Transactions reconstructed from the log after a restart
//! - Orphan branches that resources report but no log entry explains

pub mod backoff;
pub mod engine;

pub use backoff::{Backoff, MAX_DOUBLINGS};
pub use engine::{decide, RecoveryAction, RecoveryEngine, RecoveryStats};
