//! Global transactions.
//!
//! This module provides:
//! - Global and branch identifiers
//! - The transaction state machine driving two-phase commit
//! - The repository of live transactions and thread associations
//! - The transaction manager used by applications

pub mod archive;
pub mod error;
pub mod id;
pub mod machine;
pub mod manager;
pub mod repository;
pub mod services;
pub mod state;
pub mod synchronization;

pub use archive::TransactionArchive;
pub use error::{Completion, Outcome, TransactionError, TransactionResult};
pub use id::{GlobalId, Xid, XidFactory, FORMAT_ID, GLOBAL_ID_LEN};
pub use machine::Transaction;
pub use manager::TransactionManager;
pub use repository::Repository;
pub use services::TransactionServices;
pub use state::{now_millis, TransactionContext, TransactionStatus};
pub use synchronization::Synchronization;
