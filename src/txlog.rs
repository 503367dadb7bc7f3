//! Transaction log.
//!
//! An append-only file that persists transaction archives keyed by global id:
//! - A fixed header holding the valid record range (min/max offset)
//! - Variable-length records (add/modify/delete transaction, modify branch)
//! - Replay into an in-memory map on open, so the log doubles as a persisted map
//! - Background compaction that squeezes out deleted and superseded records
//!
//! Any type implementing [`TransactionStore`] can stand in for the file log.

pub mod compactor;
pub mod error;
pub mod file;
pub mod record;
pub mod store;

pub use compactor::Compaction;
pub use error::{LogError, LogResult};
pub use file::TransactionLog;
pub use record::{LogHeader, LogOp, LogRecord, HEADER_SIZE, RECORD_FIXED_LEN};
pub use store::TransactionStore;
