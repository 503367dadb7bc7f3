//! Transaction log error types.

use thiserror::Error;

/// Errors that can occur in the transaction log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Record too large: {size} bytes (max: {max})")]
    RecordTooLarge { size: usize, max: usize },

    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: u64, reason: String },

    #[error("Invalid log header: {0}")]
    InvalidHeader(String),

    #[error("Transaction log is closed")]
    Closed,
}

/// Result type for transaction log operations.
pub type LogResult<T> = Result<T, LogError>;
