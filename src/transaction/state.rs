//! Transaction status and per-transaction context.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The possible states of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Work is in progress and branches may still be enlisted.
    Active,
    /// The only possible outcome is rollback.
    MarkedRollback,
    /// Branches are being asked to prepare.
    Preparing,
    /// Every voting branch answered OK and the decision is logged.
    Prepared,
    /// Branches are being told to commit.
    Committing,
    /// The transaction has been committed.
    Committed,
    /// Branches are being told to roll back.
    RollingBack,
    /// The transaction has been rolled back.
    RolledBack,
    /// Status could not be determined.
    Unknown,
    /// No transaction is associated.
    NoTransaction,
}

impl TransactionStatus {
    /// Returns true once the transaction reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    /// Returns true while branches may still be enlisted or delisted.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }

    /// Returns true if the commit decision has been made.
    pub fn is_commit_decided(&self) -> bool {
        matches!(self, Self::Prepared | Self::Committing)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::MarkedRollback => 1,
            Self::Preparing => 2,
            Self::Prepared => 3,
            Self::Committing => 4,
            Self::Committed => 5,
            Self::RollingBack => 6,
            Self::RolledBack => 7,
            Self::Unknown => 8,
            Self::NoTransaction => 9,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::MarkedRollback,
            2 => Self::Preparing,
            3 => Self::Prepared,
            4 => Self::Committing,
            5 => Self::Committed,
            6 => Self::RollingBack,
            7 => Self::RolledBack,
            9 => Self::NoTransaction,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::MarkedRollback => "MarkedRollback",
            Self::Preparing => "Preparing",
            Self::Prepared => "Prepared",
            Self::Committing => "Committing",
            Self::Committed => "Committed",
            Self::RollingBack => "RollingBack",
            Self::RolledBack => "RolledBack",
            Self::Unknown => "Unknown",
            Self::NoTransaction => "NoTransaction",
        };
        f.write_str(name)
    }
}

/// Returns the current time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Context carried by every transaction, coordinator or participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// Address of the coordinator that propagated this transaction, if any.
    pub propagated_by: Option<String>,
    /// True if this node coordinates the transaction.
    pub coordinator: bool,
    /// Creation time in unix milliseconds.
    pub created_at: u64,
    /// Deadline in unix milliseconds.
    pub expires_at: u64,
    /// True if the transaction was reconstructed from the log.
    pub recovery: bool,
    /// Number of recovery attempts made so far.
    pub recovered_times: u32,
}

impl TransactionContext {
    /// Context for a transaction coordinated by this node.
    pub fn coordinator(timeout: Duration) -> Self {
        let created_at = now_millis();
        Self {
            propagated_by: None,
            coordinator: true,
            created_at,
            expires_at: created_at + timeout.as_millis() as u64,
            recovery: false,
            recovered_times: 0,
        }
    }

    /// Context for a branch of a transaction coordinated by `origin`.
    pub fn participant(origin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            propagated_by: Some(origin.into()),
            coordinator: false,
            ..Self::coordinator(timeout)
        }
    }

    /// Returns true if the deadline has passed at `now` (unix millis).
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Moves the deadline to `timeout` from now.
    pub fn reset_timeout(&mut self, timeout: Duration) {
        self.expires_at = now_millis() + timeout.as_millis() as u64;
    }
}
