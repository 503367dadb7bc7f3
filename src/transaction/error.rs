//! Transaction errors and completion outcomes.

use thiserror::Error;

use super::id::GlobalId;
use super::state::TransactionStatus;
use crate::resource::XaError;
use crate::txlog::LogError;

/// Errors returned by transaction operations.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {global_id} is {status}")]
    IllegalState {
        global_id: GlobalId,
        status: TransactionStatus,
    },

    #[error("transaction {global_id} can only roll back: {cause}")]
    RollbackOnly { global_id: GlobalId, cause: String },

    #[error("transaction {0} not found")]
    NotFound(GlobalId),

    #[error("no transaction associated with the current thread")]
    NoTransaction,

    #[error("thread is already associated with transaction {0}")]
    AlreadyAssociated(GlobalId),

    #[error("resource error: {0}")]
    Resource(#[from] XaError),

    #[error("transaction log error: {0}")]
    Log(#[from] LogError),
}

/// Result type for transaction operations.
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// How a completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
    /// Rollback was requested, some resource committed on its own.
    HeuristicCommit,
    /// Commit was requested, the work was rolled back.
    HeuristicRollback,
    /// Part of the work committed and part rolled back.
    HeuristicMixed,
    /// The outcome of some branch cannot be determined.
    HeuristicHazard,
    /// Some branch could not be reached; recovery will finish the job.
    CompletionRequired,
}

impl Outcome {
    pub fn is_heuristic(&self) -> bool {
        matches!(
            self,
            Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
                | Self::HeuristicHazard
        )
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
            Self::HeuristicCommit => "heuristic commit",
            Self::HeuristicRollback => "heuristic rollback",
            Self::HeuristicMixed => "heuristic mixed",
            Self::HeuristicHazard => "heuristic hazard",
            Self::CompletionRequired => "completion required",
        };
        f.write_str(name)
    }
}

/// Result of a commit or rollback, with the reason when it differs from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub outcome: Outcome,
    pub cause: Option<String>,
}

impl Completion {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            cause: None,
        }
    }

    pub fn with_cause(outcome: Outcome, cause: impl Into<String>) -> Self {
        Self {
            outcome,
            cause: Some(cause.into()),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.outcome == Outcome::Committed
    }
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{} ({})", self.outcome, cause),
            None => write!(f, "{}", self.outcome),
        }
    }
}
