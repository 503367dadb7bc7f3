//! Branch outcomes and their reduction to one result per round.

use crate::resource::{Vote, XaErrorKind};

/// Outcome a failed branch call reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    HeuristicCommit,
    HeuristicRollback,
    HeuristicMixed,
    HeuristicHazard,
    RollbackRequired,
    /// Transient failure; the call must be retried later.
    Unavailable,
    /// Hard resource error.
    Failed,
}

impl From<XaErrorKind> for BranchOutcome {
    fn from(kind: XaErrorKind) -> Self {
        match kind {
            XaErrorKind::RollbackRequired => Self::RollbackRequired,
            XaErrorKind::HeuristicCommit => Self::HeuristicCommit,
            XaErrorKind::HeuristicRollback => Self::HeuristicRollback,
            XaErrorKind::HeuristicMixed => Self::HeuristicMixed,
            XaErrorKind::HeuristicHazard => Self::HeuristicHazard,
            XaErrorKind::Unavailable => Self::Unavailable,
            XaErrorKind::UnknownBranch
            | XaErrorKind::ResourceFailure
            | XaErrorKind::Protocol => Self::Failed,
        }
    }
}

/// Result of preparing one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// `Ok` if any branch voted OK, `ReadOnly` otherwise.
    Vote(Vote),
    /// A branch declined; the transaction must roll back.
    RollbackRequired { cause: String },
}

impl PrepareOutcome {
    pub fn rollback(cause: impl Into<String>) -> Self {
        Self::RollbackRequired {
            cause: cause.into(),
        }
    }
}

/// Classification of a completion round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    /// Every non-read-only branch committed.
    Committed,
    /// Every non-read-only branch rolled back.
    RolledBack,
    /// Nothing but read-only branches (or no branches at all).
    ReadOnly,
    /// Some branches committed while others rolled back.
    Mixed,
    /// At least one branch outcome cannot be determined.
    Hazard,
    /// At least one branch could not be reached; completion is still required.
    Incomplete,
}

/// Per-round counters of branch outcomes, mergeable across sides.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompletionTally {
    pub committed: usize,
    pub rolled_back: usize,
    pub read_only: usize,
    pub mixed: usize,
    pub hazard: usize,
    pub incomplete: usize,
    /// Branches that reached their outcome through a heuristic decision.
    pub heuristic: usize,
}

impl CompletionTally {
    pub fn merge(&mut self, other: CompletionTally) {
        self.committed += other.committed;
        self.rolled_back += other.rolled_back;
        self.read_only += other.read_only;
        self.mixed += other.mixed;
        self.hazard += other.hazard;
        self.incomplete += other.incomplete;
        self.heuristic += other.heuristic;
    }

    pub fn merged(mut self, other: CompletionTally) -> Self {
        self.merge(other);
        self
    }

    /// Total number of branches counted.
    pub fn total(&self) -> usize {
        self.committed
            + self.rolled_back
            + self.read_only
            + self.mixed
            + self.hazard
            + self.incomplete
    }

    /// Reduces the tally to one result.
    ///
    /// Read-only branches are neutral. A committed branch next to a rolled-back one is
    /// mixed, and mixed wins over every other result.
    pub fn classify(&self) -> RoundResult {
        if self.mixed > 0 || (self.committed > 0 && self.rolled_back > 0) {
            RoundResult::Mixed
        } else if self.incomplete > 0 {
            RoundResult::Incomplete
        } else if self.hazard > 0 {
            RoundResult::Hazard
        } else if self.committed > 0 {
            RoundResult::Committed
        } else if self.rolled_back > 0 {
            RoundResult::RolledBack
        } else {
            RoundResult::ReadOnly
        }
    }

    /// True if some branch still needs a completion call.
    pub fn needs_completion(&self) -> bool {
        self.incomplete > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally(committed: usize, rolled_back: usize, read_only: usize) -> CompletionTally {
        CompletionTally {
            committed,
            rolled_back,
            read_only,
            ..Default::default()
        }
    }

    #[test]
    fn test_classify_uniform() {
        assert_eq!(tally(2, 0, 0).classify(), RoundResult::Committed);
        assert_eq!(tally(0, 2, 0).classify(), RoundResult::RolledBack);
        assert_eq!(tally(0, 0, 2).classify(), RoundResult::ReadOnly);
        assert_eq!(tally(0, 0, 0).classify(), RoundResult::ReadOnly);
    }

    #[test]
    fn test_read_only_is_neutral() {
        assert_eq!(tally(1, 0, 3).classify(), RoundResult::Committed);
        assert_eq!(tally(0, 1, 3).classify(), RoundResult::RolledBack);
    }

    #[test]
    fn test_mixed_dominates() {
        assert_eq!(tally(1, 1, 0).classify(), RoundResult::Mixed);

        let mut t = tally(5, 0, 0);
        t.mixed = 1;
        t.incomplete = 1;
        t.hazard = 1;
        assert_eq!(t.classify(), RoundResult::Mixed);
    }

    #[test]
    fn test_incomplete_before_hazard() {
        let mut t = tally(1, 0, 0);
        t.hazard = 1;
        assert_eq!(t.classify(), RoundResult::Hazard);
        t.incomplete = 1;
        assert_eq!(t.classify(), RoundResult::Incomplete);
        assert!(t.needs_completion());
    }

    #[test]
    fn test_merge_sides() {
        let native = tally(1, 0, 1);
        let remote = tally(0, 1, 0);
        let both = native.merged(remote);
        assert_eq!(both.total(), 3);
        assert_eq!(both.classify(), RoundResult::Mixed);
    }

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(
            BranchOutcome::from(XaErrorKind::Unavailable),
            BranchOutcome::Unavailable
        );
        assert_eq!(
            BranchOutcome::from(XaErrorKind::UnknownBranch),
            BranchOutcome::Failed
        );
        assert_eq!(
            BranchOutcome::from(XaErrorKind::HeuristicMixed),
            BranchOutcome::HeuristicMixed
        );
    }
}
