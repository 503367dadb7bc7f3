//! XA branch protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use thiserror::Error;

use crate::transaction::Xid;

/// A branch's answer to prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// The branch made durable changes and is ready to commit.
    Ok,
    /// The branch made no durable change and needs no second phase.
    ReadOnly,
}

/// Flags passed to `start`, `end` and `recover`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XaFlags(u32);

impl XaFlags {
    pub const NO_FLAGS: XaFlags = XaFlags(0);
    pub const JOIN: XaFlags = XaFlags(0x0020_0000);
    pub const END_RSCAN: XaFlags = XaFlags(0x0080_0000);
    pub const START_RSCAN: XaFlags = XaFlags(0x0100_0000);
    pub const SUSPEND: XaFlags = XaFlags(0x0200_0000);
    pub const SUCCESS: XaFlags = XaFlags(0x0400_0000);
    pub const RESUME: XaFlags = XaFlags(0x0800_0000);
    pub const FAIL: XaFlags = XaFlags(0x2000_0000);

    /// Returns the raw bit pattern.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub fn contains(&self, other: XaFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for XaFlags {
    type Output = XaFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        XaFlags(self.0 | rhs.0)
    }
}

/// Classification of a failed branch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaErrorKind {
    /// The branch rolled back, or can only roll back.
    RollbackRequired,
    /// The resource manager heuristically committed the branch.
    HeuristicCommit,
    /// The resource manager heuristically rolled back the branch.
    HeuristicRollback,
    /// Part of the branch committed and part rolled back.
    HeuristicMixed,
    /// The branch outcome cannot be determined.
    HeuristicHazard,
    /// The resource manager does not know the branch.
    UnknownBranch,
    /// The resource manager is temporarily unreachable.
    Unavailable,
    /// The resource manager failed in a way that is not retryable.
    ResourceFailure,
    /// The call was not valid in the branch's current state.
    Protocol,
}

impl XaErrorKind {
    /// Returns true for the heuristic family.
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

impl fmt::Display for XaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RollbackRequired => "rollback required",
            Self::HeuristicCommit => "heuristic commit",
            Self::HeuristicRollback => "heuristic rollback",
            Self::HeuristicMixed => "heuristic mixed",
            Self::HeuristicHazard => "heuristic hazard",
            Self::UnknownBranch => "unknown branch",
            Self::Unavailable => "resource unavailable",
            Self::ResourceFailure => "resource failure",
            Self::Protocol => "protocol error",
        };
        f.write_str(name)
    }
}

/// Error returned by a branch call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct XaError {
    pub kind: XaErrorKind,
    pub message: String,
}

impl XaError {
    pub fn new(kind: XaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::new(XaErrorKind::RollbackRequired, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(XaErrorKind::Unavailable, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(XaErrorKind::Protocol, message)
    }
}

/// Result type for branch calls.
pub type XaResult<T> = std::result::Result<T, XaError>;

/// A resource manager taking part in global transactions.
///
/// Native resources (databases, queues) and peer coordinators acting for remote
/// participants both implement this trait; the coordinator does not tell them apart
/// beyond the descriptor they were enlisted with.
pub trait XaResource: Send + Sync {
    /// Stable key identifying the resource manager across restarts.
    fn resource_key(&self) -> String;

    /// Associates work with the branch.
    fn start(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    /// Dissociates work from the branch.
    fn end(&self, xid: &Xid, flags: XaFlags) -> XaResult<()>;

    /// Asks the branch to prepare.
    fn prepare(&self, xid: &Xid) -> XaResult<Vote>;

    /// Commits the branch, skipping prepare when `one_phase` is set.
    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    /// Rolls the branch back.
    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// Releases state the resource manager kept for a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> XaResult<()>;

    /// Lists branches the resource manager holds prepared or heuristically completed.
    fn recover(&self, flags: XaFlags) -> XaResult<Vec<Xid>>;

    /// Returns true if `other` talks to the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_key() == other.resource_key()
    }
}
