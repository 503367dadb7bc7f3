//! Resource descriptors persisted alongside branch records.

use serde::{Deserialize, Serialize};

/// How the coordinator reaches a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Directly attached resource manager.
    Native,
    /// Participant reachable only through a peer coordinator.
    Remote,
    /// Resource whose origin could not be classified; handled like a native one.
    Unidentified,
}

/// Identifies a resource inside an archive so recovery can find it again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    /// Registry key: a resource key for native resources, a peer address for remote ones.
    pub identifier: String,
    /// False for resources that can only commit in one phase.
    pub two_phase: bool,
}

impl ResourceDescriptor {
    pub fn native(identifier: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Native,
            identifier: identifier.into(),
            two_phase: true,
        }
    }

    pub fn remote(address: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Remote,
            identifier: address.into(),
            two_phase: true,
        }
    }

    pub fn unidentified(identifier: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Unidentified,
            identifier: identifier.into(),
            two_phase: true,
        }
    }

    /// A native resource without prepare support, eligible for the last-resource path.
    pub fn one_phase(identifier: impl Into<String>) -> Self {
        Self {
            two_phase: false,
            ..Self::native(identifier)
        }
    }

    /// Returns true if the branch belongs on the remote side.
    pub fn is_remote(&self) -> bool {
        self.kind == ResourceKind::Remote
    }
}
