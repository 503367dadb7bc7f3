//! Global transaction and branch identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of a global transaction id in bytes.
///
/// Layout: `node(4) | unix-millis(8) | sequence(4) | random(8)`, big-endian.
pub const GLOBAL_ID_LEN: usize = 24;

/// Format identifier stamped on every branch id issued by this crate.
pub const FORMAT_ID: i32 = 0x5841;

/// Identifier shared by all branches of one distributed transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalId(pub [u8; GLOBAL_ID_LEN]);

impl GlobalId {
    /// Wraps raw identifier bytes.
    pub fn from_bytes(bytes: [u8; GLOBAL_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Returns the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; GLOBAL_ID_LEN] {
        &self.0
    }

    /// Node that issued this id.
    pub fn node_id(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Creation time embedded in the id, in unix milliseconds.
    pub fn created_millis(&self) -> u64 {
        let mut millis = [0u8; 8];
        millis.copy_from_slice(&self.0[4..12]);
        u64::from_be_bytes(millis)
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({})", self)
    }
}

/// Branch identifier: the owning global id plus a branch qualifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    pub format_id: i32,
    pub global: GlobalId,
    pub branch: u32,
}

impl Xid {
    /// The transaction-level id (branch qualifier 0) used when talking to a peer
    /// coordinator about the whole transaction.
    pub fn for_transaction(global: GlobalId) -> Self {
        Self {
            format_id: FORMAT_ID,
            global,
            branch: 0,
        }
    }

    /// Returns the owning global id.
    pub fn global_id(&self) -> GlobalId {
        self.global
    }

    /// Returns the branch qualifier.
    pub fn branch_qualifier(&self) -> u32 {
        self.branch
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.global, self.branch)
    }
}

/// Thread-safe generator of global and branch ids.
pub struct XidFactory {
    node_id: u32,
    sequence: AtomicU32,
}

impl XidFactory {
    /// Creates a factory for the given node.
    pub fn new(node_id: u32) -> Self {
        Self {
            node_id,
            sequence: AtomicU32::new(0),
        }
    }

    /// Node id stamped into every generated global id.
    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Generates a new global id.
    pub fn create_global_id(&self) -> GlobalId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let random: u64 = rand::random();

        let mut bytes = [0u8; GLOBAL_ID_LEN];
        bytes[0..4].copy_from_slice(&self.node_id.to_be_bytes());
        bytes[4..12].copy_from_slice(&millis.to_be_bytes());
        bytes[12..16].copy_from_slice(&sequence.to_be_bytes());
        bytes[16..24].copy_from_slice(&random.to_be_bytes());
        GlobalId(bytes)
    }

    /// Derives the id of branch `qualifier` of `global`.
    pub fn create_branch_id(&self, global: GlobalId, qualifier: u32) -> Xid {
        Xid {
            format_id: FORMAT_ID,
            global,
            branch: qualifier,
        }
    }

    /// Returns true if `xid` was issued by a factory for this node.
    pub fn owns(&self, xid: &Xid) -> bool {
        xid.format_id == FORMAT_ID && xid.global.node_id() == self.node_id
    }
}

impl Default for XidFactory {
    fn default() -> Self {
        Self::new(std::process::id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_id_layout() {
        let factory = XidFactory::new(7);
        let gid = factory.create_global_id();

        assert_eq!(gid.node_id(), 7);
        assert!(gid.created_millis() > 0);
        assert_eq!(format!("{}", gid).len(), GLOBAL_ID_LEN * 2);
    }

    #[test]
    fn test_branch_id_resolves_to_global() {
        let factory = XidFactory::new(1);
        let gid = factory.create_global_id();

        let b1 = factory.create_branch_id(gid, 1);
        let b2 = factory.create_branch_id(gid, 2);

        assert_ne!(b1, b2);
        assert_eq!(b1.global_id(), gid);
        assert_eq!(b2.global_id(), gid);
        assert_eq!(b2.branch_qualifier(), 2);
    }

    #[test]
    fn test_owns() {
        let ours = XidFactory::new(1);
        let theirs = XidFactory::new(2);

        let xid = ours.create_branch_id(ours.create_global_id(), 1);
        assert!(ours.owns(&xid));
        assert!(!theirs.owns(&xid));

        let foreign = Xid {
            format_id: 99,
            ..xid
        };
        assert!(!ours.owns(&foreign));
    }

    #[test]
    fn test_xid_display() {
        let gid = GlobalId([0u8; GLOBAL_ID_LEN]);
        let xid = Xid::for_transaction(gid);
        assert!(format!("{}", xid).ends_with(":00000000"));
    }

    #[test]
    fn test_global_id_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let factory = Arc::new(XidFactory::new(3));
        let mut handles = vec![];

        for _ in 0..10 {
            let factory = Arc::clone(&factory);
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|_| factory.create_global_id())
                    .collect::<Vec<_>>()
            }));
        }

        let mut all_ids = vec![];
        for handle in handles {
            all_ids.extend(handle.join().unwrap());
        }

        let mut unique = all_ids.clone();
        unique.sort();
        unique.dedup();

        assert_eq!(all_ids.len(), 1000);
        assert_eq!(unique.len(), 1000);
    }
}
