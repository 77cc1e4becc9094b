//! Replica metadata and point-in-time snapshots.

use crate::document::id::BucketId;
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Status bits for one replica.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ReplicaFlags: u32 {
        /// Node has loaded the bucket and can serve reads.
        const READY   = 0b0000_0001;
        /// Replica is the active copy for external reads.
        const ACTIVE  = 0b0000_0010;
        /// Contents verified against the majority.
        const TRUSTED = 0b0000_0100;
    }
}

impl Default for ReplicaFlags {
    fn default() -> Self {
        Self::READY | Self::TRUSTED
    }
}

/// One stored copy of a bucket on one storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Storage node index.
    pub node: u16,

    /// Number of documents the node reports for the bucket.
    pub doc_count: u32,

    /// Content checksum the node reports for the bucket.
    pub checksum: u32,

    /// Status bits.
    pub flags: ReplicaFlags,
}

impl ReplicaInfo {
    /// Create a replica entry with default flags.
    pub fn new(node: u16, doc_count: u32, checksum: u32) -> Self {
        Self {
            node,
            doc_count,
            checksum,
            flags: ReplicaFlags::default(),
        }
    }

    /// The (doc-count, checksum) tuple used by consistency checks.
    pub fn content_signature(&self) -> (u32, u32) {
        (self.doc_count, self.checksum)
    }
}

/// Immutable view of a bucket's replica set at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    /// The bucket.
    pub bucket: BucketId,

    /// Replicas in node order.
    pub replicas: Vec<ReplicaInfo>,

    /// A split or join is pending for this bucket.
    pub pending_reshard: bool,
}

impl ReplicaSnapshot {
    /// Snapshot with no replicas.
    pub fn empty(bucket: BucketId) -> Self {
        Self {
            bucket,
            replicas: Vec::new(),
            pending_reshard: false,
        }
    }

    /// Whether the replica set is empty.
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Node indexes in snapshot order.
    pub fn nodes(&self) -> Vec<u16> {
        self.replicas.iter().map(|r| r.node).collect()
    }

    /// The (bucket, node) pairs used to detect replica-set changes later.
    pub fn replica_state(&self) -> Vec<(BucketId, u16)> {
        self.replicas.iter().map(|r| (self.bucket, r.node)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags_are_ready_and_trusted() {
        let flags = ReplicaFlags::default();
        assert!(flags.contains(ReplicaFlags::READY));
        assert!(flags.contains(ReplicaFlags::TRUSTED));
        assert!(!flags.contains(ReplicaFlags::ACTIVE));
    }

    #[test]
    fn replica_state_captures_bucket_and_node() {
        let bucket = BucketId::from_raw(0x42);
        let snapshot = ReplicaSnapshot {
            bucket,
            replicas: vec![ReplicaInfo::new(0, 10, 0xABCD), ReplicaInfo::new(1, 10, 0xABCD)],
            pending_reshard: false,
        };
        assert_eq!(snapshot.replica_state(), vec![(bucket, 0), (bucket, 1)]);
        assert_eq!(snapshot.nodes(), vec![0, 1]);
    }
}
