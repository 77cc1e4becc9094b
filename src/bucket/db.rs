//! Bucket database.
//!
//! Maps each bucket to its current replica list with per-replica content
//! metadata. The stripe owns the database; operations take read-only
//! snapshots at decision points, so mutations are only observable between
//! callbacks.

use crate::bucket::replica::{ReplicaInfo, ReplicaSnapshot};
use crate::document::id::{BucketId, BucketSpace};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One bucket's entry: replica list plus reshard state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketEntry {
    /// Replicas in node order.
    pub replicas: Vec<ReplicaInfo>,

    /// A split or join is pending.
    pub pending_reshard: bool,
}

impl BucketEntry {
    /// Entry with the given replicas and no pending reshard.
    pub fn new(replicas: Vec<ReplicaInfo>) -> Self {
        Self {
            replicas,
            pending_reshard: false,
        }
    }
}

/// In-memory bucket database covering all served bucket spaces.
#[derive(Debug, Default)]
pub struct BucketDatabase {
    spaces: HashMap<BucketSpace, BTreeMap<BucketId, BucketEntry>>,
}

impl BucketDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a bucket entry.
    pub fn upsert(&mut self, space: BucketSpace, bucket: BucketId, entry: BucketEntry) {
        self.spaces.entry(space).or_default().insert(bucket, entry);
    }

    /// Remove a bucket entry.
    pub fn remove(&mut self, space: BucketSpace, bucket: BucketId) -> Option<BucketEntry> {
        self.spaces.get_mut(&space)?.remove(&bucket)
    }

    /// Look up a bucket entry.
    pub fn get(&self, space: BucketSpace, bucket: BucketId) -> Option<&BucketEntry> {
        self.spaces.get(&space)?.get(&bucket)
    }

    /// Mutable lookup, for repair and test fixtures.
    pub fn get_mut(&mut self, space: BucketSpace, bucket: BucketId) -> Option<&mut BucketEntry> {
        self.spaces.get_mut(&space)?.get_mut(&bucket)
    }

    /// Take a point-in-time replica snapshot for a bucket.
    ///
    /// An unknown bucket yields an empty snapshot, which the consistency
    /// oracle treats as slow-path-only.
    pub fn snapshot(&self, space: BucketSpace, bucket: BucketId) -> ReplicaSnapshot {
        match self.get(space, bucket) {
            Some(entry) => ReplicaSnapshot {
                bucket,
                replicas: entry.replicas.clone(),
                pending_reshard: entry.pending_reshard,
            },
            None => ReplicaSnapshot::empty(bucket),
        }
    }

    /// Number of buckets tracked in a space.
    pub fn bucket_count(&self, space: BucketSpace) -> usize {
        self.spaces.get(&space).map_or(0, |m| m.len())
    }
}
