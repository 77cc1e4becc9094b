//! Distributor ownership of buckets.
//!
//! Buckets are spread over the distributor fleet by hashing the bucket id
//! with a seed derived from the cluster-state version:
//! `owner = hash64(bucket_raw, seed = state_version) % distributor_count`
//!
//! A cluster-state version bump reshuffles ownership, which is exactly what
//! invalidates in-flight operations: the coordinator re-checks ownership
//! before every post-get dispatch.

use crate::document::id::BucketId;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// A versioned view of the distributor fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateView {
    /// Cluster-state version; bumps on every redistribution.
    pub version: u64,

    /// Number of distributors sharing the bucket space.
    pub distributor_count: u16,

    /// This distributor's index.
    pub local_index: u16,
}

impl ClusterStateView {
    /// Create a view.
    pub fn new(version: u64, distributor_count: u16, local_index: u16) -> Self {
        debug_assert!(local_index < distributor_count);
        Self {
            version,
            distributor_count,
            local_index,
        }
    }

    /// The distributor index responsible for a bucket under this view.
    pub fn ideal_distributor(&self, bucket: BucketId) -> u16 {
        let mut hasher = XxHash64::with_seed(self.version);
        hasher.write(&bucket.raw().to_be_bytes());
        (hasher.finish() % u64::from(self.distributor_count)) as u16
    }

    /// Whether this distributor owns the bucket under this view.
    pub fn owns_bucket(&self, bucket: BucketId) -> bool {
        self.ideal_distributor(bucket) == self.local_index
    }
}
