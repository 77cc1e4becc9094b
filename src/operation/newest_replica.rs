//! Newest-replica selection.
//!
//! After the metadata phase the slow path reads the full document from one
//! replica only: the one holding the newest persisted version. Ties break
//! toward the lowest node index so the choice is deterministic across
//! distributors.

use crate::core::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// One metadata-get sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSample {
    /// Replying node.
    pub node: u16,

    /// Persisted-timestamp the node reported; zero when it has no version.
    pub persisted_timestamp: Timestamp,

    /// Replica content checksum the node reported.
    pub checksum: u32,
}

/// The replica chosen to serve the full get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewestReplica {
    /// Chosen node.
    pub node: u16,

    /// Its persisted-timestamp.
    pub persisted_timestamp: Timestamp,
}

/// Select the newest replica from metadata samples.
///
/// Highest persisted-timestamp wins; ties break toward the lowest node
/// index. A zero timestamp loses to any nonzero one. Returns `None` for an
/// empty sample set.
pub fn select_newest(samples: &[MetadataSample]) -> Option<NewestReplica> {
    samples
        .iter()
        .copied()
        .reduce(|best, candidate| {
            let newer = candidate.persisted_timestamp > best.persisted_timestamp;
            let tied_lower_node = candidate.persisted_timestamp == best.persisted_timestamp
                && candidate.node < best.node;
            if newer || tied_lower_node {
                candidate
            } else {
                best
            }
        })
        .map(|sample| NewestReplica {
            node: sample.node,
            persisted_timestamp: sample.persisted_timestamp,
        })
}
