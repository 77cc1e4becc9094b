//! Fast-path eligibility.
//!
//! Direct per-replica updates are safe only when every stored copy is
//! already bit-identical; otherwise the copies would diverge further. The
//! oracle is a pure predicate over a replica snapshot.

use crate::bucket::replica::ReplicaSnapshot;

/// Decide whether a replica snapshot allows the direct-update fast path.
///
/// Eligible iff there is at least one replica, every replica reports the
/// same (doc-count, checksum) signature, no split or join is pending, and
/// the operation is not forced onto the safe path. An empty replica set is
/// never eligible; the slow path handles create-if-missing there.
pub fn is_fast_path_eligible(snapshot: &ReplicaSnapshot, force_safe_path: bool) -> bool {
    if force_safe_path || snapshot.pending_reshard || snapshot.is_empty() {
        return false;
    }
    let signature = snapshot.replicas[0].content_signature();
    snapshot
        .replicas
        .iter()
        .all(|r| r.content_signature() == signature)
}
