//! Tests for the bucket layer: snapshots, consistency, ownership.

use stratum::bucket::consistency::is_fast_path_eligible;
use stratum::bucket::db::{BucketDatabase, BucketEntry};
use stratum::bucket::ownership::ClusterStateView;
use stratum::bucket::replica::{ReplicaFlags, ReplicaInfo, ReplicaSnapshot};
use stratum::document::id::{BucketId, BucketSpace, DocumentId};

fn replica(node: u16, docs: u32, checksum: u32) -> ReplicaInfo {
    ReplicaInfo::new(node, docs, checksum)
}

#[test]
fn snapshot_reflects_database_state_at_read_time() {
    let mut db = BucketDatabase::new();
    let bucket = BucketId::from_raw(0x42);
    db.upsert(
        BucketSpace::Default,
        bucket,
        BucketEntry::new(vec![replica(0, 10, 0xABCD)]),
    );

    let before = db.snapshot(BucketSpace::Default, bucket);
    db.upsert(
        BucketSpace::Default,
        bucket,
        BucketEntry::new(vec![replica(0, 10, 0xABCD), replica(1, 10, 0xABCD)]),
    );
    let after = db.snapshot(BucketSpace::Default, bucket);

    // Snapshots are point-in-time views; the first is unaffected.
    assert_eq!(before.replicas.len(), 1);
    assert_eq!(after.replicas.len(), 2);
    assert_ne!(before.replica_state(), after.replica_state());
}

#[test]
fn oracle_eligibility_matrix() {
    let bucket = BucketId::from_raw(0x42);
    let snapshot = |replicas, pending_reshard| ReplicaSnapshot {
        bucket,
        replicas,
        pending_reshard,
    };

    // In sync.
    assert!(is_fast_path_eligible(
        &snapshot(vec![replica(0, 10, 0xABCD), replica(1, 10, 0xABCD)], false),
        false,
    ));
    // Checksum divergence.
    assert!(!is_fast_path_eligible(
        &snapshot(vec![replica(0, 10, 0xABCD), replica(1, 9, 0x1234)], false),
        false,
    ));
    // Doc count divergence with equal checksums.
    assert!(!is_fast_path_eligible(
        &snapshot(vec![replica(0, 10, 0xABCD), replica(1, 9, 0xABCD)], false),
        false,
    ));
    // Pending split or join.
    assert!(!is_fast_path_eligible(
        &snapshot(vec![replica(0, 10, 0xABCD)], true),
        false,
    ));
    // Empty replica set.
    assert!(!is_fast_path_eligible(&snapshot(vec![], false), false));
    // Forced safe path.
    assert!(!is_fast_path_eligible(
        &snapshot(vec![replica(0, 10, 0xABCD)], false),
        true,
    ));
}

#[test]
fn replica_flags_round_trip_through_serde() {
    let mut info = replica(3, 5, 0x99);
    info.flags = ReplicaFlags::READY | ReplicaFlags::ACTIVE;
    let encoded = serde_json::to_string(&info).unwrap();
    let decoded: ReplicaInfo = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, info);
    assert!(decoded.flags.contains(ReplicaFlags::ACTIVE));
    assert!(!decoded.flags.contains(ReplicaFlags::TRUSTED));
}

#[test]
fn ownership_is_stable_within_a_version() {
    let view = ClusterStateView::new(7, 3, 1);
    for raw in 0..64 {
        let bucket = BucketId::from_raw(raw);
        assert_eq!(view.ideal_distributor(bucket), view.ideal_distributor(bucket));
        assert!(view.ideal_distributor(bucket) < 3);
    }
}

#[test]
fn every_bucket_has_exactly_one_owner() {
    let views: Vec<_> = (0..4u16).map(|i| ClusterStateView::new(9, 4, i)).collect();
    for raw in 0..256 {
        let bucket = BucketId::from_raw(raw);
        let owners = views.iter().filter(|v| v.owns_bucket(bucket)).count();
        assert_eq!(owners, 1, "bucket {} must have one owner", bucket);
    }
}

#[test]
fn document_buckets_resolve_through_the_database() {
    let mut db = BucketDatabase::new();
    let id = DocumentId::parse("music::song-1").unwrap();
    db.upsert(
        BucketSpace::Default,
        id.bucket(),
        BucketEntry::new(vec![replica(0, 1, 0x1)]),
    );

    let snapshot = db.snapshot(BucketSpace::Default, id.bucket());
    assert_eq!(snapshot.nodes(), vec![0]);
    // The same id in another space resolves to nothing.
    assert!(db.snapshot(BucketSpace::Global, id.bucket()).is_empty());
}
