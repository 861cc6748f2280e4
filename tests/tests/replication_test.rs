//! Keeping three backups of every lookup tree while nodes fail.

use ringdir_lib::tree::{BackupPeers, RangeStart};
use ringdir_lib::{chunk_id, NodeId};
use ringdir_integration_tests::integration::{NetworkInvariants, TestHarness};

#[tokio::test]
async fn test_remove_succeeds_with_unreachable_backup() {
    let mut harness = TestHarness::new(5);
    for id in [0, 100, 200, 300, 400] {
        harness.add_superpeer(id).await;
    }
    harness.stabilize(4).await;
    let creator = harness.add_peer(150).await;
    creator
        .init_range(
            RangeStart::Created(chunk_id(NodeId(150), 0)),
            NodeId(150),
            BackupPeers::new([NodeId(160)]),
        )
        .await
        .unwrap();
    assert!(NetworkInvariants::check_replication(&harness, NodeId(150)).is_empty());

    // 300 is the first backup of 200, the primary for creator 150.
    harness.fail_node(300).await;
    creator.remove(&[chunk_id(NodeId(150), 3)]).await.unwrap();

    assert_eq!(creator.get(chunk_id(NodeId(150), 3)).await.unwrap(), None);
    harness.drain_failures().await;
    let violations = NetworkInvariants::check_replication(&harness, NodeId(150));
    assert!(violations.is_empty(), "Backups should be restored: {:?}", violations);
    assert!(harness
        .node(100)
        .directory()
        .unwrap()
        .data
        .lock()
        .get(NodeId(150))
        .is_some());

    harness.stabilize(3).await;
    let violations = NetworkInvariants::check_replication(&harness, NodeId(150));
    assert!(violations.is_empty(), "Backups should stay in place: {:?}", violations);
    assert!(NetworkInvariants::check_ring_pointers(&harness).is_empty());
}

#[tokio::test]
async fn test_stale_backup_is_refreshed() {
    let mut harness = TestHarness::new(4);
    for id in [0, 100, 200, 300] {
        harness.add_superpeer(id).await;
    }
    harness.stabilize(4).await;
    let creator = harness.add_peer(150).await;
    creator
        .init_range(
            RangeStart::Created(chunk_id(NodeId(150), 0)),
            NodeId(150),
            BackupPeers::new([NodeId(160)]),
        )
        .await
        .unwrap();

    // A backup that missed an update.
    harness
        .node(0)
        .directory()
        .unwrap()
        .data
        .lock()
        .get_mut(NodeId(150))
        .unwrap()
        .migrate_object(chunk_id(NodeId(150), 1), NodeId(999));
    assert!(!NetworkInvariants::check_replication(&harness, NodeId(150)).is_empty());

    harness.stabilize(1).await;

    let violations = NetworkInvariants::check_replication(&harness, NodeId(150));
    assert!(violations.is_empty(), "Stale tree should be replaced: {:?}", violations);
}

#[tokio::test]
async fn test_failed_peer_is_recovered_from_its_backups() {
    let mut harness = TestHarness::new(2);
    harness.add_superpeer(0).await;
    harness.add_superpeer(1000).await;
    let failing = harness.add_peer(500).await;
    harness.add_peer(600).await;
    harness.add_peer(700).await;
    failing
        .init_range(
            RangeStart::Created(chunk_id(NodeId(500), 0)),
            NodeId(500),
            BackupPeers::new([NodeId(600), NodeId(700)]),
        )
        .await
        .unwrap();

    harness.fail_node(500).await;
    harness.stabilize(1).await;

    let range = RangeStart::Created(chunk_id(NodeId(500), 0));
    assert_eq!(
        harness.storage().recoveries(),
        vec![(NodeId(600), NodeId(500), range)]
    );
    assert!(harness
        .storage()
        .failures()
        .contains(&(NodeId(1000), NodeId(500), false)));
    assert_eq!(harness.node(1000).peers(), vec![NodeId(600), NodeId(700)]);
    for superpeer in [0, 1000] {
        let directory = harness.node(superpeer).directory().unwrap();
        let tree = directory.data.lock().get(NodeId(500)).cloned().unwrap();
        assert!(!tree.status(), "superpeer {} should mark 500 as failed", superpeer);
    }
}

#[tokio::test]
async fn test_departed_peer_is_not_recovered() {
    let mut harness = TestHarness::new(1);
    harness.add_superpeer(1000).await;
    harness.add_peer(500).await;
    harness.add_peer(600).await;

    harness.storage().remove_data_node(NodeId(500));
    harness.fail_node(500).await;
    harness.stabilize(1).await;

    assert_eq!(harness.node(1000).peers(), vec![NodeId(600)]);
    assert!(harness.storage().recoveries().is_empty());
    assert!(harness.storage().failures().is_empty());
}
