//! Losing superpeers: re-resolution, ring repair and taking over ranges.

use ringdir_lib::tree::{BackupPeers, RangeStart};
use ringdir_lib::{chunk_id, NodeId};
use ringdir_integration_tests::integration::{NetworkInvariants, TestHarness};

async fn four_superpeers() -> TestHarness {
    let mut harness = TestHarness::new(4);
    for id in [0, 100, 200, 300] {
        harness.add_superpeer(id).await;
    }
    harness.stabilize(4).await;
    harness
}

#[tokio::test]
async fn test_creator_resolves_to_successor_of_failed_superpeer() {
    let mut harness = four_superpeers().await;
    let peer = harness.add_peer(50).await;
    assert_eq!(peer.responsible_superpeer(NodeId(150), false).await, Some(NodeId(200)));

    harness.fail_node(200).await;
    harness.stabilize(1).await;

    assert_eq!(peer.responsible_superpeer(NodeId(150), true).await, Some(NodeId(300)));
    assert_eq!(harness.node(300).predecessor(), Some(NodeId(100)));
    assert_eq!(harness.node(100).successor(), Some(NodeId(300)));

    harness.stabilize(2).await;
    let violations = NetworkInvariants::check_ring_pointers(&harness);
    assert!(violations.is_empty(), "Ring should close over the gap: {:?}", violations);
    assert!(harness
        .storage()
        .failures()
        .contains(&(NodeId(300), NodeId(200), true)));
}

#[tokio::test]
async fn test_requests_survive_failed_primary() {
    let mut harness = four_superpeers().await;
    let creator = harness.add_peer(150).await;
    creator
        .init_range(
            RangeStart::Created(chunk_id(NodeId(150), 0)),
            NodeId(150),
            BackupPeers::new([NodeId(50)]),
        )
        .await
        .unwrap();
    let reader = harness.add_peer(50).await;

    // Nobody has noticed the failure yet when the read is issued.
    harness.fail_node(200).await;
    let locations = reader.get(chunk_id(NodeId(150), 7)).await.unwrap().unwrap();

    assert_eq!(locations.primary, NodeId(150));
    assert_eq!(locations.backups, BackupPeers::new([NodeId(50)]));
    assert!(!reader.superpeers().contains(&NodeId(200)));
}

#[tokio::test]
async fn test_failed_superpeer_is_replaced_by_its_peer() {
    let mut harness = TestHarness::new(3);
    for id in [0, 1000, 2000] {
        harness.add_superpeer(id).await;
    }
    harness.stabilize(3).await;
    let orphan = harness.add_peer(900).await;
    orphan
        .init_range(
            RangeStart::Created(chunk_id(NodeId(900), 0)),
            NodeId(900),
            BackupPeers::new([NodeId(1500)]),
        )
        .await
        .unwrap();
    let spare = harness.add_peer(1500).await;
    assert_eq!(orphan.my_superpeer(), Some(NodeId(1000)));
    assert_eq!(spare.my_superpeer(), Some(NodeId(2000)));

    harness.fail_node(1000).await;
    harness.stabilize(1).await;

    // 2000 adopts the orphaned peer and promotes it into the gap, handing
    // its objects to the only other peer.
    assert!(orphan.is_superpeer());
    assert_eq!(harness.node(2000).predecessor(), Some(NodeId(900)));
    assert_eq!(harness.node(0).successor(), Some(NodeId(900)));
    assert_eq!(
        harness.storage().handovers(),
        vec![(NodeId(900), NodeId(1500))]
    );
    let locations = harness
        .node(2000)
        .directory()
        .unwrap()
        .data
        .lock()
        .locations(chunk_id(NodeId(900), 1))
        .unwrap();
    assert_eq!(locations.primary, NodeId(1500));

    harness.stabilize(2).await;
    let violations = NetworkInvariants::check_all(&harness);
    assert!(violations.is_empty(), "Overlay should be settled: {:?}", violations);
}
