//! Building a ring of superpeers and attaching peers to it.

use ringdir_lib::NodeId;
use ringdir_integration_tests::integration::{NetworkInvariants, TestHarness};

async fn five_superpeers() -> TestHarness {
    let mut harness = TestHarness::new(5);
    for id in [0, 100, 200, 300, 10000] {
        harness.add_superpeer(id).await;
    }
    harness
}

#[tokio::test]
async fn test_superpeers_form_a_ring() {
    let mut harness = five_superpeers().await;

    // Joins already leave the pointers right; lists need a few rounds.
    assert!(NetworkInvariants::check_ring_pointers(&harness).is_empty());
    harness.stabilize(4).await;

    let violations = NetworkInvariants::check_all(&harness);
    assert!(violations.is_empty(), "Overlay should be settled: {:?}", violations);

    let stats = harness.node(200).stats();
    assert!(stats.is_superpeer);
    assert!(stats.stable);
    assert_eq!(stats.superpeer_count, 5);
}

#[tokio::test]
async fn test_joins_are_redirected_to_responsible_superpeer() {
    let mut harness = five_superpeers().await;
    harness.stabilize(4).await;

    // All joins start at superpeer 0.
    harness.add_peer(50).await;
    harness.add_peer(150).await;
    harness.add_peer(20000).await;

    assert_eq!(harness.node(50).my_superpeer(), Some(NodeId(100)));
    assert_eq!(harness.node(150).my_superpeer(), Some(NodeId(200)));
    assert_eq!(harness.node(20000).my_superpeer(), Some(NodeId(0)));
    assert_eq!(harness.node(0).peers(), vec![NodeId(20000)]);

    harness.stabilize(1).await;
    let violations = NetworkInvariants::check_all(&harness);
    assert!(violations.is_empty(), "Peers should stay attached: {:?}", violations);
    assert_eq!(harness.node(150).superpeers().len(), 5);
}

#[tokio::test]
async fn test_late_superpeer_takes_over_its_range() {
    let mut harness = TestHarness::new(3);
    harness.add_superpeer(0).await;
    harness.add_superpeer(1000).await;
    harness.add_peer(400).await;
    harness.add_peer(600).await;
    harness.stabilize(2).await;
    assert_eq!(harness.node(1000).peers(), vec![NodeId(400), NodeId(600)]);

    harness.add_superpeer(500).await;

    assert_eq!(harness.node(500).peers(), vec![NodeId(400)]);
    assert_eq!(harness.node(1000).peers(), vec![NodeId(600)]);
    assert_eq!(harness.node(1000).predecessor(), Some(NodeId(500)));
    assert_eq!(harness.node(0).successor(), Some(NodeId(500)));

    harness.stabilize(3).await;
    let violations = NetworkInvariants::check_all(&harness);
    assert!(violations.is_empty(), "Overlay should be settled: {:?}", violations);
}

#[tokio::test]
async fn test_sole_superpeer_promotes_a_peer() {
    let mut harness = TestHarness::new(2).with_promotion_after(0);
    harness.add_superpeer(0).await;
    harness.add_peer(20000).await;
    harness.add_peer(40000).await;

    harness.stabilize(1).await;

    // The peer closest below the opposite side of the ring is picked.
    let promoted = harness.node(20000);
    assert!(promoted.is_superpeer());
    assert_eq!(promoted.predecessor(), Some(NodeId(0)));
    assert_eq!(promoted.successor(), Some(NodeId(0)));
    assert_eq!(harness.node(0).superpeers(), vec![NodeId(20000)]);
    assert_eq!(harness.node(0).peers(), vec![NodeId(40000)]);
    assert_eq!(
        harness.storage().handovers(),
        vec![(NodeId(20000), NodeId(40000))]
    );
}
