//! Turning peers into superpeers on request.

use ringdir_lib::tree::{BackupPeers, RangeStart};
use ringdir_lib::{chunk_id, NodeId};
use ringdir_integration_tests::integration::{NetworkInvariants, TestHarness};
use ringdir_node::PromotionError;

async fn two_superpeers_with_peers() -> TestHarness {
    let mut harness = TestHarness::new(2);
    harness.add_superpeer(0).await;
    harness.add_superpeer(1000).await;
    harness.stabilize(2).await;

    let candidate = harness.add_peer(500).await;
    harness.add_peer(600).await;
    candidate
        .init_range(
            RangeStart::Created(chunk_id(NodeId(500), 0)),
            NodeId(500),
            BackupPeers::new([NodeId(600)]),
        )
        .await
        .unwrap();
    harness
}

#[tokio::test]
async fn test_safe_promotion_hands_objects_to_replacement() {
    let mut harness = two_superpeers_with_peers().await;
    let superpeer = harness.node(1000);

    superpeer.promote(NodeId(500), true).await.unwrap();

    let promoted = harness.node(500);
    assert!(promoted.is_superpeer());
    assert_eq!(promoted.predecessor(), Some(NodeId(0)));
    assert_eq!(promoted.successor(), Some(NodeId(1000)));
    assert_eq!(superpeer.superpeers(), vec![NodeId(0), NodeId(500)]);
    assert_eq!(superpeer.predecessor(), Some(NodeId(500)));
    assert_eq!(superpeer.peers(), vec![NodeId(600)]);
    assert_eq!(harness.node(0).successor(), Some(NodeId(500)));
    assert_eq!(
        harness.storage().handovers(),
        vec![(NodeId(500), NodeId(600))]
    );

    // The former responsible superpeer now points at the replacement.
    let locations = superpeer
        .directory()
        .unwrap()
        .data
        .lock()
        .locations(chunk_id(NodeId(500), 1))
        .unwrap();
    assert_eq!(locations.primary, NodeId(600));
    let reader = harness.node(600);
    let resolved = reader.get(chunk_id(NodeId(500), 1)).await.unwrap().unwrap();
    assert_eq!(resolved.primary, NodeId(600));

    harness.stabilize(3).await;
    let violations = NetworkInvariants::check_all(&harness);
    assert!(violations.is_empty(), "Overlay should be settled: {:?}", violations);
}

#[tokio::test]
async fn test_promotion_needs_a_replacement() {
    let mut harness = TestHarness::new(2);
    harness.add_superpeer(0).await;
    harness.add_superpeer(1000).await;
    harness.add_peer(500).await;

    // Unsafe promotion only looks at local peers.
    let result = harness.node(1000).promote(NodeId(500), false).await;
    assert_eq!(result, Err(PromotionError::NoReplacement));

    // Safe promotion asks other superpeers, which have no peers either.
    let result = harness.node(1000).promote(NodeId(500), true).await;
    assert_eq!(result, Err(PromotionError::NoReplacement));
    assert!(!harness.node(500).is_superpeer());
}

#[tokio::test]
async fn test_safe_promotion_borrows_replacement_from_other_superpeer() {
    let mut harness = TestHarness::new(2);
    harness.add_superpeer(0).await;
    harness.add_superpeer(1000).await;
    harness.add_peer(500).await;
    harness.add_peer(2000).await;
    assert_eq!(harness.node(0).peers(), vec![NodeId(2000)]);

    harness.node(1000).promote(NodeId(500), true).await.unwrap();

    assert!(harness.node(500).is_superpeer());
    assert_eq!(
        harness.storage().handovers(),
        vec![(NodeId(500), NodeId(2000))]
    );
}

#[tokio::test]
async fn test_unreachable_candidate_is_handled_as_failed() {
    let mut harness = two_superpeers_with_peers().await;
    harness.fail_node(500).await;

    let result = harness.node(1000).promote(NodeId(500), true).await;
    assert_eq!(result, Err(PromotionError::PeerUnavailable));

    harness.drain_failures().await;
    assert_eq!(harness.node(1000).peers(), vec![NodeId(600)]);
    assert!(harness
        .storage()
        .recoveries()
        .contains(&(NodeId(600), NodeId(500), RangeStart::Created(chunk_id(NodeId(500), 0)))));
}
