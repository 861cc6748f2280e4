use ringdir_lib::NodeId;

use crate::integration::TestHarness;

/// Properties a settled overlay satisfies, checked against the running
/// nodes of a harness.
pub struct NetworkInvariants;

#[derive(Debug)]
pub struct InvariantViolation {
    pub name: &'static str,
    pub description: String,
    pub affected_nodes: Vec<NodeId>,
}

/// First running superpeer at or after `id`, wrapping.
fn responsible(superpeers: &[NodeId], id: NodeId) -> Option<NodeId> {
    superpeers
        .iter()
        .copied()
        .find(|superpeer| *superpeer >= id)
        .or_else(|| superpeers.first().copied())
}

impl NetworkInvariants {
    pub fn check_all(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();

        violations.extend(Self::check_ring_pointers(harness));
        violations.extend(Self::check_superpeer_lists(harness));
        violations.extend(Self::check_peer_attachment(harness));

        violations
    }

    /// Every superpeer points at its true neighbours on the ring.
    pub fn check_ring_pointers(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let superpeers = harness.superpeer_ids();
        let count = superpeers.len();

        for (index, id) in superpeers.iter().enumerate() {
            let node = harness.node(id.0);
            let (expected_successor, expected_predecessor) = if count == 1 {
                (None, None)
            } else {
                (
                    Some(superpeers[(index + 1) % count]),
                    Some(superpeers[(index + count - 1) % count]),
                )
            };

            if node.successor() != expected_successor {
                violations.push(InvariantViolation {
                    name: "Successor",
                    description: format!(
                        "Superpeer {} has successor {:?} instead of {:?}",
                        id,
                        node.successor(),
                        expected_successor
                    ),
                    affected_nodes: vec![*id],
                });
            }
            if node.predecessor() != expected_predecessor {
                violations.push(InvariantViolation {
                    name: "Predecessor",
                    description: format!(
                        "Superpeer {} has predecessor {:?} instead of {:?}",
                        id,
                        node.predecessor(),
                        expected_predecessor
                    ),
                    affected_nodes: vec![*id],
                });
            }
        }

        violations
    }

    /// Every superpeer knows all the others and nothing else.
    pub fn check_superpeer_lists(harness: &TestHarness) -> Vec<InvariantViolation> {
        let superpeers = harness.superpeer_ids();

        superpeers
            .iter()
            .filter_map(|id| {
                let expected: Vec<NodeId> =
                    superpeers.iter().copied().filter(|other| other != id).collect();
                let known = harness.node(id.0).superpeers();
                (known != expected).then(|| InvariantViolation {
                    name: "Superpeer List",
                    description: format!(
                        "Superpeer {} knows {:?}, expected {:?}",
                        id, known, expected
                    ),
                    affected_nodes: vec![*id],
                })
            })
            .collect()
    }

    /// Every peer is attached to, and listed by, the superpeer responsible
    /// for its ID.
    pub fn check_peer_attachment(harness: &TestHarness) -> Vec<InvariantViolation> {
        let mut violations = Vec::new();
        let superpeers = harness.superpeer_ids();

        for node in harness.live_nodes() {
            if node.is_superpeer() {
                continue;
            }
            let expected = responsible(&superpeers, node.me);
            if node.my_superpeer() != expected {
                violations.push(InvariantViolation {
                    name: "Peer Attachment",
                    description: format!(
                        "Peer {} is attached to {:?} instead of {:?}",
                        node.me,
                        node.my_superpeer(),
                        expected
                    ),
                    affected_nodes: vec![node.me],
                });
                continue;
            }
            if let Some(superpeer) = expected {
                if !harness.node(superpeer.0).peers().contains(&node.me) {
                    violations.push(InvariantViolation {
                        name: "Peer Attachment",
                        description: format!(
                            "Superpeer {} does not list its peer {}",
                            superpeer, node.me
                        ),
                        affected_nodes: vec![superpeer, node.me],
                    });
                }
            }
        }

        violations
    }

    /// The primary superpeer for `creator` and the up to three superpeers
    /// following it hold identical lookup trees for it.
    pub fn check_replication(harness: &TestHarness, creator: NodeId) -> Vec<InvariantViolation> {
        let superpeers = harness.superpeer_ids();
        let Some(primary) = responsible(&superpeers, creator) else {
            return Vec::new();
        };
        let digest_on = |id: NodeId| {
            let directory = harness.node(id.0).directory()?;
            let digest = directory.data.lock().get(creator).map(|tree| tree.digest());
            digest
        };

        let Some(expected) = digest_on(primary) else {
            return vec![InvariantViolation {
                name: "Replication",
                description: format!("Primary {} has no tree for {}", primary, creator),
                affected_nodes: vec![primary],
            }];
        };

        let start = superpeers.iter().position(|id| *id == primary).unwrap_or(0);
        let backups = (1..superpeers.len().min(4))
            .map(|step| superpeers[(start + step) % superpeers.len()]);

        backups
            .filter(|backup| digest_on(*backup) != Some(expected))
            .map(|backup| InvariantViolation {
                name: "Replication",
                description: format!(
                    "Backup {} of {} holds a missing or stale tree for {}",
                    backup, primary, creator
                ),
                affected_nodes: vec![primary, backup],
            })
            .collect()
    }
}
