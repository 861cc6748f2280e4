use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Local view of the overlay, as reported by the status API.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct OverlayStats {
    /// Whether this node currently serves as a superpeer.
    pub is_superpeer: bool,

    /// Superpeers known locally, this node included when it is one.
    pub superpeer_count: usize,

    /// Configured size of the superpeer ring.
    pub expected_superpeers: usize,

    pub stable: bool,

    /// Peers attached to this superpeer.
    pub peer_count: usize,

    /// Lookup trees held, primary and backup.
    pub tree_count: usize,

    /// Application-ID mappings held, primary and backup.
    pub mapping_count: usize,

    #[serde(with = "humantime_serde")]
    pub stabilization_interval: Duration,
}
