//! Seam to the chunk storage engine.

use async_trait::async_trait;
use log::{info, warn};
use std::collections::HashSet;

use ringdir_lib::tree::RangeStart;
use ringdir_lib::NodeId;

/// Storage-side operations the directory depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Moves every object stored locally to `to`. Called on a peer that is
    /// being promoted.
    async fn migrate_all_owned_objects(&self, to: NodeId) -> bool;

    /// Tells the storage layer a node is gone.
    async fn report_node_failure(&self, node: NodeId, was_superpeer: bool);

    /// Whether `node` is a registered data-bearing node.
    async fn node_available(&self, node: NodeId) -> bool;

    /// Rebuilds the primary copies of `failed`'s range from the local backups.
    async fn recover(&self, failed: NodeId, range: RangeStart) -> bool;
}

/// Storage stand-in for a directory-only deployment. Every other entry of
/// the configured address book counts as a data node.
pub struct AddressBookStorage {
    me: NodeId,
    data_nodes: HashSet<NodeId>,
}

impl AddressBookStorage {
    pub fn new(me: NodeId, data_nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            me,
            data_nodes: data_nodes.into_iter().collect(),
        }
    }
}

#[async_trait]
impl StorageBackend for AddressBookStorage {
    async fn migrate_all_owned_objects(&self, to: NodeId) -> bool {
        info!("[{}] No local chunks to hand over to {}", self.me, to);
        true
    }

    async fn report_node_failure(&self, node: NodeId, was_superpeer: bool) {
        warn!(
            "[{}] Node {} failed (superpeer: {})",
            self.me, node, was_superpeer
        );
    }

    async fn node_available(&self, node: NodeId) -> bool {
        self.data_nodes.contains(&node)
    }

    async fn recover(&self, failed: NodeId, range: RangeStart) -> bool {
        warn!(
            "[{}] Cannot recover {:?} of {} without a chunk store",
            self.me, range, failed
        );
        false
    }
}
