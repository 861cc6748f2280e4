use log::debug;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use ringdir_lib::messages::Envelope;
use ringdir_lib::stats::OverlayStats;
use ringdir_lib::NodeId;

use crate::directory::Directory;
use crate::failure::FailureQueue;
use crate::locks::{LockLevel, OrderedMutex};
use crate::network_client::NetworkClient;
use crate::ring::{Area, Ring};
use crate::storage::StorageBackend;
use crate::{Config, NodeRole};

/// What a node currently is. Only superpeers carry a [`Directory`].
pub enum Role {
    Peer { superpeer: Option<NodeId> },
    Superpeer(Arc<Directory>),
}

pub struct LookupNode<T: NetworkClient, S: StorageBackend> {
    pub me: NodeId,
    pub config: Arc<Config>,
    pub role: Arc<OrderedMutex<Role>>,
    pub overlay: Arc<OrderedMutex<Ring>>,
    pub network_client: Arc<T>,
    pub storage: Arc<S>,
    pub(crate) failures: Arc<FailureQueue>,
    pub(crate) promote_gate: Arc<tokio::sync::Mutex<()>>,
    pub(crate) stabilizer: Arc<OrderedMutex<Option<JoinHandle<()>>>>,
}

impl<T: NetworkClient, S: StorageBackend> Clone for LookupNode<T, S> {
    fn clone(&self) -> Self {
        LookupNode {
            me: self.me,
            config: self.config.clone(),
            role: self.role.clone(),
            overlay: self.overlay.clone(),
            network_client: self.network_client.clone(),
            storage: self.storage.clone(),
            failures: self.failures.clone(),
            promote_gate: self.promote_gate.clone(),
            stabilizer: self.stabilizer.clone(),
        }
    }
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    pub fn new(config: Config, network_client: Arc<T>, storage: Arc<S>) -> Self {
        let me = config.node_id;
        let role = match config.role {
            NodeRole::Superpeer => Role::Superpeer(Arc::new(Directory::new())),
            NodeRole::Peer => Role::Peer { superpeer: None },
        };
        let ring = Ring::new(me, config.bootstrap, config.expected_superpeers);

        LookupNode {
            me,
            config: Arc::new(config),
            role: Arc::new(OrderedMutex::new(LockLevel::Role, role)),
            overlay: Arc::new(OrderedMutex::new(LockLevel::Overlay, ring)),
            network_client,
            storage,
            failures: Arc::new(FailureQueue::new()),
            promote_gate: Arc::new(tokio::sync::Mutex::new(())),
            stabilizer: Arc::new(OrderedMutex::new(LockLevel::Worker, None)),
        }
    }

    pub async fn start(&self, bind_address: &str) -> std::io::Result<()> {
        log_info!(
            self.me,
            "Directory node starting (binding to {}, superpeer: {})",
            bind_address,
            self.is_superpeer()
        );
        let listener = TcpListener::bind(bind_address).await?;

        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.handle_connection(socket).await;
                    });
                }
                Err(e) => {
                    log_error!(self.me, "Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) {
        let mut buffer = Vec::new();
        if let Err(e) = socket.read_to_end(&mut buffer).await {
            log_error!(self.me, "Failed to read from socket: {}", e);
            return;
        }

        let envelope = match bincode::deserialize::<Envelope>(&buffer) {
            Ok(envelope) => envelope,
            Err(e) => {
                log_error!(self.me, "Failed to deserialize message: {}", e);
                return;
            }
        };
        debug!(
            "[{}] Received from {}: {:?}",
            self.me, envelope.from, envelope.message
        );

        let response = self.handle_message(envelope.from, envelope.message).await;
        let encoded = match bincode::serialize(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                log_error!(self.me, "Failed to serialize response: {}", e);
                return;
            }
        };
        if let Err(e) = socket.write_all(&encoded).await {
            log_error!(self.me, "Failed to write response to socket: {}", e);
        }
    }

    /// Stops the stabilization worker.
    pub fn shutdown(&self) {
        if let Some(handle) = self.stabilizer.lock().take() {
            handle.abort();
        }
    }

    pub fn directory(&self) -> Option<Arc<Directory>> {
        match &*self.role.lock() {
            Role::Superpeer(directory) => Some(directory.clone()),
            Role::Peer { .. } => None,
        }
    }

    pub fn is_superpeer(&self) -> bool {
        matches!(*self.role.lock(), Role::Superpeer(_))
    }

    /// The superpeer a peer is attached to.
    pub fn my_superpeer(&self) -> Option<NodeId> {
        match *self.role.lock() {
            Role::Peer { superpeer } => superpeer,
            Role::Superpeer(_) => None,
        }
    }

    pub fn is_only_superpeer(&self) -> bool {
        self.is_superpeer() && self.overlay.lock().superpeers().is_empty()
    }

    pub fn overlay_is_stable(&self) -> bool {
        let counting_me = self.is_superpeer();
        self.overlay.lock().is_stable(counting_me)
    }

    /// IDs this node is the primary superpeer for, `None` on a peer.
    pub fn primary_area(&self) -> Option<Area> {
        if !self.is_superpeer() {
            return None;
        }
        let area = match self.overlay.lock().predecessor() {
            Some(predecessor) => Area::Window {
                start: predecessor,
                end: self.me,
            },
            None => Area::Everything,
        };
        Some(area)
    }

    pub fn is_primary_for(&self, id: NodeId) -> bool {
        self.primary_area().is_some_and(|area| area.contains(id))
    }

    /// Copy of the local overlay view.
    pub fn ring(&self) -> Ring {
        self.overlay.lock().clone()
    }

    pub fn superpeers(&self) -> Vec<NodeId> {
        self.overlay.lock().superpeers().to_vec()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.overlay.lock().peers().to_vec()
    }

    pub fn predecessor(&self) -> Option<NodeId> {
        self.overlay.lock().predecessor()
    }

    pub fn successor(&self) -> Option<NodeId> {
        self.overlay.lock().successor()
    }

    pub fn stats(&self) -> OverlayStats {
        let directory = self.directory();
        let is_superpeer = directory.is_some();
        let (superpeer_count, stable, peer_count) = {
            let ring = self.overlay.lock();
            (
                ring.superpeers().len() + usize::from(is_superpeer),
                ring.is_stable(is_superpeer),
                ring.peers().len(),
            )
        };
        let (tree_count, mapping_count) = directory.map_or((0, 0), |directory| {
            let trees = directory.data.lock().len();
            let mappings = directory.mapping.lock().len();
            (trees, mappings)
        });

        OverlayStats {
            is_superpeer,
            superpeer_count,
            expected_superpeers: self.config.expected_superpeers,
            stable,
            peer_count,
            tree_count,
            mapping_count,
            stabilization_interval: self.config.sleep_interval,
        }
    }

    pub fn debug_overlay(&self) {
        let stats = self.stats();
        let ring = self.ring();
        debug!(
            "[{}] Overlay: superpeer={}, pred={:?}, succ={:?}, superpeers={:?}, peers={:?}, trees={}, mappings={}, stable={}",
            self.me,
            stats.is_superpeer,
            ring.predecessor(),
            ring.successor(),
            ring.superpeers(),
            ring.peers(),
            stats.tree_count,
            stats.mapping_count,
            stats.stable
        );

        if let (Some(predecessor), Some(successor)) = (ring.predecessor(), ring.successor()) {
            let consistent = ring.previous_before(self.me) == Some(predecessor)
                && ring.next_after(self.me) == Some(successor);
            debug!(
                "[{}] Ring pointers: {}",
                self.me,
                if consistent { "VALID" } else { "INVALID" }
            );
        }
    }
}
