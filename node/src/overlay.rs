//! Joining the overlay, from both sides.

use log::{debug, warn};

use ringdir_lib::messages::{LookupMessage, OverlaySnapshot, RequestStatus};
use ringdir_lib::{in_range, Interval, NodeId};

use crate::error::LookupError;
use crate::network_client::NetworkClient;
use crate::node::{LookupNode, Role};
use crate::storage::StorageBackend;

enum JoinDecision {
    Redirect(NodeId),
    Peer(Vec<NodeId>),
    Superpeer {
        snapshot: OverlaySnapshot,
        old_predecessor: Option<NodeId>,
    },
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    /// Enters the overlay through the configured bootstrap superpeer.
    ///
    /// The bootstrap itself starts a new ring. Everyone else follows
    /// redirects until the responsible superpeer accepts them, falling back
    /// to the bootstrap when a contact fails.
    pub async fn join_overlay(&self) -> Result<(), LookupError> {
        let bootstrap = self.overlay.lock().bootstrap();
        let is_superpeer = self.is_superpeer();

        if bootstrap == self.me {
            if !is_superpeer {
                return Err(LookupError::BootstrapNotSuperpeer(self.me));
            }
            log_info!(self.me, "No other superpeer known. Starting a new overlay.");
            self.start_stabilization();
            return Ok(());
        }

        let policy = self.config.retry;
        let max_redirects = self.config.expected_superpeers.max(1);
        let mut attempts = 0;
        loop {
            let mut contact = bootstrap;
            let mut redirects = 0;
            loop {
                let request = LookupMessage::Join {
                    node: self.me,
                    is_superpeer,
                };
                match self.network_client.call_node(contact, request).await {
                    Ok(LookupMessage::JoinRedirect { contact: next }) => {
                        redirects += 1;
                        if redirects > max_redirects || next == contact {
                            warn!("[{}] Join redirect loop, restarting at bootstrap", self.me);
                            break;
                        }
                        debug!("[{}] Join redirected from {} to {}", self.me, contact, next);
                        contact = next;
                    }
                    Ok(LookupMessage::JoinAccepted { snapshot }) if is_superpeer => {
                        self.install_snapshot(snapshot);
                        log_info!(
                            self.me,
                            "Joined overlay as superpeer via {}. Predecessor: {:?}, successor: {:?}",
                            contact,
                            self.predecessor(),
                            self.successor()
                        );
                        self.start_stabilization();
                        return Ok(());
                    }
                    Ok(LookupMessage::JoinAcceptedPeer { superpeers }) if !is_superpeer => {
                        self.attach_to(contact, superpeers);
                        log_info!(self.me, "Joined overlay as peer of {}", contact);
                        return Ok(());
                    }
                    Ok(LookupMessage::Status {
                        status: RequestStatus::NotSuperpeer,
                    }) if contact == bootstrap => {
                        return Err(LookupError::BootstrapNotSuperpeer(bootstrap));
                    }
                    Ok(other) => {
                        log_error!(self.me, "Unexpected response to join from {}: {:?}", contact, other);
                        break;
                    }
                    Err(e) => {
                        log_error!(self.me, "Failed to join via {}: {}", contact, e);
                        break;
                    }
                }
            }

            attempts += 1;
            if !policy.allows(attempts) {
                return Err(LookupError::RetriesExhausted {
                    operation: "join",
                    attempts,
                });
            }
            tokio::time::sleep(policy.interval).await;
        }
    }

    fn install_snapshot(&self, snapshot: OverlaySnapshot) {
        {
            let mut ring = self.overlay.lock();
            ring.replace_superpeers(snapshot.superpeers);
            ring.replace_peers(snapshot.peers);
            ring.set_successor(snapshot.successor);
            ring.set_predecessor(snapshot.predecessor);
        }
        if let Some(directory) = self.directory() {
            directory.data.lock().insert_all(snapshot.trees);
            directory.mapping.lock().put_all(snapshot.mappings);
        }
    }

    fn attach_to(&self, superpeer: NodeId, superpeers: Vec<NodeId>) {
        let mut role = self.role.lock();
        let mut ring = self.overlay.lock();
        ring.replace_superpeers(superpeers);
        ring.insert_superpeer(superpeer);
        if let Role::Peer { superpeer: current } = &mut *role {
            *current = Some(superpeer);
        }
    }

    /// Admits `node` if it falls into this superpeer's range, otherwise
    /// points it at the superpeer that should.
    pub(crate) async fn handle_join(&self, node: NodeId, is_superpeer: bool) -> LookupMessage {
        let Some(directory) = self.directory() else {
            return LookupMessage::Status {
                status: RequestStatus::NotSuperpeer,
            };
        };
        if node == self.me {
            return LookupMessage::Error {
                message: "node ID already in use".to_string(),
            };
        }

        let decision = {
            let mut ring = self.overlay.lock();
            let only_superpeer = ring.superpeers().is_empty();
            let responsible = only_superpeer
                || ring
                    .predecessor()
                    .map_or(true, |predecessor| {
                        in_range(node, predecessor, self.me, Interval::UpperClosed)
                    });

            if !responsible {
                JoinDecision::Redirect(ring.responsible_superpeer(node).unwrap_or(self.me))
            } else if !is_superpeer {
                ring.insert_peer(node);
                JoinDecision::Peer(ring.superpeers().to_vec())
            } else {
                let predecessor = if only_superpeer {
                    self.me
                } else {
                    ring.previous_before(node).unwrap_or(self.me)
                };
                let moved_peers = ring.peers_in(predecessor, node, Interval::Open);
                let area = ring.responsible_area(node);
                let trees = directory
                    .data
                    .lock()
                    .snapshot_where(|creator| area.contains(creator));
                let mappings = directory
                    .mapping
                    .lock()
                    .snapshot_where(|position| area.contains(position));
                let snapshot = OverlaySnapshot {
                    predecessor: Some(predecessor),
                    successor: Some(self.me),
                    superpeers: ring.superpeers().to_vec(),
                    peers: moved_peers.clone(),
                    trees,
                    mappings,
                };

                for peer in &moved_peers {
                    ring.remove_peer(*peer);
                }
                ring.remove_peer(node);
                let old_predecessor = if only_superpeer {
                    ring.set_successor(Some(node));
                    ring.set_predecessor(Some(node));
                    None
                } else {
                    let old = ring.predecessor().filter(|old| *old != node);
                    ring.set_predecessor(Some(node));
                    old
                };
                JoinDecision::Superpeer {
                    snapshot,
                    old_predecessor,
                }
            }
        };

        match decision {
            JoinDecision::Redirect(contact) => {
                debug!("[{}] Redirecting join of {} to {}", self.me, node, contact);
                LookupMessage::JoinRedirect { contact }
            }
            JoinDecision::Peer(superpeers) => {
                log_info!(self.me, "Peer {} joined", node);
                LookupMessage::JoinAcceptedPeer { superpeers }
            }
            JoinDecision::Superpeer {
                snapshot,
                old_predecessor,
            } => {
                log_info!(
                    self.me,
                    "Superpeer {} joined with {} peers and {} trees",
                    node,
                    snapshot.peers.len(),
                    snapshot.trees.len()
                );
                if let Some(old) = old_predecessor {
                    let notify = LookupMessage::NotifyAboutNewSuccessor { node };
                    if let Err(e) = self.network_client.send_message(old, notify).await {
                        warn!("[{}] Could not notify {} about {}: {}", self.me, old, node, e);
                        self.spawn_failure_handling(old);
                    }
                }
                LookupMessage::JoinAccepted { snapshot }
            }
        }
    }
}
