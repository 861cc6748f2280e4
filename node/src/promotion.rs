//! Turning peers into superpeers.
//!
//! A superpeer promotes one of its own peers into part of its range. The
//! candidate first hands its stored objects to a replacement peer; if that
//! fails it stays a peer and the superpeer keeps its state untouched.

use log::{debug, warn};
use rand::seq::SliceRandom;
use std::sync::Arc;

use ringdir_lib::messages::{LookupMessage, OverlaySnapshot};
use ringdir_lib::{Interval, NodeId};

use crate::directory::{Directory, MappingTable, TreeTable};
use crate::error::PromotionError;
use crate::network_client::NetworkClient;
use crate::node::{LookupNode, Role};
use crate::storage::StorageBackend;

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    /// Promotes `candidate`, one of this superpeer's peers.
    ///
    /// In safe mode a replacement may also be found through other
    /// superpeers; otherwise only local peers qualify.
    pub async fn promote(&self, candidate: NodeId, safe: bool) -> Result<(), PromotionError> {
        let Some(directory) = self.directory() else {
            return Err(PromotionError::Rejected);
        };
        let Ok(_gate) = self.promote_gate.try_lock() else {
            return Err(PromotionError::Busy);
        };

        let replacement = self
            .find_replacement(candidate, safe)
            .await
            .ok_or(PromotionError::NoReplacement)?;

        let (snapshot, moved_peers, only_superpeer) = {
            let ring = self.overlay.lock();
            let only_superpeer = ring.superpeers().is_empty();
            let predecessor = if only_superpeer {
                self.me
            } else {
                ring.predecessor().unwrap_or(self.me)
            };
            let moved_peers = ring.peers_in(predecessor, candidate, Interval::Open);
            let area = ring.responsible_area(candidate);
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
            (snapshot, moved_peers, only_superpeer)
        };

        log_info!(
            self.me,
            "Promoting {} with replacement {} ({} peers move along)",
            candidate,
            replacement,
            moved_peers.len()
        );
        let request = LookupMessage::PromotePeer {
            snapshot,
            replacement,
        };
        match self.network_client.call_node(candidate, request).await {
            Ok(LookupMessage::PromotionResult { success: true }) => {}
            Ok(LookupMessage::PromotionResult { success: false }) => {
                warn!("[{}] Peer {} could not be promoted", self.me, candidate);
                return Err(PromotionError::Rejected);
            }
            Ok(other) => {
                warn!(
                    "[{}] Unexpected promotion answer from {}: {:?}",
                    self.me, candidate, other
                );
                return Err(PromotionError::Rejected);
            }
            Err(e) => {
                warn!("[{}] Promotion candidate {} unreachable: {}", self.me, candidate, e);
                self.failures.enqueue(candidate);
                return Err(PromotionError::PeerUnavailable);
            }
        }

        let old_predecessor = {
            let mut ring = self.overlay.lock();
            for peer in &moved_peers {
                ring.remove_peer(*peer);
            }
            ring.remove_peer(candidate);
            if only_superpeer {
                ring.set_successor(Some(candidate));
                ring.set_predecessor(Some(candidate));
                None
            } else {
                let old = ring.predecessor();
                ring.set_predecessor(Some(candidate));
                old
            }
        };
        if let Some(old) = old_predecessor {
            let notify = LookupMessage::NotifyAboutNewSuccessor { node: candidate };
            if let Err(e) = self.network_client.send_message(old, notify).await {
                warn!("[{}] Could not notify {}: {}", self.me, old, e);
                self.failures.enqueue(old);
            }
        }

        log_info!(self.me, "Peer {} is now a superpeer", candidate);
        Ok(())
    }

    async fn find_replacement(&self, candidate: NodeId, safe: bool) -> Option<NodeId> {
        let local: Vec<NodeId> = self
            .peers()
            .into_iter()
            .filter(|peer| *peer != candidate)
            .collect();
        let picked = local.choose(&mut rand::thread_rng()).copied();
        if picked.is_some() || !safe {
            return picked;
        }

        let superpeers = self.superpeers();
        for _ in 0..2 * superpeers.len() {
            let contact = superpeers.choose(&mut rand::thread_rng()).copied();
            let Some(contact) = contact else {
                break;
            };
            match self
                .network_client
                .call_node(contact, LookupMessage::SearchForPeer)
                .await
            {
                Ok(LookupMessage::FoundPeer { peer: Some(peer) }) if peer != candidate => {
                    return Some(peer);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("[{}] Peer search at {} failed: {}", self.me, contact, e);
                    self.failures.enqueue(contact);
                }
            }
        }
        None
    }

    /// Promotes the peer closest below `target`, trying other peers if that
    /// one fails. Without usable peers the job is delegated to another
    /// superpeer.
    pub async fn promote_one_peer(&self, target: NodeId) {
        let attempts = 2 * (self.superpeers().len() + 1);
        let mut tried: Vec<NodeId> = Vec::new();

        for _ in 0..attempts {
            let candidate = {
                let ring = self.overlay.lock();
                let untried: Vec<NodeId> = ring
                    .peers()
                    .iter()
                    .copied()
                    .filter(|peer| !tried.contains(peer))
                    .collect();
                let below = untried.iter().copied().filter(|peer| *peer < target).last();
                below.or_else(|| untried.first().copied())
            };
            let Some(candidate) = candidate else {
                break;
            };

            match self.promote(candidate, true).await {
                Ok(()) => return,
                Err(PromotionError::Busy) => {
                    debug!("[{}] Promotion already running", self.me);
                    return;
                }
                Err(PromotionError::NoReplacement) => break,
                Err(e) => {
                    debug!("[{}] Promoting {} failed: {}", self.me, candidate, e);
                    tried.push(candidate);
                }
            }
        }

        self.delegate_promotion(1).await;
    }

    /// Asks a random other superpeer to promote one of its peers.
    pub(crate) async fn delegate_promotion(&self, hops: u16) {
        let mut superpeers = self.superpeers();
        superpeers.shuffle(&mut rand::thread_rng());
        for contact in superpeers {
            let message = LookupMessage::DelegatePromotePeer { hops };
            match self.network_client.send_message(contact, message).await {
                Ok(()) => {
                    debug!("[{}] Delegated promotion to {}", self.me, contact);
                    return;
                }
                Err(e) => {
                    debug!("[{}] Could not delegate to {}: {}", self.me, contact, e);
                    self.failures.enqueue(contact);
                }
            }
        }
        warn!("[{}] No superpeer left to delegate a promotion to", self.me);
    }

    /// Handles a promotion delegated by another superpeer.
    pub(crate) async fn delegated_promotion(&self, hops: u16) {
        let limit = 2 * self.superpeers().len().max(1);
        if usize::from(hops) >= limit {
            warn!("[{}] Dropping promotion after {} hops", self.me, hops);
            return;
        }

        let peers = self.peers();
        let candidate = if peers.len() > 1 {
            peers.choose(&mut rand::thread_rng()).copied()
        } else {
            None
        };
        if let Some(candidate) = candidate {
            match self.promote(candidate, false).await {
                Ok(()) | Err(PromotionError::Busy) => return,
                Err(e) => debug!("[{}] Delegated promotion failed: {}", self.me, e),
            }
        }
        self.delegate_promotion(hops.saturating_add(1)).await;
    }

    /// Candidate side of a promotion.
    pub(crate) async fn handle_promote_peer(
        &self,
        from: NodeId,
        snapshot: OverlaySnapshot,
        replacement: NodeId,
    ) -> LookupMessage {
        let previous = {
            let mut role = self.role.lock();
            let Role::Peer { superpeer } = &*role else {
                warn!("[{}] Promotion request from {} but already a superpeer", self.me, from);
                return LookupMessage::PromotionResult { success: false };
            };
            let previous_superpeer = *superpeer;

            let mut trees = TreeTable::default();
            trees.insert_all(snapshot.trees);
            trees.set_status(self.me, false);
            let mut mappings = MappingTable::default();
            mappings.put_all(snapshot.mappings);

            let mut ring = self.overlay.lock();
            let previous_ring = ring.clone();
            ring.replace_superpeers(snapshot.superpeers);
            ring.replace_peers(snapshot.peers);
            ring.set_successor(snapshot.successor);
            ring.set_predecessor(snapshot.predecessor);
            *role = Role::Superpeer(Arc::new(Directory::with_contents(trees, mappings)));
            (previous_superpeer, previous_ring)
        };

        if !self.storage.migrate_all_owned_objects(replacement).await {
            log_error!(
                self.me,
                "Could not hand objects over to {}, staying a peer",
                replacement
            );
            let (previous_superpeer, previous_ring) = previous;
            let mut role = self.role.lock();
            let mut ring = self.overlay.lock();
            *ring = previous_ring;
            *role = Role::Peer {
                superpeer: previous_superpeer,
            };
            return LookupMessage::PromotionResult { success: false };
        }

        // Objects this node held now live on the replacement.
        self.handle_update_all(self.me, replacement, false).await;
        log_info!(
            self.me,
            "Promoted to superpeer by {}. Predecessor: {:?}, successor: {:?}",
            from,
            self.predecessor(),
            self.successor()
        );
        self.start_stabilization();
        LookupMessage::PromotionResult { success: true }
    }
}
