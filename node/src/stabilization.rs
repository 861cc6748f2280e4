//! Periodic upkeep of a superpeer: ring pointers, the superpeer list,
//! peer promotion, backup placement and peer liveness.

use log::{debug, warn};

use ringdir_lib::messages::LookupMessage;
use ringdir_lib::{in_range, Interval, NodeId};

use crate::network_client::NetworkClient;
use crate::node::LookupNode;
use crate::ring::{Area, BACKUP_SUPERPEERS};
use crate::storage::StorageBackend;

/// Superpeers consulted per `fix_superpeers` round per this many expected.
const SUPERPEERS_PER_CHECK: usize = 300;

/// Cursor and counters carried from one stabilization round to the next.
#[derive(Debug, Default, Clone)]
pub struct StabilizerState {
    next_superpeer: usize,
    unstable_ticks: u32,
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    /// Spawns the stabilization worker, replacing a running one.
    pub fn start_stabilization(&self) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            node.run_stabilization().await;
        });
        if let Some(previous) = self.stabilizer.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run_stabilization(self) {
        let mut state = StabilizerState::default();
        loop {
            tokio::time::sleep(self.config.sleep_interval).await;
            self.stabilization_tick(&mut state).await;
        }
    }

    /// One stabilization round. Peers have nothing to do.
    pub async fn stabilization_tick(&self, state: &mut StabilizerState) {
        if !self.is_superpeer() {
            return;
        }

        self.perform_stabilization().await;
        self.fix_superpeers(state).await;
        self.promote_peer_if_necessary(state).await;

        if !self.is_only_superpeer() {
            let (area, backups) = {
                let ring = self.overlay.lock();
                (
                    ring.responsible_area(self.me),
                    ring.backup_superpeers(self.me).len(),
                )
            };
            if backups < BACKUP_SUPERPEERS {
                warn!(
                    "[{}] Only {} backup superpeers available, replication is degraded",
                    self.me, backups
                );
            }
            self.gather_backups(area).await;
            // Gathering may have dropped failed superpeers, widening the area.
            let area = self.overlay.lock().responsible_area(self.me);
            self.delete_unnecessary_backups(area);
            self.take_over_peers_and_trees(self.me);
        }

        self.ping_peers().await;
        self.process_failures().await;
        self.debug_overlay();
    }

    /// Tells predecessor and successor about this node, dropping dead ones.
    async fn perform_stabilization(&self) {
        let bound = self.superpeers().len() + 1;

        for _ in 0..bound {
            let Some(predecessor) = self.predecessor() else {
                break;
            };
            let notify = LookupMessage::NotifyAboutNewSuccessor { node: self.me };
            match self.network_client.send_message(predecessor, notify).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("[{}] Predecessor {} unreachable: {}", self.me, predecessor, e);
                    self.failure_handling(predecessor).await;
                }
            }
        }

        for _ in 0..bound {
            let Some(successor) = self.successor() else {
                break;
            };
            let notify = LookupMessage::NotifyAboutNewPredecessor { node: self.me };
            match self.network_client.send_message(successor, notify).await {
                Ok(()) => break,
                Err(e) => {
                    warn!("[{}] Successor {} unreachable: {}", self.me, successor, e);
                    self.failure_handling(successor).await;
                }
            }
        }
    }

    /// Asks known superpeers, one per round, for their successor to learn
    /// about superpeers this node has not heard of.
    async fn fix_superpeers(&self, state: &mut StabilizerState) {
        let rounds = (self.config.expected_superpeers / SUPERPEERS_PER_CHECK).max(1);

        for _ in 0..rounds {
            let (contact, expected) = {
                let ring = self.overlay.lock();
                let superpeers = ring.superpeers();
                if superpeers.len() < 2 {
                    return;
                }
                if state.next_superpeer >= superpeers.len() {
                    state.next_superpeer = 0;
                }
                let mut contact = superpeers.get(state.next_superpeer).copied();
                // The predecessor's successor is this node.
                if contact.is_some() && contact == ring.predecessor() {
                    state.next_superpeer = (state.next_superpeer + 1) % superpeers.len();
                    contact = superpeers.get(state.next_superpeer).copied();
                }
                state.next_superpeer += 1;
                let Some(contact) = contact else {
                    return;
                };
                (contact, ring.next_after(contact))
            };

            match self
                .network_client
                .call_node(contact, LookupMessage::AskAboutSuccessor)
                .await
            {
                Ok(LookupMessage::SuccessorIs {
                    successor: Some(successor),
                }) => {
                    if Some(successor) != expected
                        && successor != self.me
                        && self.overlay.lock().insert_superpeer(successor)
                    {
                        log_info!(self.me, "Learned about superpeer {} from {}", successor, contact);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[{}] Superpeer {} unreachable: {}", self.me, contact, e);
                    self.failure_handling(contact).await;
                }
            }
        }
    }

    /// Grows the ring by promoting a peer once it has stayed below its
    /// expected size for long enough.
    async fn promote_peer_if_necessary(&self, state: &mut StabilizerState) {
        let (known, only_superpeer, superpeers) = {
            let ring = self.overlay.lock();
            (
                ring.superpeers().len() + 1,
                ring.superpeers().is_empty(),
                ring.superpeers().to_vec(),
            )
        };
        if known >= self.config.expected_superpeers {
            state.unstable_ticks = 0;
            return;
        }
        if state.unstable_ticks < self.config.promotion_threshold() {
            state.unstable_ticks += 1;
            return;
        }
        state.unstable_ticks = 0;

        if only_superpeer {
            self.promote_one_peer(self.me.offset(u16::MAX / 2)).await;
            return;
        }

        // Whoever owns the widest gap in the ring fills it.
        let mut all = superpeers;
        all.push(self.me);
        let Some((gap, owner)) = widest_gap(&all) else {
            return;
        };
        if owner == self.me {
            let half = u16::try_from(gap / 2).unwrap_or(u16::MAX);
            log_info!(self.me, "Ring below expected size, filling gap of {}", gap);
            self.promote_one_peer(self.me.back(half)).await;
        }
    }

    /// Pulls primary trees of the superpeers in this node's area that are
    /// missing locally or differ from the local copy.
    async fn gather_backups(&self, area: Area) {
        let Some(directory) = self.directory() else {
            return;
        };
        let (mut old, mut current, bound) = {
            let ring = self.overlay.lock();
            let (old, current) = match area {
                Area::Everything => (self.me, ring.successor()),
                Area::Window { start, .. } => {
                    (start, ring.responsible_superpeer(start.offset(1)))
                }
            };
            (old, current, ring.superpeers().len() + 1)
        };

        for _ in 0..bound {
            let Some(target) = current.filter(|target| *target != self.me) else {
                break;
            };
            let known = directory
                .data
                .lock()
                .digests_where(|creator| in_range(creator, old, target, Interval::UpperClosed));

            match self
                .network_client
                .call_node(target, LookupMessage::AskAboutBackups { known })
                .await
            {
                Ok(LookupMessage::Backups { trees, mappings }) => {
                    if !trees.is_empty() {
                        debug!(
                            "[{}] Refreshed {} trees from {}",
                            self.me,
                            trees.len(),
                            target
                        );
                    }
                    directory.data.lock().insert_all(trees);
                    directory.mapping.lock().put_all(mappings);
                }
                Ok(other) => {
                    warn!("[{}] Unexpected backup answer from {}: {:?}", self.me, target, other);
                }
                Err(e) => {
                    warn!("[{}] Backup source {} unreachable: {}", self.me, target, e);
                    self.failure_handling(target).await;
                    current = self.overlay.lock().responsible_superpeer(old.offset(1));
                    continue;
                }
            }

            let ring = self.overlay.lock();
            if ring.predecessor() == Some(target) {
                break;
            }
            old = target;
            current = ring.responsible_superpeer(target.offset(1));
        }
    }

    /// Drops trees and mappings that left this node's area.
    fn delete_unnecessary_backups(&self, area: Area) {
        if area == Area::Everything {
            return;
        }
        let Some(directory) = self.directory() else {
            return;
        };
        let trees = directory.data.lock().retain(|creator| area.contains(creator));
        let mappings = directory
            .mapping
            .lock()
            .retain(|position| area.contains(position));
        if trees + mappings > 0 {
            debug!(
                "[{}] Dropped {} trees and {} mappings outside {:?}",
                self.me, trees, mappings, area
            );
        }
    }

    /// Pushes the superpeer list to every peer, which doubles as a liveness
    /// check.
    async fn ping_peers(&self) {
        let (peers, superpeers) = {
            let ring = self.overlay.lock();
            (ring.peers().to_vec(), ring.superpeers().to_vec())
        };
        for peer in peers {
            let message = LookupMessage::SendSuperpeers {
                superpeers: superpeers.clone(),
            };
            if let Err(e) = self.network_client.send_message(peer, message).await {
                warn!("[{}] Peer {} unreachable: {}", self.me, peer, e);
                self.failure_handling(peer).await;
            }
        }
    }
}

/// Widest distance between ring neighbours and the superpeer at its upper
/// end, which is responsible for it.
fn widest_gap(ids: &[NodeId]) -> Option<(u32, NodeId)> {
    let mut sorted = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    let first = *sorted.first()?;
    let last = *sorted.last()?;

    let mut widest = (u32::from(first.0) + 0x1_0000 - u32::from(last.0), first);
    for pair in sorted.windows(2) {
        if let [low, high] = pair {
            let gap = u32::from(high.0) - u32::from(low.0);
            if gap > widest.0 {
                widest = (gap, *high);
            }
        }
    }
    Some(widest)
}
