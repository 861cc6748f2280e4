//! Failure handling.
//!
//! Failures are queued and handled one at a time by whichever task holds the
//! gate. Failures discovered while handling another one are only queued, so
//! handling never recurses.

use log::{debug, warn};
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use ringdir_lib::messages::LookupMessage;
use ringdir_lib::{in_range, Interval, NodeId};

use crate::locks::{LockLevel, OrderedMutex};
use crate::network_client::NetworkClient;
use crate::node::{LookupNode, Role};
use crate::ring::{Area, BACKUP_SUPERPEERS};
use crate::storage::StorageBackend;

pub(crate) struct FailureQueue {
    pending: OrderedMutex<VecDeque<NodeId>>,
    gate: tokio::sync::Mutex<()>,
}

impl FailureQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: OrderedMutex::new(LockLevel::Failure, VecDeque::new()),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn enqueue(&self, node: NodeId) {
        let mut pending = self.pending.lock();
        if !pending.contains(&node) {
            pending.push_back(node);
        }
    }

    fn pop(&self) -> Option<NodeId> {
        self.pending.lock().pop_front()
    }

    fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    /// Handles the loss of `failed`, plus every failure found on the way.
    ///
    /// Returns immediately if another task is already handling failures; that
    /// task picks the queued node up.
    pub async fn failure_handling(&self, failed: NodeId) {
        self.failures.enqueue(failed);
        self.process_failures().await;
    }

    /// Handles whatever is queued unless another task already does.
    pub async fn process_failures(&self) {
        loop {
            let Ok(gate) = self.failures.gate.try_lock() else {
                debug!("[{}] Failure handling busy, leaving queue to it", self.me);
                return;
            };
            while let Some(node) = self.failures.pop() {
                self.handle_single_failure(node).await;
            }
            drop(gate);

            // A failure may have been queued between the last pop and the
            // release of the gate.
            if self.failures.is_empty() {
                return;
            }
        }
    }

    /// Waits for the gate and handles everything queued.
    pub async fn drain_failures(&self) {
        let _gate = self.failures.gate.lock().await;
        while let Some(node) = self.failures.pop() {
            self.handle_single_failure(node).await;
        }
    }

    /// Reaction to a broken connection.
    pub async fn on_connection_lost(&self, node: NodeId) {
        self.failure_handling(node).await;
    }

    /// Handles every node reported on `events` as a lost connection.
    pub fn watch_connections(
        &self,
        mut events: mpsc::UnboundedReceiver<NodeId>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(lost) = events.recv().await {
                if lost != node.me {
                    node.on_connection_lost(lost).await;
                }
            }
            debug!("[{}] Connection events closed", node.me);
        })
    }

    /// Queues `failed` and handles it in the background.
    pub(crate) fn spawn_failure_handling(&self, failed: NodeId) {
        self.failures.enqueue(failed);
        let node = self.clone();
        tokio::spawn(async move {
            node.failure_handling(failed).await;
        });
    }

    async fn handle_single_failure(&self, failed: NodeId) {
        if failed == self.me {
            return;
        }
        let (was_superpeer, was_peer) = {
            let ring = self.overlay.lock();
            (ring.contains_superpeer(failed), ring.contains_peer(failed))
        };

        if was_superpeer {
            if self.is_superpeer() {
                self.superpeer_failed(failed).await;
            } else {
                self.superpeer_lost(failed);
            }
        } else if was_peer {
            self.peer_failed(failed).await;
        } else {
            debug!("[{}] Node {} is already gone", self.me, failed);
        }
    }

    /// A peer drops a failed superpeer and re-attaches if it was its own.
    fn superpeer_lost(&self, failed: NodeId) {
        let mut role = self.role.lock();
        let mut ring = self.overlay.lock();
        if ring.bootstrap() == failed {
            let next = ring.next_after(failed).unwrap_or(self.me);
            ring.set_bootstrap(next);
        }
        ring.remove_superpeer(failed);

        if let Role::Peer { superpeer } = &mut *role {
            if *superpeer == Some(failed) {
                *superpeer = ring.responsible_superpeer(self.me);
                log_info!(
                    self.me,
                    "Superpeer {} failed, now attached to {:?}",
                    failed,
                    superpeer
                );
            }
        }
    }

    async fn superpeer_failed(&self, failed: NodeId) {
        log_info!(self.me, "Superpeer {} failed", failed);

        let new_bootstrap = {
            let mut ring = self.overlay.lock();
            if ring.bootstrap() == failed {
                let next = ring.next_after(failed).unwrap_or(self.me);
                ring.set_bootstrap(next);
                Some(next)
            } else {
                None
            }
        };
        if let Some(next) = new_bootstrap.filter(|next| *next != self.me) {
            log_info!(self.me, "Bootstrap {} failed, using {}", failed, next);
            if self
                .network_client
                .call_node(next, LookupMessage::PingSuperpeer)
                .await
                .is_err()
            {
                self.failures.enqueue(next);
            }
        }

        let was_predecessor = self.overlay.lock().predecessor() == Some(failed);
        if was_predecessor {
            self.take_over_peers_and_trees(failed);
        }

        let (area, backups, others) = {
            let ring = self.overlay.lock();
            (
                ring.responsible_area(self.me),
                ring.backup_superpeers(self.me),
                ring.superpeers().len(),
            )
        };
        if others > BACKUP_SUPERPEERS {
            if let Area::Window { start, .. } = area {
                let first_in_area = self.overlay.lock().responsible_superpeer(start.offset(1));
                if first_in_area == Some(failed) {
                    self.spread_data_of_failed_superpeer(failed, start).await;
                }
            }
            if let (Some(first), Some(last)) = (backups.first(), backups.last()) {
                if in_range(failed, *first, *last, Interval::Closed) {
                    self.spread_own_backups(failed, *last).await;
                }
            }
        }

        self.overlay.lock().remove_superpeer(failed);

        if was_predecessor {
            self.promote_one_peer(failed).await;
        }
        self.storage.report_node_failure(failed, true).await;
    }

    /// The failed superpeer was the first one in this node's area. Its
    /// range now needs one more backup holder down the ring.
    async fn spread_data_of_failed_superpeer(&self, failed: NodeId, start: NodeId) {
        let Some(directory) = self.directory() else {
            return;
        };
        let inside = |id| in_range(id, start, failed, Interval::UpperClosed);
        let trees = directory.data.lock().snapshot_where(inside);
        let mappings = directory.mapping.lock().snapshot_where(inside);
        if trees.is_empty() && mappings.is_empty() {
            return;
        }

        let targets = self.overlay.lock().successors_after(self.me);
        for target in targets.into_iter().filter(|target| *target != failed) {
            let message = LookupMessage::SendBackups {
                trees: trees.clone(),
                mappings: mappings.clone(),
            };
            match self.network_client.send_message(target, message).await {
                Ok(()) => {
                    debug!(
                        "[{}] Sent {} trees of ({}, {}] to {}",
                        self.me,
                        trees.len(),
                        start,
                        failed,
                        target
                    );
                    return;
                }
                Err(e) => {
                    warn!("[{}] Could not send backups to {}: {}", self.me, target, e);
                    self.failures.enqueue(target);
                }
            }
        }
    }

    /// One of this node's backup superpeers failed; the next superpeer in
    /// line becomes a backup and needs a copy of the primary range.
    async fn spread_own_backups(&self, failed: NodeId, last_backup: NodeId) {
        let Some(Area::Window { start, end }) = self.primary_area() else {
            return;
        };
        let Some(directory) = self.directory() else {
            return;
        };
        let inside = |id| in_range(id, start, end, Interval::UpperClosed);
        let trees = directory.data.lock().snapshot_where(inside);
        let mappings = directory.mapping.lock().snapshot_where(inside);

        let targets = self.overlay.lock().successors_after(last_backup);
        for target in targets
            .into_iter()
            .filter(|target| *target != failed && *target != last_backup)
        {
            let message = LookupMessage::SendBackups {
                trees: trees.clone(),
                mappings: mappings.clone(),
            };
            match self.network_client.send_message(target, message).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("[{}] Could not send backups to {}: {}", self.me, target, e);
                    self.failures.enqueue(target);
                }
            }
        }
    }

    async fn peer_failed(&self, failed: NodeId) {
        if !self.storage.node_available(failed).await {
            debug!("[{}] Peer {} left, nothing to recover", self.me, failed);
            self.overlay.lock().remove_peer(failed);
            return;
        }
        if self.creator_available(failed).await {
            debug!("[{}] Peer {} is still reachable", self.me, failed);
            return;
        }
        log_info!(self.me, "Peer {} failed, starting recovery", failed);

        let ranges = match self.directory() {
            Some(directory) => {
                let mut data = directory.data.lock();
                data.remove_backup_peer(failed);
                data.set_status(failed, false);
                let ranges = data
                    .get(failed)
                    .map(|tree| tree.all_backup_ranges())
                    .unwrap_or_default();
                ranges
            }
            None => Vec::new(),
        };

        let superpeers = self.superpeers();
        for superpeer in superpeers {
            if let Err(e) = self
                .network_client
                .send_message(superpeer, LookupMessage::NotifyAboutFailedPeer { failed })
                .await
            {
                warn!("[{}] Could not notify {}: {}", self.me, superpeer, e);
                self.failures.enqueue(superpeer);
            }
        }

        for range in ranges {
            if range.backups.is_degraded() {
                warn!(
                    "[{}] Range {:?} of {} has only {} backups",
                    self.me,
                    range.start,
                    failed,
                    range.backups.len()
                );
            }
            let mut started = false;
            for backup in range.backups.as_slice() {
                let message = LookupMessage::StartRecovery {
                    failed,
                    range: range.start,
                };
                if self.network_client.send_message(*backup, message).await.is_ok() {
                    debug!(
                        "[{}] Recovery of {:?} started on {}",
                        self.me, range.start, backup
                    );
                    started = true;
                    break;
                }
            }
            if !started {
                log_error!(
                    self.me,
                    "No backup of {:?} reachable, data of {} is lost",
                    range.start,
                    failed
                );
            }
        }

        self.overlay.lock().remove_peer(failed);
        self.storage.report_node_failure(failed, false).await;
    }

    /// Adopts the peers and trees of the creators in `(previous, node]` that
    /// are still alive. Called with a failed predecessor, and with the local
    /// ID during stabilization.
    pub(crate) fn take_over_peers_and_trees(&self, node: NodeId) {
        let Some(directory) = self.directory() else {
            return;
        };
        let start = self
            .overlay
            .lock()
            .previous_before(node)
            .unwrap_or(self.me);

        let creators = {
            let data = directory.data.lock();
            let alive: Vec<NodeId> = data
                .creators_where(|creator| in_range(creator, start, node, Interval::UpperClosed))
                .into_iter()
                .filter(|creator| data.get(*creator).is_some_and(|tree| tree.status()))
                .collect();
            alive
        };

        let mut ring = self.overlay.lock();
        for creator in creators {
            if !ring.contains_superpeer(creator) && ring.insert_peer(creator) {
                debug!("[{}] Took over peer {}", self.me, creator);
            }
        }
    }
}
