//! Request handlers of a directory node.

use log::{debug, error, warn};
use rand::seq::SliceRandom;

use ringdir_lib::messages::{LookupMessage, RequestStatus};
use ringdir_lib::tree::{BackupPeers, RangeStart};
use ringdir_lib::{
    creator_of, hash_application_id, in_range, ApplicationId, ChunkId, Interval, NodeId,
};

use crate::directory::Directory;
use crate::network_client::NetworkClient;
use crate::node::{LookupNode, Role};
use crate::storage::StorageBackend;

fn status(status: RequestStatus) -> LookupMessage {
    LookupMessage::Status { status }
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    pub async fn handle_message(&self, from: NodeId, message: LookupMessage) -> LookupMessage {
        match message {
            LookupMessage::Join { node, is_superpeer } => self.handle_join(node, is_superpeer).await,
            LookupMessage::Lookup { chunk } => self.handle_lookup(chunk),
            LookupMessage::GetBackupRanges { node } => self.handle_get_backup_ranges(node),
            LookupMessage::UpdateAll {
                owner,
                restorer,
                is_backup,
            } => self.handle_update_all(owner, restorer, is_backup).await,
            LookupMessage::InitRange {
                start,
                owner,
                backups,
                is_backup,
            } => {
                self.handle_init_range(start, owner, backups, is_backup)
                    .await
            }
            LookupMessage::Migrate {
                chunk,
                node,
                is_backup,
            } => self.handle_migrate(chunk, node, is_backup).await,
            LookupMessage::MigrateRange {
                start,
                end,
                node,
                is_backup,
            } => self.handle_migrate_range(start, end, node, is_backup).await,
            LookupMessage::Remove { chunks, is_backup } => {
                self.handle_remove(chunks, is_backup).await
            }
            LookupMessage::InsertId {
                id,
                chunk,
                is_backup,
            } => self.handle_insert_id(id, chunk, is_backup).await,
            LookupMessage::GetChunkId { id } => self.handle_get_chunk_id(id),
            LookupMessage::GetMappingCount => self.handle_get_mapping_count(),
            LookupMessage::AskAboutSuccessor => {
                let successor = if self.is_superpeer() {
                    self.successor()
                } else {
                    None
                };
                LookupMessage::SuccessorIs { successor }
            }
            LookupMessage::AskAboutBackups { known } => self.handle_ask_about_backups(&known),
            LookupMessage::NotifyAboutNewPredecessor { node } => {
                self.handle_new_predecessor(node);
                LookupMessage::Ack
            }
            LookupMessage::NotifyAboutNewSuccessor { node } => {
                self.handle_new_successor(node);
                LookupMessage::Ack
            }
            LookupMessage::PingSuperpeer => LookupMessage::Ack,
            LookupMessage::SearchForPeer => {
                let peers = self.peers();
                let peer = peers.choose(&mut rand::thread_rng()).copied();
                LookupMessage::FoundPeer { peer }
            }
            LookupMessage::PromotePeer {
                snapshot,
                replacement,
            } => self.handle_promote_peer(from, snapshot, replacement).await,
            LookupMessage::DelegatePromotePeer { hops } => {
                let node = self.clone();
                tokio::spawn(async move {
                    node.delegated_promotion(hops).await;
                });
                LookupMessage::Ack
            }
            LookupMessage::NotifyAboutFailedPeer { failed } => {
                if let Some(directory) = self.directory() {
                    let mut data = directory.data.lock();
                    data.remove_backup_peer(failed);
                    data.set_status(failed, false);
                }
                LookupMessage::Ack
            }
            LookupMessage::StartRecovery { failed, range } => {
                log_info!(self.me, "Recovering {:?} of failed peer {}", range, failed);
                if !self.storage.recover(failed, range).await {
                    warn!("[{}] Recovery of {:?} failed", self.me, range);
                }
                LookupMessage::Ack
            }
            LookupMessage::SendBackups { trees, mappings } => {
                match self.directory() {
                    Some(directory) => {
                        debug!(
                            "[{}] Received {} trees and {} mappings from {}",
                            self.me,
                            trees.len(),
                            mappings.len(),
                            from
                        );
                        directory.data.lock().insert_all(trees);
                        directory.mapping.lock().put_all(mappings);
                    }
                    None => warn!("[{}] Peer received backups from {}", self.me, from),
                }
                LookupMessage::Ack
            }
            LookupMessage::SendSuperpeers { superpeers } => {
                self.handle_send_superpeers(from, superpeers);
                LookupMessage::Ack
            }
            other => {
                log_error!(self.me, "Unsupported message received: {:?}", other);
                LookupMessage::Error {
                    message: "Unsupported message type".to_string(),
                }
            }
        }
    }

    /// Applies a mutation the way its position on the ring demands.
    ///
    /// A backup copy is applied without forwarding. The primary applies it
    /// and forwards `replica` to its backup superpeers before answering.
    /// Everyone else rejects it so the sender re-resolves.
    async fn dispatch_mutation(
        &self,
        key: NodeId,
        is_backup: bool,
        replica: LookupMessage,
        apply: impl FnOnce(&Directory, bool) -> RequestStatus,
    ) -> LookupMessage {
        let Some(directory) = self.directory() else {
            return status(RequestStatus::NotSuperpeer);
        };

        if is_backup {
            // Replicas are never forwarded again. Missing backup state is
            // repaired by the next stabilization.
            apply(&directory, false);
            status(RequestStatus::Applied)
        } else if self.is_primary_for(key) {
            let outcome = apply(&directory, true);
            if outcome == RequestStatus::Applied {
                self.replicate(replica).await;
            }
            status(outcome)
        } else {
            debug!("[{}] Not responsible for {}", self.me, key);
            status(RequestStatus::NotResponsible)
        }
    }

    /// Forwards a mutation to the backup superpeers. Unreachable backups are
    /// handed to failure handling and otherwise ignored.
    async fn replicate(&self, replica: LookupMessage) {
        let backups = self.overlay.lock().backup_superpeers(self.me);
        for backup in backups {
            match self.network_client.call_node(backup, replica.clone()).await {
                Ok(LookupMessage::Status {
                    status: RequestStatus::Applied,
                }) => {}
                Ok(other) => warn!(
                    "[{}] Backup superpeer {} answered {:?}",
                    self.me, backup, other
                ),
                Err(e) => {
                    warn!("[{}] Replication to {} failed: {}", self.me, backup, e);
                    self.spawn_failure_handling(backup);
                }
            }
        }
    }

    fn handle_lookup(&self, chunk: ChunkId) -> LookupMessage {
        let Some(directory) = self.directory() else {
            return status(RequestStatus::NotSuperpeer);
        };
        let creator = creator_of(chunk);
        let found = {
            let data = directory.data.lock();
            data.get(creator).map(|tree| tree.get_metadata(chunk))
        };
        match found {
            Some(locations) => LookupMessage::LookupResult { locations },
            None if self.is_primary_for(creator) => LookupMessage::LookupResult { locations: None },
            None => status(RequestStatus::NotResponsible),
        }
    }

    fn handle_get_backup_ranges(&self, node: NodeId) -> LookupMessage {
        let Some(directory) = self.directory() else {
            return status(RequestStatus::NotSuperpeer);
        };
        let ranges = directory
            .data
            .lock()
            .get(node)
            .map(|tree| tree.all_backup_ranges());
        if ranges.is_none() && !self.is_primary_for(node) {
            return status(RequestStatus::NotResponsible);
        }
        LookupMessage::BackupRanges { ranges }
    }

    pub(crate) async fn handle_update_all(
        &self,
        owner: NodeId,
        restorer: NodeId,
        is_backup: bool,
    ) -> LookupMessage {
        let replica = LookupMessage::UpdateAll {
            owner,
            restorer,
            is_backup: true,
        };
        self.dispatch_mutation(owner, is_backup, replica, |directory, _| {
            directory.data.lock().reassign_owner(owner, restorer);
            RequestStatus::Applied
        })
        .await
    }

    async fn handle_init_range(
        &self,
        start: RangeStart,
        owner: NodeId,
        backups: BackupPeers,
        is_backup: bool,
    ) -> LookupMessage {
        let replica = LookupMessage::InitRange {
            start,
            owner,
            backups: backups.clone(),
            is_backup: true,
        };
        let creator = start.tree_creator(owner);
        self.dispatch_mutation(creator, is_backup, replica, |directory, _| {
            let mut data = directory.data.lock();
            let tree = data.get_or_create(creator);
            match start {
                RangeStart::Created(first) => tree.init_range(first, backups),
                RangeStart::Migration(range_id) => tree.init_migration_range(range_id, backups),
            }
            RequestStatus::Applied
        })
        .await
    }

    async fn handle_migrate(&self, chunk: ChunkId, node: NodeId, is_backup: bool) -> LookupMessage {
        let creator = creator_of(chunk);
        let replica = LookupMessage::Migrate {
            chunk,
            node,
            is_backup: true,
        };
        let me = self.me;
        self.dispatch_mutation(creator, is_backup, replica, |directory, primary| {
            match directory.data.lock().get_mut(creator) {
                Some(tree) => {
                    tree.migrate_object(chunk, node);
                    RequestStatus::Applied
                }
                None => missing_tree(me, creator, primary),
            }
        })
        .await
    }

    async fn handle_migrate_range(
        &self,
        start: ChunkId,
        end: ChunkId,
        node: NodeId,
        is_backup: bool,
    ) -> LookupMessage {
        let creator = creator_of(start);
        if creator != creator_of(end) {
            warn!(
                "[{}] Migration range {:#x}..{:#x} spans creators",
                self.me, start, end
            );
            return status(RequestStatus::InvalidRequest);
        }
        let replica = LookupMessage::MigrateRange {
            start,
            end,
            node,
            is_backup: true,
        };
        let me = self.me;
        self.dispatch_mutation(creator, is_backup, replica, |directory, primary| {
            match directory.data.lock().get_mut(creator) {
                Some(tree) => {
                    tree.migrate_range(start, end, node);
                    RequestStatus::Applied
                }
                None => missing_tree(me, creator, primary),
            }
        })
        .await
    }

    async fn handle_remove(&self, chunks: Vec<ChunkId>, is_backup: bool) -> LookupMessage {
        let Some(creator) = chunks.first().map(|chunk| creator_of(*chunk)) else {
            return status(RequestStatus::Applied);
        };
        if chunks.iter().any(|chunk| creator_of(*chunk) != creator) {
            warn!("[{}] Remove request spans creators", self.me);
            return status(RequestStatus::InvalidRequest);
        }
        let replica = LookupMessage::Remove {
            chunks: chunks.clone(),
            is_backup: true,
        };
        let me = self.me;
        // Application-ID mappings live on the superpeers of their hash, not
        // of the creator, and are left alone here.
        self.dispatch_mutation(creator, is_backup, replica, |directory, primary| {
            let mut data = directory.data.lock();
            let Some(tree) = data.get_mut(creator) else {
                return missing_tree(me, creator, primary);
            };
            for chunk in &chunks {
                tree.remove_object(*chunk);
            }
            RequestStatus::Applied
        })
        .await
    }

    async fn handle_insert_id(
        &self,
        id: ApplicationId,
        chunk: ChunkId,
        is_backup: bool,
    ) -> LookupMessage {
        let replica = LookupMessage::InsertId {
            id,
            chunk,
            is_backup: true,
        };
        self.dispatch_mutation(hash_application_id(id), is_backup, replica, |directory, _| {
            directory.mapping.lock().put(id, chunk);
            RequestStatus::Applied
        })
        .await
    }

    fn handle_get_chunk_id(&self, id: ApplicationId) -> LookupMessage {
        let Some(directory) = self.directory() else {
            return status(RequestStatus::NotSuperpeer);
        };
        let chunk = directory.mapping.lock().get(id);
        if chunk.is_none() && !self.is_primary_for(hash_application_id(id)) {
            return status(RequestStatus::NotResponsible);
        }
        LookupMessage::ChunkIdResult { chunk }
    }

    fn handle_get_mapping_count(&self) -> LookupMessage {
        let (Some(directory), Some(area)) = (self.directory(), self.primary_area()) else {
            return status(RequestStatus::NotSuperpeer);
        };
        let count = directory
            .mapping
            .lock()
            .count_where(|position| area.contains(position));
        LookupMessage::MappingCount {
            count: count as u64,
        }
    }

    /// Primary trees (and mappings) the asker lacks or holds a stale copy of.
    fn handle_ask_about_backups(&self, known: &[(NodeId, u64)]) -> LookupMessage {
        let (Some(directory), Some(area)) = (self.directory(), self.primary_area()) else {
            return LookupMessage::Backups {
                trees: Vec::new(),
                mappings: Vec::new(),
            };
        };
        let trees = directory
            .data
            .lock()
            .snapshot_where(|creator| area.contains(creator))
            .into_iter()
            .filter(|tree| !known.contains(&(tree.creator(), tree.digest())))
            .collect();
        let mappings = directory
            .mapping
            .lock()
            .snapshot_where(|position| area.contains(position));
        LookupMessage::Backups { trees, mappings }
    }

    pub(crate) fn handle_new_predecessor(&self, node: NodeId) {
        let role = self.role.lock();
        if !matches!(*role, Role::Superpeer(_)) || node == self.me {
            return;
        }
        let mut ring = self.overlay.lock();
        let accept = match ring.predecessor() {
            None => true,
            Some(current) => in_range(node, current, self.me, Interval::Open),
        };
        if accept && ring.predecessor() != Some(node) {
            log_info!(self.me, "New predecessor {}", node);
            ring.set_predecessor(Some(node));
            if ring.successor().is_none() {
                ring.set_successor(Some(node));
            }
        }
    }

    pub(crate) fn handle_new_successor(&self, node: NodeId) {
        let role = self.role.lock();
        if !matches!(*role, Role::Superpeer(_)) || node == self.me {
            return;
        }
        let mut ring = self.overlay.lock();
        let accept = match ring.successor() {
            None => true,
            Some(current) => in_range(node, self.me, current, Interval::Open),
        };
        if accept && ring.successor() != Some(node) {
            log_info!(self.me, "New successor {}", node);
            ring.set_successor(Some(node));
            if ring.predecessor().is_none() {
                ring.set_predecessor(Some(node));
            }
        }
    }

    /// A peer learns the superpeer list from the superpeer pinging it.
    fn handle_send_superpeers(&self, from: NodeId, superpeers: Vec<NodeId>) {
        let mut role = self.role.lock();
        let Role::Peer { superpeer } = &mut *role else {
            self.overlay.lock().insert_superpeer(from);
            return;
        };
        let mut ring = self.overlay.lock();
        ring.replace_superpeers(superpeers);
        ring.insert_superpeer(from);
        if ring.responsible_superpeer(self.me) == Some(from) && *superpeer != Some(from) {
            debug!("[{}] Attached to superpeer {}", self.me, from);
            *superpeer = Some(from);
        }
    }
}

fn missing_tree(me: NodeId, creator: NodeId, primary: bool) -> RequestStatus {
    if primary {
        error!("[{}] No lookup tree for creator {}", me, creator);
    } else {
        warn!("[{}] Backup has no lookup tree for creator {}", me, creator);
    }
    RequestStatus::Uninitialized
}
