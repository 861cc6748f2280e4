//! Directory operations offered to the storage layer.
//!
//! Every request is sent to the superpeer responsible for its key. When that
//! superpeer turns out to be wrong or dead, the failure is handled, the
//! target re-resolved with verification and the request retried according
//! to the configured [`RetryPolicy`](crate::RetryPolicy).

use log::{debug, warn};
use std::collections::BTreeMap;

use ringdir_lib::messages::{LookupMessage, RequestStatus};
use ringdir_lib::tree::{BackupPeers, BackupRange, Locations, RangeStart};
use ringdir_lib::{
    creator_of, hash_application_id, in_range, ApplicationId, ChunkId, Interval, NodeId,
};

use crate::error::LookupError;
use crate::network_client::NetworkClient;
use crate::node::LookupNode;
use crate::storage::StorageBackend;

fn unexpected(operation: &'static str, response: LookupMessage) -> LookupError {
    LookupError::UnexpectedResponse {
        operation,
        response: format!("{:?}", response),
    }
}

impl<T: NetworkClient, S: StorageBackend> LookupNode<T, S> {
    /// Finds the superpeer responsible for `id`.
    ///
    /// With `verify`, the local answer is checked against its predecessor,
    /// which knows about superpeers that joined in between.
    pub async fn responsible_superpeer(&self, id: NodeId, verify: bool) -> Option<NodeId> {
        if self.is_primary_for(id) {
            return Some(self.me);
        }
        let (mut responsible, predecessor, others) = {
            let ring = self.overlay.lock();
            let responsible = ring.responsible_superpeer(id)?;
            (responsible, ring.previous_before(responsible), ring.superpeers().len())
        };
        if !verify {
            return Some(responsible);
        }
        let Some(mut predecessor) = predecessor else {
            return Some(responsible);
        };

        for _ in 0..others {
            match self
                .network_client
                .call_node(predecessor, LookupMessage::AskAboutSuccessor)
                .await
            {
                Ok(LookupMessage::SuccessorIs {
                    successor: Some(successor),
                }) => {
                    if successor == responsible {
                        break;
                    }
                    // The predecessor may not have noticed a failure this
                    // node already handled.
                    let known = self.overlay.lock().contains_superpeer(successor);
                    if !known
                        && self
                            .network_client
                            .call_node(successor, LookupMessage::PingSuperpeer)
                            .await
                            .is_err()
                    {
                        debug!(
                            "[{}] {} reported dead successor {}",
                            self.me, predecessor, successor
                        );
                        break;
                    }
                    self.overlay.lock().insert_superpeer(successor);
                    if in_range(id, predecessor, successor, Interval::UpperClosed) {
                        debug!(
                            "[{}] {} is responsible for {}, not {}",
                            self.me, successor, id, responsible
                        );
                        responsible = successor;
                        break;
                    }
                    predecessor = successor;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("[{}] Verification via {} failed: {}", self.me, predecessor, e);
                    self.failure_handling(predecessor).await;
                    break;
                }
            }
        }
        Some(responsible)
    }

    /// Sends `message` to whoever is responsible for `key` until a
    /// superpeer gives a definitive answer.
    async fn request_responsible(
        &self,
        operation: &'static str,
        key: NodeId,
        message: LookupMessage,
    ) -> Result<LookupMessage, LookupError> {
        let policy = self.config.retry;
        let mut verify = !self.overlay_is_stable();
        let mut attempts = 0;

        loop {
            if attempts > 0 {
                if !policy.allows(attempts) {
                    return Err(LookupError::RetriesExhausted {
                        operation,
                        attempts,
                    });
                }
                tokio::time::sleep(policy.interval).await;
            }
            attempts += 1;

            let Some(target) = self.responsible_superpeer(key, verify).await else {
                warn!("[{}] No superpeer known for {}", self.me, operation);
                verify = true;
                continue;
            };
            match self.network_client.call_node(target, message.clone()).await {
                Ok(LookupMessage::Status {
                    status:
                        status @ (RequestStatus::NotResponsible
                        | RequestStatus::Uninitialized
                        | RequestStatus::NotSuperpeer),
                }) => {
                    debug!(
                        "[{}] {} for {} answered {:?} by {}",
                        self.me, operation, key, status, target
                    );
                    verify = true;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("[{}] {} via {} failed: {}", self.me, operation, target, e);
                    self.failure_handling(target).await;
                    verify = true;
                }
            }
        }
    }

    async fn mutate(
        &self,
        operation: &'static str,
        key: NodeId,
        message: LookupMessage,
    ) -> Result<(), LookupError> {
        match self.request_responsible(operation, key, message).await? {
            LookupMessage::Status {
                status: RequestStatus::Applied,
            } => Ok(()),
            other => Err(unexpected(operation, other)),
        }
    }

    /// Locations of `chunk`, `None` if it is unknown or was removed.
    pub async fn get(&self, chunk: ChunkId) -> Result<Option<Locations>, LookupError> {
        match self
            .request_responsible("get", creator_of(chunk), LookupMessage::Lookup { chunk })
            .await?
        {
            LookupMessage::LookupResult { locations } => Ok(locations),
            other => Err(unexpected("get", other)),
        }
    }

    /// Every backup range registered by `node`.
    pub async fn get_all_backup_ranges(&self, node: NodeId) -> Result<Vec<BackupRange>, LookupError> {
        match self
            .request_responsible("get_all_backup_ranges", node, LookupMessage::GetBackupRanges { node })
            .await?
        {
            LookupMessage::BackupRanges { ranges } => Ok(ranges.unwrap_or_default()),
            other => Err(unexpected("get_all_backup_ranges", other)),
        }
    }

    /// Records that this node now holds everything `owner` held.
    pub async fn update_all_after_recovery(&self, owner: NodeId) -> Result<(), LookupError> {
        let message = LookupMessage::UpdateAll {
            owner,
            restorer: self.me,
            is_backup: false,
        };
        self.mutate("update_all_after_recovery", owner, message).await
    }

    /// Registers a backup range of `owner`.
    pub async fn init_range(
        &self,
        start: RangeStart,
        owner: NodeId,
        backups: BackupPeers,
    ) -> Result<(), LookupError> {
        let message = LookupMessage::InitRange {
            start,
            owner,
            backups,
            is_backup: false,
        };
        self.mutate("init_range", start.tree_creator(owner), message)
            .await
    }

    pub async fn migrate(&self, chunk: ChunkId, node: NodeId) -> Result<(), LookupError> {
        let message = LookupMessage::Migrate {
            chunk,
            node,
            is_backup: false,
        };
        self.mutate("migrate", creator_of(chunk), message).await
    }

    /// Moves `start..=end` to `node`. Both ends must share a creator.
    pub async fn migrate_range(
        &self,
        start: ChunkId,
        end: ChunkId,
        node: NodeId,
    ) -> Result<(), LookupError> {
        if creator_of(start) != creator_of(end) {
            return Err(LookupError::CreatorMismatch { start, end });
        }
        let message = LookupMessage::MigrateRange {
            start,
            end,
            node,
            is_backup: false,
        };
        self.mutate("migrate_range", creator_of(start), message).await
    }

    /// Forgets `chunks`. One request is sent per creator.
    pub async fn remove(&self, chunks: &[ChunkId]) -> Result<(), LookupError> {
        let mut by_creator: BTreeMap<NodeId, Vec<ChunkId>> = BTreeMap::new();
        for chunk in chunks {
            by_creator.entry(creator_of(*chunk)).or_default().push(*chunk);
        }
        for (creator, chunks) in by_creator {
            let message = LookupMessage::Remove {
                chunks,
                is_backup: false,
            };
            self.mutate("remove", creator, message).await?;
        }
        Ok(())
    }

    pub async fn insert_id(&self, id: ApplicationId, chunk: ChunkId) -> Result<(), LookupError> {
        let message = LookupMessage::InsertId {
            id,
            chunk,
            is_backup: false,
        };
        self.mutate("insert_id", hash_application_id(id), message).await
    }

    pub async fn get_chunk_id(&self, id: ApplicationId) -> Result<Option<ChunkId>, LookupError> {
        match self
            .request_responsible(
                "get_chunk_id",
                hash_application_id(id),
                LookupMessage::GetChunkId { id },
            )
            .await?
        {
            LookupMessage::ChunkIdResult { chunk } => Ok(chunk),
            other => Err(unexpected("get_chunk_id", other)),
        }
    }

    /// Total number of application-ID mappings in the overlay.
    pub async fn mapping_count(&self) -> Result<u64, LookupError> {
        let mut superpeers = self.superpeers();
        if self.is_superpeer() {
            superpeers.push(self.me);
        }
        if superpeers.is_empty() {
            return Err(LookupError::NoSuperpeer);
        }

        let mut total = 0;
        for superpeer in superpeers {
            match self
                .network_client
                .call_node(superpeer, LookupMessage::GetMappingCount)
                .await
            {
                Ok(LookupMessage::MappingCount { count }) => total += count,
                Ok(other) => warn!(
                    "[{}] Unexpected mapping count from {}: {:?}",
                    self.me, superpeer, other
                ),
                Err(e) => {
                    warn!("[{}] Mapping count of {} unavailable: {}", self.me, superpeer, e);
                    self.failure_handling(superpeer).await;
                }
            }
        }
        Ok(total)
    }

    /// Whether `creator` is still a live peer. A superpeer hands a reachable
    /// peer the current superpeer list on the way.
    pub async fn creator_available(&self, creator: NodeId) -> bool {
        if creator == self.me {
            return true;
        }
        let include_me = self.is_superpeer();
        let message = {
            let ring = self.overlay.lock();
            if ring.contains_superpeer(creator) {
                return false;
            }
            if include_me {
                let mut superpeers = ring.superpeers().to_vec();
                superpeers.push(self.me);
                superpeers.sort();
                LookupMessage::SendSuperpeers { superpeers }
            } else {
                LookupMessage::PingSuperpeer
            }
        };
        self.network_client.send_message(creator, message).await.is_ok()
    }

    /// Whether this superpeer is the only one still reachable. Always false
    /// on a peer.
    pub async fn is_last_superpeer(&self) -> bool {
        if !self.is_superpeer() {
            return false;
        }
        for superpeer in self.superpeers() {
            if self
                .network_client
                .call_node(superpeer, LookupMessage::PingSuperpeer)
                .await
                .is_ok()
            {
                return false;
            }
        }
        true
    }
}
