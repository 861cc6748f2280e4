use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

use crate::{chunk_id, creator_of, local_id, ChunkId, NodeId, LOCAL_ID_MASK};

/// Up to three distinct peers holding backup copies of a range.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupPeers(Vec<NodeId>);

impl BackupPeers {
    pub const MAX: usize = 3;

    /// Keeps the first three distinct, non-reserved IDs.
    pub fn new(peers: impl IntoIterator<Item = NodeId>) -> Self {
        let mut list = Vec::with_capacity(Self::MAX);
        for peer in peers {
            if list.len() == Self::MAX {
                break;
            }
            if peer.is_reserved() || list.contains(&peer) {
                continue;
            }
            list.push(peer);
        }
        Self(list)
    }

    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }

    pub fn contains(&self, peer: NodeId) -> bool {
        self.0.contains(&peer)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.0.len() < Self::MAX
    }

    pub fn remove(&mut self, peer: NodeId) -> bool {
        let before = self.0.len();
        self.0.retain(|p| *p != peer);
        before != self.0.len()
    }
}

/// First object of a backup range: either a chunk created by the tree's
/// creator or the ID of a range of migrated objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeStart {
    Created(ChunkId),
    Migration(u32),
}

impl RangeStart {
    /// Creator whose tree records the range. Migrated ranges are recorded
    /// under the peer that received them.
    pub fn tree_creator(self, owner: NodeId) -> NodeId {
        match self {
            RangeStart::Created(first) => creator_of(first),
            RangeStart::Migration(_) => owner,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRange {
    pub start: RangeStart,
    pub backups: BackupPeers,
}

/// Where one object lives. `range` is the span of chunk IDs around it that
/// resolve to the same locations, so callers can cache the answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locations {
    pub primary: NodeId,
    pub backups: BackupPeers,
    pub range: (ChunkId, ChunkId),
}

/// Location metadata for all objects created by one node.
///
/// `owners` is an interval map keyed by the first local ID of each span.
/// IDs before the first key belong to the creator and `None` marks removed
/// objects. The map is kept canonical, so two trees with the same content
/// compare equal no matter which operations produced them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupTree {
    creator: NodeId,
    status: bool,
    owners: BTreeMap<u64, Option<NodeId>>,
    backup_ranges: BTreeMap<u64, BackupPeers>,
    migration_ranges: BTreeMap<u32, BackupPeers>,
}

impl LookupTree {
    pub fn new(creator: NodeId) -> Self {
        Self {
            creator,
            status: true,
            owners: BTreeMap::new(),
            backup_ranges: BTreeMap::new(),
            migration_ranges: BTreeMap::new(),
        }
    }

    pub fn creator(&self) -> NodeId {
        self.creator
    }

    /// False once the creator is known to have failed.
    pub fn status(&self) -> bool {
        self.status
    }

    pub fn set_status(&mut self, alive: bool) {
        self.status = alive;
    }

    pub fn init_range(&mut self, first: ChunkId, backups: BackupPeers) {
        self.backup_ranges.insert(local_id(first), backups);
    }

    pub fn init_migration_range(&mut self, range_id: u32, backups: BackupPeers) {
        self.migration_ranges.insert(range_id, backups);
    }

    pub fn migrate_object(&mut self, chunk: ChunkId, primary: NodeId) {
        let local = local_id(chunk);
        self.assign(local, local, Some(primary));
    }

    pub fn migrate_range(&mut self, start: ChunkId, end: ChunkId, primary: NodeId) {
        let (first, last) = (local_id(start), local_id(end));
        let (first, last) = if first <= last { (first, last) } else { (last, first) };
        self.assign(first, last, Some(primary));
    }

    pub fn remove_object(&mut self, chunk: ChunkId) {
        let local = local_id(chunk);
        self.assign(local, local, None);
    }

    pub fn get_metadata(&self, chunk: ChunkId) -> Option<Locations> {
        let local = local_id(chunk);
        let primary = self.owner_at(local)?;

        let mut first = self
            .owners
            .range(..=local)
            .next_back()
            .map_or(0, |(start, _)| *start);
        let mut last = self
            .owners
            .range(local + 1..)
            .next()
            .map_or(LOCAL_ID_MASK, |(start, _)| start - 1);

        // Backup ranges only describe objects that never left their creator.
        let mut backups = BackupPeers::default();
        if primary == self.creator {
            if let Some((start, peers)) = self.backup_ranges.range(..=local).next_back() {
                backups = peers.clone();
                first = first.max(*start);
            }
            if let Some((next, _)) = self.backup_ranges.range(local + 1..).next() {
                last = last.min(next - 1);
            }
        }

        Some(Locations {
            primary,
            backups,
            range: (chunk_id(self.creator, first), chunk_id(self.creator, last)),
        })
    }

    pub fn all_backup_ranges(&self) -> Vec<BackupRange> {
        let created = self.backup_ranges.iter().map(|(start, backups)| BackupRange {
            start: RangeStart::Created(chunk_id(self.creator, *start)),
            backups: backups.clone(),
        });
        let migrated = self.migration_ranges.iter().map(|(id, backups)| BackupRange {
            start: RangeStart::Migration(*id),
            backups: backups.clone(),
        });
        created.chain(migrated).collect()
    }

    /// Drops `peer` from every backup list. Returns whether anything changed.
    pub fn remove_backup_peer(&mut self, peer: NodeId) -> bool {
        let mut changed = false;
        for backups in self
            .backup_ranges
            .values_mut()
            .chain(self.migration_ranges.values_mut())
        {
            changed |= backups.remove(peer);
        }
        changed
    }

    /// Hands every span held by `owner` over to `restorer`.
    pub fn set_restorer(&mut self, owner: NodeId, restorer: NodeId) {
        if owner == self.creator && !self.owners.contains_key(&0) {
            self.owners.insert(0, Some(self.creator));
        }
        for primary in self.owners.values_mut() {
            if *primary == Some(owner) {
                *primary = Some(restorer);
            }
        }
        self.normalize();
    }

    /// Content fingerprint used to spot stale replicas. Nodes compare
    /// digests with each other, so the encoding is fixed: big-endian
    /// integers, each map prefixed with its length, `INVALID` for removed
    /// spans, and the first eight bytes of the SHA-1 taken big-endian.
    pub fn digest(&self) -> u64 {
        let mut hasher = Sha1::new();
        hasher.update(self.creator.0.to_be_bytes());
        hasher.update([u8::from(self.status)]);

        hasher.update((self.owners.len() as u64).to_be_bytes());
        for (start, owner) in &self.owners {
            hasher.update(start.to_be_bytes());
            hasher.update(owner.unwrap_or(NodeId::INVALID).0.to_be_bytes());
        }
        hasher.update((self.backup_ranges.len() as u64).to_be_bytes());
        for (start, backups) in &self.backup_ranges {
            hasher.update(start.to_be_bytes());
            hash_peers(&mut hasher, backups);
        }
        hasher.update((self.migration_ranges.len() as u64).to_be_bytes());
        for (range_id, backups) in &self.migration_ranges {
            hasher.update(range_id.to_be_bytes());
            hash_peers(&mut hasher, backups);
        }

        hasher
            .finalize()
            .iter()
            .take(8)
            .fold(0, |digest, byte| (digest << 8) | u64::from(*byte))
    }

    fn owner_at(&self, local: u64) -> Option<NodeId> {
        self.owners
            .range(..=local)
            .next_back()
            .map_or(Some(self.creator), |(_, owner)| *owner)
    }

    fn assign(&mut self, first: u64, last: u64, owner: Option<NodeId>) {
        if let Some(after) = last.checked_add(1).filter(|after| *after <= LOCAL_ID_MASK) {
            if !self.owners.contains_key(&after) {
                let resumed = self.owner_at(after);
                self.owners.insert(after, resumed);
            }
        }

        let covered: Vec<u64> = self.owners.range(first..=last).map(|(k, _)| *k).collect();
        for key in covered {
            self.owners.remove(&key);
        }
        self.owners.insert(first, owner);
        self.normalize();
    }

    fn normalize(&mut self) {
        let mut previous = Some(self.creator);
        self.owners.retain(|_, owner| {
            let keep = *owner != previous;
            if keep {
                previous = *owner;
            }
            keep
        });
    }
}

fn hash_peers(hasher: &mut Sha1, peers: &BackupPeers) {
    hasher.update([peers.len() as u8]);
    for peer in peers.as_slice() {
        hasher.update(peer.0.to_be_bytes());
    }
}
