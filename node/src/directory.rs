//! Metadata a superpeer holds: lookup trees per creator and the
//! application-ID mapping table.

use std::collections::{BTreeMap, HashMap};

use ringdir_lib::tree::{Locations, LookupTree};
use ringdir_lib::{creator_of, hash_application_id, ApplicationId, ChunkId, NodeId};

use crate::locks::{LockLevel, OrderedMutex};

/// State that only exists while a node is a superpeer.
pub struct Directory {
    pub data: OrderedMutex<TreeTable>,
    pub mapping: OrderedMutex<MappingTable>,
}

impl Directory {
    pub fn new() -> Self {
        Self::with_contents(TreeTable::default(), MappingTable::default())
    }

    pub fn with_contents(trees: TreeTable, mappings: MappingTable) -> Self {
        Self {
            data: OrderedMutex::new(LockLevel::Data, trees),
            mapping: OrderedMutex::new(LockLevel::Mapping, mappings),
        }
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup trees keyed and ordered by creator.
#[derive(Debug, Default, Clone)]
pub struct TreeTable {
    trees: BTreeMap<NodeId, LookupTree>,
}

impl TreeTable {
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn get(&self, creator: NodeId) -> Option<&LookupTree> {
        self.trees.get(&creator)
    }

    pub fn get_mut(&mut self, creator: NodeId) -> Option<&mut LookupTree> {
        self.trees.get_mut(&creator)
    }

    /// Trees are created lazily on the first range registered for a creator.
    pub fn get_or_create(&mut self, creator: NodeId) -> &mut LookupTree {
        self.trees
            .entry(creator)
            .or_insert_with(|| LookupTree::new(creator))
    }

    pub fn insert(&mut self, tree: LookupTree) {
        self.trees.insert(tree.creator(), tree);
    }

    pub fn insert_all(&mut self, trees: impl IntoIterator<Item = LookupTree>) {
        for tree in trees {
            self.insert(tree);
        }
    }

    pub fn locations(&self, chunk: ChunkId) -> Option<Locations> {
        self.trees.get(&creator_of(chunk))?.get_metadata(chunk)
    }

    pub fn creators_where(&self, keep: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        self.trees.keys().copied().filter(|c| keep(*c)).collect()
    }

    pub fn snapshot_where(&self, keep: impl Fn(NodeId) -> bool) -> Vec<LookupTree> {
        self.trees
            .iter()
            .filter(|(creator, _)| keep(**creator))
            .map(|(_, tree)| tree.clone())
            .collect()
    }

    pub fn digests_where(&self, keep: impl Fn(NodeId) -> bool) -> Vec<(NodeId, u64)> {
        self.trees
            .iter()
            .filter(|(creator, _)| keep(**creator))
            .map(|(creator, tree)| (*creator, tree.digest()))
            .collect()
    }

    /// Drops every tree whose creator does not satisfy `keep`.
    pub fn retain(&mut self, keep: impl Fn(NodeId) -> bool) -> usize {
        let before = self.trees.len();
        self.trees.retain(|creator, _| keep(*creator));
        before - self.trees.len()
    }

    pub fn remove_backup_peer(&mut self, peer: NodeId) {
        for tree in self.trees.values_mut() {
            tree.remove_backup_peer(peer);
        }
    }

    pub fn set_status(&mut self, creator: NodeId, alive: bool) {
        if let Some(tree) = self.trees.get_mut(&creator) {
            tree.set_status(alive);
        }
    }

    /// Moves every span held by `owner` to `restorer`, in all trees.
    pub fn reassign_owner(&mut self, owner: NodeId, restorer: NodeId) {
        for tree in self.trees.values_mut() {
            tree.set_restorer(owner, restorer);
        }
    }
}

/// Application ID to chunk ID, partitioned by the hash of the application ID.
#[derive(Debug, Default, Clone)]
pub struct MappingTable {
    entries: HashMap<ApplicationId, ChunkId>,
}

impl MappingTable {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn put(&mut self, id: ApplicationId, chunk: ChunkId) {
        self.entries.insert(id, chunk);
    }

    pub fn put_all(&mut self, entries: impl IntoIterator<Item = (ApplicationId, ChunkId)>) {
        self.entries.extend(entries);
    }

    pub fn get(&self, id: ApplicationId) -> Option<ChunkId> {
        self.entries.get(&id).copied()
    }

    /// Entries whose hashed position satisfies `keep`.
    pub fn snapshot_where(&self, keep: impl Fn(NodeId) -> bool) -> Vec<(ApplicationId, ChunkId)> {
        self.entries
            .iter()
            .filter(|(id, _)| keep(hash_application_id(**id)))
            .map(|(id, chunk)| (*id, *chunk))
            .collect()
    }

    pub fn count_where(&self, keep: impl Fn(NodeId) -> bool) -> usize {
        self.entries
            .keys()
            .filter(|id| keep(hash_application_id(**id)))
            .count()
    }

    pub fn retain(&mut self, keep: impl Fn(NodeId) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| keep(hash_application_id(*id)));
        before - self.entries.len()
    }
}
