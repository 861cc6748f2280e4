//! Local view of the superpeer ring.

use ringdir_lib::{in_range, Interval, NodeId};

/// Replication factor for superpeer metadata.
pub const BACKUP_SUPERPEERS: usize = 3;

/// Creator IDs a superpeer keeps lookup trees for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Area {
    /// Small rings replicate everything everywhere.
    Everything,
    /// `(start, end]`
    Window { start: NodeId, end: NodeId },
}

impl Area {
    pub fn contains(&self, id: NodeId) -> bool {
        match *self {
            Area::Everything => true,
            Area::Window { start, end } => in_range(id, start, end, Interval::UpperClosed),
        }
    }
}

/// Superpeer and peer lists plus ring pointers.
///
/// `superpeers` never contains the local node. `successor` and
/// `predecessor` are always members of `superpeers` or `None`.
#[derive(Debug, Clone)]
pub struct Ring {
    me: NodeId,
    superpeers: Vec<NodeId>,
    peers: Vec<NodeId>,
    predecessor: Option<NodeId>,
    successor: Option<NodeId>,
    bootstrap: NodeId,
    expected_superpeers: usize,
}

impl Ring {
    pub fn new(me: NodeId, bootstrap: NodeId, expected_superpeers: usize) -> Self {
        Self {
            me,
            superpeers: Vec::new(),
            peers: Vec::new(),
            predecessor: None,
            successor: None,
            bootstrap,
            expected_superpeers,
        }
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn superpeers(&self) -> &[NodeId] {
        &self.superpeers
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn predecessor(&self) -> Option<NodeId> {
        self.predecessor
    }

    pub fn successor(&self) -> Option<NodeId> {
        self.successor
    }

    pub fn bootstrap(&self) -> NodeId {
        self.bootstrap
    }

    pub fn set_bootstrap(&mut self, bootstrap: NodeId) {
        self.bootstrap = bootstrap;
    }

    /// Stable once every expected superpeer is known. `counting_me` adds the
    /// local node when it is a superpeer itself.
    pub fn is_stable(&self, counting_me: bool) -> bool {
        self.superpeers.len() + usize::from(counting_me) == self.expected_superpeers
    }

    pub fn contains_superpeer(&self, id: NodeId) -> bool {
        self.superpeers.binary_search(&id).is_ok()
    }

    pub fn contains_peer(&self, id: NodeId) -> bool {
        self.peers.binary_search(&id).is_ok()
    }

    pub fn insert_superpeer(&mut self, id: NodeId) -> bool {
        if id == self.me || id.is_reserved() {
            return false;
        }
        match self.superpeers.binary_search(&id) {
            Ok(_) => false,
            Err(index) => {
                self.superpeers.insert(index, id);
                true
            }
        }
    }

    /// Removes a superpeer and moves the ring pointers past it.
    pub fn remove_superpeer(&mut self, id: NodeId) -> bool {
        let Ok(index) = self.superpeers.binary_search(&id) else {
            return false;
        };
        self.superpeers.remove(index);

        if self.successor == Some(id) {
            self.successor = self.next_after(id);
        }
        if self.predecessor == Some(id) {
            self.predecessor = self.previous_before(id);
        }
        true
    }

    pub fn replace_superpeers(&mut self, superpeers: impl IntoIterator<Item = NodeId>) {
        self.superpeers.clear();
        for id in superpeers {
            self.insert_superpeer(id);
        }
    }

    pub fn insert_peer(&mut self, id: NodeId) -> bool {
        if id == self.me || id.is_reserved() {
            return false;
        }
        match self.peers.binary_search(&id) {
            Ok(_) => false,
            Err(index) => {
                self.peers.insert(index, id);
                true
            }
        }
    }

    pub fn remove_peer(&mut self, id: NodeId) -> bool {
        match self.peers.binary_search(&id) {
            Ok(index) => {
                self.peers.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    pub fn replace_peers(&mut self, peers: impl IntoIterator<Item = NodeId>) {
        self.peers.clear();
        for id in peers {
            self.insert_peer(id);
        }
    }

    pub fn peers_in(&self, start: NodeId, end: NodeId, kind: Interval) -> Vec<NodeId> {
        self.peers
            .iter()
            .copied()
            .filter(|peer| in_range(*peer, start, end, kind))
            .collect()
    }

    pub fn set_successor(&mut self, successor: Option<NodeId>) {
        self.successor = successor.filter(|id| *id != self.me);
        if let Some(id) = self.successor {
            self.insert_superpeer(id);
        }
    }

    pub fn set_predecessor(&mut self, predecessor: Option<NodeId>) {
        self.predecessor = predecessor.filter(|id| *id != self.me);
        if let Some(id) = self.predecessor {
            self.insert_superpeer(id);
        }
    }

    /// Smallest known superpeer `>= id`, wrapping to the smallest one.
    pub fn responsible_superpeer(&self, id: NodeId) -> Option<NodeId> {
        let index = match self.superpeers.binary_search(&id) {
            Ok(index) => index,
            Err(index) if index == self.superpeers.len() => 0,
            Err(index) => index,
        };
        self.superpeers.get(index).copied()
    }

    /// Largest known superpeer `< id`, wrapping to the largest one.
    /// `id` itself is never returned.
    pub fn previous_before(&self, id: NodeId) -> Option<NodeId> {
        let index = match self.superpeers.binary_search(&id) {
            Ok(index) | Err(index) => index,
        };
        let candidate = if index == 0 {
            self.superpeers.last()
        } else {
            self.superpeers.get(index - 1)
        };
        candidate.copied().filter(|candidate| *candidate != id)
    }

    /// Smallest known superpeer `> id`, wrapping. `id` itself is never returned.
    pub fn next_after(&self, id: NodeId) -> Option<NodeId> {
        self.successors_after(id).into_iter().next()
    }

    /// All known superpeers in ring order starting after `id`.
    pub fn successors_after(&self, id: NodeId) -> Vec<NodeId> {
        let start = match self.superpeers.binary_search(&id) {
            Ok(index) => index + 1,
            Err(index) => index,
        };
        let len = self.superpeers.len();
        (0..len)
            .filter_map(|step| self.superpeers.get((start + step) % len).copied())
            .filter(|candidate| *candidate != id)
            .collect()
    }

    /// Superpeers replicating the metadata owned at `id`.
    pub fn backup_superpeers(&self, id: NodeId) -> Vec<NodeId> {
        let mut backups = self.successors_after(id);
        backups.truncate(BACKUP_SUPERPEERS);
        backups
    }

    /// Creators a superpeer at `id` keeps trees for: its own range plus the
    /// ranges of its three predecessors.
    pub fn responsible_area(&self, id: NodeId) -> Area {
        let len = self.superpeers.len();
        if len <= BACKUP_SUPERPEERS {
            return Area::Everything;
        }
        let Some(predecessor) = self.previous_before(id) else {
            return Area::Everything;
        };
        let Ok(index) = self.superpeers.binary_search(&predecessor) else {
            return Area::Everything;
        };
        let start_index = (index + len - BACKUP_SUPERPEERS) % len;
        match self.superpeers.get(start_index) {
            Some(start) => Area::Window {
                start: *start,
                end: id,
            },
            None => Area::Everything,
        }
    }
}
