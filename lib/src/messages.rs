use serde::{Deserialize, Serialize};

use crate::tree::{BackupPeers, BackupRange, Locations, LookupTree, RangeStart};
use crate::{ApplicationId, ChunkId, NodeId};

/// Ring position and metadata handed to a node taking over part of the ring.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OverlaySnapshot {
    pub predecessor: Option<NodeId>,
    pub successor: Option<NodeId>,
    pub superpeers: Vec<NodeId>,
    pub peers: Vec<NodeId>,
    pub trees: Vec<LookupTree>,
    pub mappings: Vec<(ApplicationId, ChunkId)>,
}

/// Outcome of a request that carries no other payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Applied,
    /// The receiver does not own the target ID; re-resolve and retry.
    NotResponsible,
    /// The receiver owns the target ID but has no tree for it.
    Uninitialized,
    InvalidRequest,
    /// Only superpeers answer this request.
    NotSuperpeer,
}

/// What actually travels between nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: LookupMessage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LookupMessage {
    // Ask to enter the overlay as superpeer or peer
    Join {
        node: NodeId,
        is_superpeer: bool,
    },
    // The receiver is not responsible, try this superpeer
    JoinRedirect {
        contact: NodeId,
    },
    // Ring position, peers and metadata for a joining superpeer
    JoinAccepted {
        snapshot: OverlaySnapshot,
    },
    // Superpeer list for a joining peer
    JoinAcceptedPeer {
        superpeers: Vec<NodeId>,
    },
    // Locations of one chunk
    Lookup {
        chunk: ChunkId,
    },
    LookupResult {
        locations: Option<Locations>,
    },
    // All backup ranges of a creator
    GetBackupRanges {
        node: NodeId,
    },
    BackupRanges {
        ranges: Option<Vec<BackupRange>>,
    },
    // `restorer` now holds everything `owner` held
    UpdateAll {
        owner: NodeId,
        restorer: NodeId,
        is_backup: bool,
    },
    // Register a new backup range
    InitRange {
        start: RangeStart,
        owner: NodeId,
        backups: BackupPeers,
        is_backup: bool,
    },
    // Move one chunk to another peer
    Migrate {
        chunk: ChunkId,
        node: NodeId,
        is_backup: bool,
    },
    // Move a contiguous span of chunks to another peer
    MigrateRange {
        start: ChunkId,
        end: ChunkId,
        node: NodeId,
        is_backup: bool,
    },
    // Forget chunks of one creator
    Remove {
        chunks: Vec<ChunkId>,
        is_backup: bool,
    },
    // Map an application ID to a chunk
    InsertId {
        id: ApplicationId,
        chunk: ChunkId,
        is_backup: bool,
    },
    // Mutation outcome, or why a read could not be answered
    Status {
        status: RequestStatus,
    },
    GetChunkId {
        id: ApplicationId,
    },
    ChunkIdResult {
        chunk: Option<ChunkId>,
    },
    // Number of mappings this superpeer is primary for
    GetMappingCount,
    MappingCount {
        count: u64,
    },
    AskAboutSuccessor,
    SuccessorIs {
        successor: Option<NodeId>,
    },
    // Request primary trees that are missing or differ from the given digests
    AskAboutBackups {
        known: Vec<(NodeId, u64)>,
    },
    Backups {
        trees: Vec<LookupTree>,
        mappings: Vec<(ApplicationId, ChunkId)>,
    },
    // The sender may be the receiver's new predecessor
    NotifyAboutNewPredecessor {
        node: NodeId,
    },
    // The sender may be the receiver's new successor
    NotifyAboutNewSuccessor {
        node: NodeId,
    },
    PingSuperpeer,
    // Ask for a spare peer to use as promotion replacement
    SearchForPeer,
    FoundPeer {
        peer: Option<NodeId>,
    },
    // Turn the receiving peer into a superpeer
    PromotePeer {
        snapshot: OverlaySnapshot,
        replacement: NodeId,
    },
    PromotionResult {
        success: bool,
    },
    // Promote one of your peers on my behalf
    DelegatePromotePeer {
        hops: u16,
    },
    NotifyAboutFailedPeer {
        failed: NodeId,
    },
    // Rebuild the primary copies of a failed peer's range
    StartRecovery {
        failed: NodeId,
        range: RangeStart,
    },
    // Backup copies pushed by another superpeer
    SendBackups {
        trees: Vec<LookupTree>,
        mappings: Vec<(ApplicationId, ChunkId)>,
    },
    // Current superpeer list, pushed to peers
    SendSuperpeers {
        superpeers: Vec<NodeId>,
    },
    Ack,
    Error {
        message: String,
    },
}
