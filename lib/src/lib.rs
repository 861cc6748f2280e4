// Shared types of the superpeer directory
pub mod messages;
pub mod stats;
pub mod tree;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

/// 16-bit identifier of a node on the directory ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Marks a missing or unusable node on the wire.
    pub const INVALID: NodeId = NodeId(0xFFFF);
    /// Placeholder for "this node" in configuration.
    pub const LOCAL: NodeId = NodeId(0xFFFE);

    pub fn is_reserved(self) -> bool {
        self == Self::INVALID || self == Self::LOCAL
    }

    /// The identifier `delta` steps clockwise from this one.
    pub fn offset(self, delta: u16) -> NodeId {
        NodeId(self.0.wrapping_add(delta))
    }

    /// The identifier `delta` steps counter-clockwise from this one.
    pub fn back(self, delta: u16) -> NodeId {
        NodeId(self.0.wrapping_sub(delta))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object identifier: creator in the upper 16 bits, local ID in the lower 48.
pub type ChunkId = u64;

/// Application-chosen short identifier mapped to a chunk.
pub type ApplicationId = u32;

pub const LOCAL_ID_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

pub fn creator_of(chunk: ChunkId) -> NodeId {
    NodeId((chunk >> 48) as u16)
}

pub fn local_id(chunk: ChunkId) -> u64 {
    chunk & LOCAL_ID_MASK
}

pub fn chunk_id(creator: NodeId, local: u64) -> ChunkId {
    (u64::from(creator.0) << 48) | (local & LOCAL_ID_MASK)
}

/// Which endpoints of a ring interval are members.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interval {
    /// `[start, end]`
    Closed,
    /// `(start, end]`
    UpperClosed,
    /// `(start, end)`
    Open,
}

/// Checks whether `id` lies between `start` and `end` on the 2^16 ring.
///
/// If `start < end` the interval is the direct span, otherwise it wraps past
/// the maximum ID back to 0. With `start == end` a closed interval is the
/// single point, an open one is empty and an upper-closed one covers the
/// whole ring.
pub fn in_range(id: NodeId, start: NodeId, end: NodeId, kind: Interval) -> bool {
    if start == end {
        return match kind {
            Interval::Closed => id == start,
            Interval::UpperClosed => true,
            Interval::Open => false,
        };
    }

    let span = end.0.wrapping_sub(start.0);
    let offset = id.0.wrapping_sub(start.0);
    match kind {
        Interval::Closed => offset <= span,
        Interval::UpperClosed => offset != 0 && offset <= span,
        Interval::Open => offset != 0 && offset < span,
    }
}

/// Synthetic ring position of an application ID, used to pick the
/// superpeer that stores its mapping.
pub fn hash_application_id(id: ApplicationId) -> NodeId {
    let digest = Sha1::digest(id.to_be_bytes());
    NodeId(u16::from_be_bytes([digest[0], digest[1]]))
}
