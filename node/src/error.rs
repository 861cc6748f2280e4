//! Error types of the directory node.

use ringdir_lib::{ChunkId, NodeId};

/// Why a message could not be delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetError {
    /// No connection could be made, or it broke mid-request.
    #[error("node {node} is unreachable: {reason}")]
    DestinationUnreachable { node: NodeId, reason: String },

    /// The node did not answer in time.
    #[error("request to node {0} timed out")]
    Timeout(NodeId),
}

/// Errors surfaced to callers of the directory API.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// The configured bootstrap contact is not a superpeer. Fatal.
    #[error("bootstrap node {0} is not a superpeer")]
    BootstrapNotSuperpeer(NodeId),

    #[error("no superpeer is known")]
    NoSuperpeer,

    #[error("{operation} gave up after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("chunks {start:#x} and {end:#x} have different creators")]
    CreatorMismatch { start: ChunkId, end: ChunkId },

    #[error("unexpected response to {operation}: {response}")]
    UnexpectedResponse {
        operation: &'static str,
        response: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("node ID {0} is reserved")]
    ReservedNodeId(NodeId),

    #[error("expected superpeer count must be at least 1")]
    NoSuperpeersExpected,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Why a promotion attempt did not produce a new superpeer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PromotionError {
    /// Another promotion started by this superpeer is still running.
    #[error("another promotion is in progress")]
    Busy,

    /// The candidate did not answer; it has been queued as failed.
    #[error("candidate peer is unreachable")]
    PeerUnavailable,

    /// No peer is left to take over the candidate's objects.
    #[error("no replacement peer available")]
    NoReplacement,

    /// The candidate could not hand over its objects and stays a peer.
    #[error("candidate rejected the promotion")]
    Rejected,
}
