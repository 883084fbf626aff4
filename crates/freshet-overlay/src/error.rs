//! Error types for freshet-overlay.

use freshet_proto::{PeerId, StreamPartitionId};
use thiserror::Error;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Errors that can occur during overlay operations.
///
/// Expected negotiation outcomes (a refused handshake, a duplicate message)
/// are not errors; they are values. These variants cover transport failures
/// and lifecycle misuse.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Transport-level failure while calling a remote peer.
    #[error("rpc to {peer} failed: {reason}")]
    Rpc { peer: PeerId, reason: String },

    /// The node has not been started, or has already been stopped.
    #[error("overlay node for {partition} is not running")]
    NotRunning { partition: StreamPartitionId },

    /// A stopped node cannot be restarted; construct a new instance.
    #[error("overlay node for {partition} has been stopped")]
    Stopped { partition: StreamPartitionId },

    /// A message addressed to a different stream partition.
    #[error("partition mismatch: expected {expected}, got {actual}")]
    PartitionMismatch {
        expected: StreamPartitionId,
        actual: StreamPartitionId,
    },
}

impl OverlayError {
    /// Wrap a transport error for the given peer.
    pub fn rpc(peer: PeerId, reason: impl Into<String>) -> Self {
        Self::Rpc {
            peer,
            reason: reason.into(),
        }
    }
}
