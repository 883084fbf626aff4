//! Logical wire messages of the overlay protocol.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::peer::{PeerDescriptor, PeerId};

/// Position of a message within its chain: a `(timestamp, sequence number)`
/// pair, totally ordered.
///
/// Used both to order a message chain and to detect duplicates. The derived
/// ordering compares timestamps first, then sequence numbers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MessageRef {
    /// Publisher-assigned timestamp (unix millis).
    pub timestamp: u64,
    /// Disambiguates messages sharing a timestamp.
    pub sequence_number: u32,
}

impl MessageRef {
    /// Create a new message reference.
    pub const fn new(timestamp: u64, sequence_number: u32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence_number)
    }
}

/// The sharding key for one independent overlay instance: a stream id plus
/// a partition number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamPartitionId {
    /// Identifier of the stream.
    pub stream_id: String,
    /// Partition number within the stream.
    pub partition: u32,
}

impl StreamPartitionId {
    /// Create a new partition id.
    pub fn new(stream_id: impl Into<String>, partition: u32) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Display for StreamPartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.stream_id, self.partition)
    }
}

/// A data message flooded across one partition's overlay.
///
/// Immutable once created; forwarding nodes rewrite only `sender_id` via
/// [`forwarded_by`](DataMessage::forwarded_by). The publisher id is the
/// stable originator and keys the message chain for duplicate detection;
/// the previous reference carries the publisher's own chaining and is not
/// enforced by the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Partition this message belongs to.
    pub partition: StreamPartitionId,
    /// Stable originator of the message chain.
    pub publisher_id: PeerId,
    /// Position of this message in its chain.
    pub message_ref: MessageRef,
    /// Position of the previous message in the chain, if any.
    pub previous_message_ref: Option<MessageRef>,
    /// The node this copy arrived from; rewritten at every hop.
    pub sender_id: PeerId,
    /// Opaque payload.
    pub content: Bytes,
}

impl DataMessage {
    /// Copy of this message with the sender rewritten to the forwarding node.
    pub fn forwarded_by(&self, sender_id: PeerId) -> Self {
        Self {
            sender_id,
            ..self.clone()
        }
    }
}

/// Request half of the neighbor negotiation exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Correlates the response with this request.
    pub request_id: u64,
    /// Partition the requester wants a neighbor in.
    pub partition: StreamPartitionId,
    /// Descriptor of the requesting node.
    pub sender: PeerDescriptor,
    /// The requester's current target neighbors.
    pub neighbor_ids: Vec<PeerId>,
    /// The requester's current contact pool.
    pub contact_ids: Vec<PeerId>,
    /// Set when this handshake was prompted by an interleave notice from
    /// the named peer; the receiver accepts unconditionally.
    pub interleaving_from: Option<PeerId>,
}

/// Response half of the neighbor negotiation exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Echoes the request id.
    pub request_id: u64,
    /// Whether the receiver took the requester as a neighbor.
    pub accepted: bool,
    /// When acceptance displaced an existing neighbor, the displaced peer's
    /// descriptor; a fresh contact candidate for the requester.
    pub interleave_target: Option<PeerDescriptor>,
}

impl HandshakeResponse {
    /// An accepting response.
    pub fn accepted(request_id: u64) -> Self {
        Self {
            request_id,
            accepted: true,
            interleave_target: None,
        }
    }

    /// A refusing response.
    pub fn refused(request_id: u64) -> Self {
        Self {
            request_id,
            accepted: false,
            interleave_target: None,
        }
    }
}

/// Periodic neighbor-list exchange between established neighbors.
///
/// The same shape serves as request and reply; a reply with `remove_me`
/// tells the receiver the sender no longer considers it a neighbor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborUpdate {
    /// The node sending this update.
    pub sender_id: PeerId,
    /// Partition the update applies to.
    pub partition: StreamPartitionId,
    /// The sender's current target neighbors.
    pub neighbor_descriptors: Vec<PeerDescriptor>,
    /// Set on a reply when the receiver is not among the sender's neighbors.
    pub remove_me: bool,
}

/// One-way notification that the sender is leaving the partition's overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveNotice {
    /// The departing node.
    pub sender_id: PeerId,
    /// Partition being left.
    pub partition: StreamPartitionId,
}

/// One-way notification that the sender evicted the receiver from its
/// neighbor set, recommending a replacement target to connect to instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterleaveNotice {
    /// The evicting node.
    pub sender_id: PeerId,
    /// Partition the eviction happened in.
    pub partition: StreamPartitionId,
    /// Recommended replacement; a handshake to it marked as interleaving is
    /// accepted unconditionally.
    pub interleave_target: PeerDescriptor,
}
