//! Boundaries toward the transport and discovery layers.
//!
//! The overlay core never opens a socket. It calls remote peers through
//! [`OverlayRpc`] clients handed out by an [`RpcConnector`], pins transport
//! connections through a [`ConnectionLocker`], and seeds itself from a
//! [`ContactSource`]. The embedding layer implements all four against its
//! real transport and discovery stack; tests implement them in memory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use freshet_proto::{
    DataMessage, HandshakeRequest, HandshakeResponse, InterleaveNotice, LeaveNotice,
    NeighborUpdate, PeerDescriptor, PeerId, StreamPartitionId,
};

use crate::error::Result;

/// Client for invoking overlay operations on one remote peer.
///
/// `handshake` and `neighbor_update` are request/response; the rest are
/// one-way notifications. A transport failure surfaces as
/// [`OverlayError::Rpc`](crate::OverlayError::Rpc) and is handled by the
/// caller as a refusal or neighbor loss, never as a fatal error.
#[async_trait]
pub trait OverlayRpc: Send + Sync {
    /// Negotiate a neighbor relationship.
    async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse>;

    /// Exchange neighbor lists; the reply mirrors the request shape.
    async fn neighbor_update(&self, update: NeighborUpdate) -> Result<NeighborUpdate>;

    /// Deliver a data message.
    async fn send_data(&self, message: DataMessage) -> Result<()>;

    /// Announce departure from the partition.
    async fn leave_notice(&self, notice: LeaveNotice) -> Result<()>;

    /// Announce an eviction with a recommended replacement target.
    async fn interleave_notice(&self, notice: InterleaveNotice) -> Result<()>;
}

/// Binds a peer descriptor to an RPC client.
///
/// Connecting is cheap and lazy; the transport establishes the underlying
/// connection on first use and keeps it alive while locked.
pub trait RpcConnector: Send + Sync {
    /// Get a client for the given peer.
    fn connect(&self, descriptor: &PeerDescriptor) -> Arc<dyn OverlayRpc>;
}

/// Pins transport connections for the lifetime of a neighbor relationship.
pub trait ConnectionLocker: Send + Sync {
    /// Keep the connection to `descriptor` alive for this partition.
    fn lock(&self, descriptor: &PeerDescriptor, partition: &StreamPartitionId);

    /// Release the pin for this partition.
    fn unlock(&self, descriptor: &PeerDescriptor, partition: &StreamPartitionId);
}

/// Locker that pins nothing.
///
/// For transports whose connections have no keep-alive cost, and for unit
/// tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopConnectionLocker;

impl ConnectionLocker for NoopConnectionLocker {
    fn lock(&self, _descriptor: &PeerDescriptor, _partition: &StreamPartitionId) {}
    fn unlock(&self, _descriptor: &PeerDescriptor, _partition: &StreamPartitionId) {}
}

/// The discovery layer's view of candidate peers for one partition.
///
/// Only the pull side lives here; discovery pushes churn through
/// [`OverlayNode::on_new_contact`](crate::OverlayNode::on_new_contact) and
/// [`OverlayNode::on_contact_removed`](crate::OverlayNode::on_contact_removed).
pub trait ContactSource: Send + Sync {
    /// Candidates already known to discovery, closest first.
    fn known_contacts(&self, limit: usize) -> Vec<PeerDescriptor>;
}

/// A remote peer usable by the overlay: a descriptor paired with the
/// capability to invoke operations on it.
///
/// Cheap to clone; a handle may sit in several contact pools at once but in
/// at most one target-neighbor set.
#[derive(Clone)]
pub struct PeerHandle {
    id: PeerId,
    descriptor: PeerDescriptor,
    rpc: Arc<dyn OverlayRpc>,
}

impl PeerHandle {
    /// Pair a descriptor with its RPC client.
    pub fn new(descriptor: PeerDescriptor, rpc: Arc<dyn OverlayRpc>) -> Self {
        Self {
            id: descriptor.peer_id(),
            descriptor,
            rpc,
        }
    }

    /// The peer's id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The peer's descriptor.
    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    /// The RPC client for this peer.
    pub fn rpc(&self) -> &Arc<dyn OverlayRpc> {
        &self.rpc
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle").field("id", &self.id.to_string()).finish()
    }
}
