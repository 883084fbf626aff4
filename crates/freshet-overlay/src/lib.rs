//! Bounded-degree gossip overlay per stream partition.
//!
//! Nodes subscribed to the same stream partition self-organize into a
//! random graph of fixed target degree and flood data messages across it,
//! with per-node duplicate suppression terminating the flood.
//!
//! # Overview
//!
//! - [`PeerPool`]: capacity-bounded keyed collections of peers, used for
//!   the nearby-contact pool, the random-contact pool and the
//!   target-neighbor set.
//! - [`DuplicateDetector`](duplicate::DuplicateDetector): high-water-mark
//!   tracking per message chain.
//! - A handshaker negotiates symmetric neighbor relationships, including
//!   the interleave repair move that lets a poorly connected node displace
//!   a well-connected node's weakest link.
//! - A neighbor finder drives handshakes until the target degree is
//!   reached; a neighbor-update exchange detects broken symmetry and dead
//!   peers and backfills.
//! - [`OverlayNode`] wires it all together and exposes
//!   start/stop/broadcast/subscribe.
//!
//! The discovery layer (supplying candidate descriptors) and the transport
//! layer (moving bytes) stay outside this crate, behind the traits in
//! [`rpc`].
//!
//! # Example
//!
//! ```rust,ignore
//! use freshet_overlay::{OverlayConfig, OverlayNode};
//! use freshet_proto::StreamPartitionId;
//!
//! let config = OverlayConfig::new(StreamPartitionId::new("metrics", 0))
//!     .with_target_neighbor_count(4);
//! let node = OverlayNode::new(config, local_descriptor, contacts, connector, locker);
//! node.start().await?;
//!
//! let mut delivered = node.subscribe();
//! node.broadcast(message).await?;
//! while let Ok(message) = delivered.recv().await {
//!     // ...
//! }
//! ```

pub mod config;
pub mod duplicate;
pub mod error;
mod finder;
mod handshake;
pub mod node;
pub mod pool;
pub mod propagation;
pub mod rpc;
mod update;

pub use config::OverlayConfig;
pub use duplicate::DuplicateDetector;
pub use error::{OverlayError, Result};
pub use node::{OverlayNode, OverlayStats};
pub use pool::PeerPool;
pub use propagation::PropagationBuffer;
pub use rpc::{
    ConnectionLocker, ContactSource, NoopConnectionLocker, OverlayRpc, PeerHandle, RpcConnector,
};

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use bytes::Bytes;
    use freshet_proto::{
        DataMessage, HandshakeRequest, HandshakeResponse, InterleaveNotice, LeaveNotice,
        MessageRef, NeighborUpdate, PeerDescriptor, PeerId, StreamPartitionId,
    };

    use crate::config::OverlayConfig;
    use crate::error::Result;
    use crate::node::OverlayNode;
    use crate::rpc::{ContactSource, NoopConnectionLocker, OverlayRpc, PeerHandle, RpcConnector};

    pub fn local_id() -> PeerId {
        PeerId::from_identity_key(b"local")
    }

    pub fn descriptor(name: &str) -> PeerDescriptor {
        PeerDescriptor::new(name.as_bytes().to_vec(), Vec::new())
    }

    /// RPC client that refuses handshakes and swallows everything else.
    pub struct NullRpc;

    #[async_trait]
    impl OverlayRpc for NullRpc {
        async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
            Ok(HandshakeResponse::refused(request.request_id))
        }

        async fn neighbor_update(&self, update: NeighborUpdate) -> Result<NeighborUpdate> {
            Ok(NeighborUpdate {
                sender_id: PeerId::from_identity_key(b"null"),
                partition: update.partition,
                neighbor_descriptors: Vec::new(),
                remove_me: false,
            })
        }

        async fn send_data(&self, _message: DataMessage) -> Result<()> {
            Ok(())
        }

        async fn leave_notice(&self, _notice: LeaveNotice) -> Result<()> {
            Ok(())
        }

        async fn interleave_notice(&self, _notice: InterleaveNotice) -> Result<()> {
            Ok(())
        }
    }

    /// RPC client that records the notices it receives.
    #[derive(Default)]
    pub struct RecordingRpc {
        interleave_notices: Mutex<Vec<InterleaveNotice>>,
    }

    impl RecordingRpc {
        pub fn interleave_notices(&self) -> Vec<InterleaveNotice> {
            self.interleave_notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OverlayRpc for RecordingRpc {
        async fn handshake(&self, request: HandshakeRequest) -> Result<HandshakeResponse> {
            Ok(HandshakeResponse::refused(request.request_id))
        }

        async fn neighbor_update(&self, update: NeighborUpdate) -> Result<NeighborUpdate> {
            Ok(NeighborUpdate {
                sender_id: PeerId::from_identity_key(b"recording"),
                partition: update.partition,
                neighbor_descriptors: Vec::new(),
                remove_me: false,
            })
        }

        async fn send_data(&self, _message: DataMessage) -> Result<()> {
            Ok(())
        }

        async fn leave_notice(&self, _notice: LeaveNotice) -> Result<()> {
            Ok(())
        }

        async fn interleave_notice(&self, notice: InterleaveNotice) -> Result<()> {
            self.interleave_notices.lock().unwrap().push(notice);
            Ok(())
        }
    }

    pub fn stub_handle(name: &str) -> PeerHandle {
        PeerHandle::new(descriptor(name), Arc::new(NullRpc))
    }

    pub fn recording_handle(name: &str) -> (PeerHandle, Arc<RecordingRpc>) {
        let rpc = Arc::new(RecordingRpc::default());
        let handle = PeerHandle::new(descriptor(name), rpc.clone());
        (handle, rpc)
    }

    struct NullConnector;

    impl RpcConnector for NullConnector {
        fn connect(&self, _descriptor: &PeerDescriptor) -> Arc<dyn OverlayRpc> {
            Arc::new(NullRpc)
        }
    }

    struct NoContacts;

    impl ContactSource for NoContacts {
        fn known_contacts(&self, _limit: usize) -> Vec<PeerDescriptor> {
            Vec::new()
        }
    }

    /// Node wired to a transport that reaches nobody.
    pub fn test_node(config: OverlayConfig) -> OverlayNode {
        OverlayNode::new(
            config,
            descriptor("local"),
            Arc::new(NoContacts),
            Arc::new(NullConnector),
            Arc::new(NoopConnectionLocker),
        )
    }

    pub fn data_message(publisher: &str, timestamp: u64, previous: Option<MessageRef>) -> DataMessage {
        DataMessage {
            partition: StreamPartitionId::new("stream", 0),
            publisher_id: descriptor(publisher).peer_id(),
            message_ref: MessageRef::new(timestamp, 0),
            previous_message_ref: previous,
            sender_id: descriptor(publisher).peer_id(),
            content: Bytes::from_static(b"payload"),
        }
    }

    /// Poll `predicate` until it holds or the deadline passes.
    pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while !predicate() {
            if Instant::now() > deadline {
                panic!("condition not reached within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
