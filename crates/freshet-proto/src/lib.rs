//! Identifiers and logical wire messages for the Freshet overlay protocol.
//!
//! This crate fixes the *fields* of everything that crosses a node boundary:
//! peer identity, message references and the handshake/update/notice messages
//! of the gossip overlay. Turning these into actual bytes on a socket is the
//! transport layer's concern and deliberately not part of this crate; the
//! types only carry `serde` derives so any transport can encode them.

pub mod message;
pub mod peer;

pub use message::{
    DataMessage, HandshakeRequest, HandshakeResponse, InterleaveNotice, LeaveNotice, MessageRef,
    NeighborUpdate, StreamPartitionId,
};
pub use peer::{PeerDescriptor, PeerId};
