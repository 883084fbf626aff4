//! Peer identity types.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Unique peer identifier (256-bit hash of the peer's identity key).
///
/// Stable for the lifetime of a connection; comparable and hashable so it
/// can key the overlay's peer pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash an identity key to create a PeerId.
    pub fn from_identity_key(key: &[u8]) -> Self {
        let hash = blake3::hash(key);
        Self(*hash.as_bytes())
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}...", &self.to_hex()[..8])
    }
}

/// Network-addressable identity of a peer.
///
/// Produced and consumed by the discovery layer; the overlay core treats it
/// as opaque beyond deriving the [`PeerId`] from the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Raw identity key; hashes to the peer id.
    pub identity_key: Vec<u8>,

    /// Network addresses the peer listens on.
    pub addresses: Vec<SocketAddr>,
}

impl PeerDescriptor {
    /// Create a new descriptor.
    pub fn new(identity_key: impl Into<Vec<u8>>, addresses: Vec<SocketAddr>) -> Self {
        Self {
            identity_key: identity_key.into(),
            addresses,
        }
    }

    /// Derive the peer id for this descriptor.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_identity_key(&self.identity_key)
    }
}

impl fmt::Display for PeerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.peer_id())
    }
}
