//! The overlay node: one bounded-degree gossip overlay per stream
//! partition.
//!
//! Wires the peer pools, duplicate detector, handshaker, neighbor finder,
//! update manager and propagation together; consumes candidate-peer events
//! from the discovery layer and exposes start/stop/broadcast/subscribe.
//!
//! # Concurrency
//!
//! One node instance is logically single-threaded: every pool mutation and
//! duplicate check happens under one state lock that is never held across
//! an await, so inbound RPC handlers, timer callbacks and discovery events
//! interleave without further locking. Instances for different partitions
//! share nothing mutable. All scheduled work observes a single shutdown
//! signal set by [`stop`](OverlayNode::stop).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use freshet_proto::{
    DataMessage, HandshakeRequest, HandshakeResponse, InterleaveNotice, LeaveNotice,
    NeighborUpdate, PeerDescriptor, PeerId, StreamPartitionId,
};
use futures::future::join_all;
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::OverlayConfig;
use crate::duplicate::DuplicateDetector;
use crate::error::{OverlayError, Result};
use crate::finder::NeighborFinder;
use crate::handshake::Handshaker;
use crate::pool::PeerPool;
use crate::propagation::{Propagation, PropagationBuffer};
use crate::rpc::{ConnectionLocker, ContactSource, PeerHandle, RpcConnector};
use crate::update::NeighborUpdateManager;

/// Node lifecycle. Stop is terminal; a stopped node cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Created,
    Started,
    Stopped,
}

/// Everything mutable about one node, guarded by a single lock.
pub(crate) struct NodeState {
    pub lifecycle: Lifecycle,
    /// Candidates, closest first, as provided by discovery.
    pub nearby: PeerPool,
    /// Candidates in arrival order, sampled uniformly as a fallback.
    pub random: PeerPool,
    /// Established (intendedly symmetric) neighbor relationships.
    pub neighbors: PeerPool,
    /// Candidates with a handshake currently in flight.
    pub ongoing_handshakes: HashSet<PeerId>,
    pub detector: DuplicateDetector,
    /// Latest neighbor list each neighbor reported about itself.
    pub reported_neighbors: HashMap<PeerId, Vec<PeerDescriptor>>,
    pub buffer: PropagationBuffer,
    pub messages_propagated: u64,
}

impl NodeState {
    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Started
    }

    /// Nearby contacts still worth a handshake: not excluded, not already
    /// neighbors.
    pub fn eligible_contacts(&self, excluded: &[PeerId]) -> usize {
        self.nearby
            .ids()
            .into_iter()
            .filter(|id| !excluded.contains(id) && !self.neighbors.contains(id))
            .count()
    }
}

/// Shared core of one overlay node, handed to every component.
pub(crate) struct NodeInner {
    pub config: OverlayConfig,
    pub local: PeerDescriptor,
    pub local_id: PeerId,
    pub state: RwLock<NodeState>,
    pub connector: Arc<dyn RpcConnector>,
    pub locker: Arc<dyn ConnectionLocker>,
    pub contacts: Arc<dyn ContactSource>,
    pub delivered: broadcast::Sender<DataMessage>,
    pub shutdown: watch::Sender<bool>,
}

impl NodeInner {
    pub fn handle_for(&self, descriptor: &PeerDescriptor) -> PeerHandle {
        PeerHandle::new(descriptor.clone(), self.connector.connect(descriptor))
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// Snapshot of one node's overlay state.
#[derive(Debug, Clone)]
pub struct OverlayStats {
    pub neighbor_count: usize,
    pub nearby_contact_count: usize,
    pub random_contact_count: usize,
    pub messages_seen: u64,
    pub duplicates_dropped: u64,
    pub messages_propagated: u64,
    pub finder_active: bool,
}

impl fmt::Display for OverlayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} neighbors, {} contacts ({} random), {} msgs seen / {} dup / {} propagated",
            self.neighbor_count,
            self.nearby_contact_count,
            self.random_contact_count,
            self.messages_seen,
            self.duplicates_dropped,
            self.messages_propagated,
        )
    }
}

/// One partition's overlay node.
///
/// Degraded states are normal: handshake refusals, transport failures and
/// duplicate messages never escape `start`/`stop`/`broadcast`; the node
/// keeps running under-degree and self-heals through the finder and the
/// update manager.
pub struct OverlayNode {
    pub(crate) inner: Arc<NodeInner>,
    pub(crate) handshaker: Handshaker,
    pub(crate) finder: NeighborFinder,
    pub(crate) updates: NeighborUpdateManager,
    pub(crate) propagation: Propagation,
}

impl OverlayNode {
    /// Build a node for one partition.
    ///
    /// Every configuration default is resolved here; no component derives
    /// its own.
    pub fn new(
        config: OverlayConfig,
        local: PeerDescriptor,
        contacts: Arc<dyn ContactSource>,
        connector: Arc<dyn RpcConnector>,
        locker: Arc<dyn ConnectionLocker>,
    ) -> Self {
        let config = config.normalized();
        let local_id = local.peer_id();
        let (delivered, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        let state = NodeState {
            lifecycle: Lifecycle::Created,
            nearby: PeerPool::new(local_id, config.max_contact_pool_size),
            random: PeerPool::new(local_id, config.max_contact_pool_size),
            neighbors: PeerPool::new(local_id, config.target_neighbor_count),
            ongoing_handshakes: HashSet::new(),
            detector: DuplicateDetector::new(config.max_message_chains),
            reported_neighbors: HashMap::new(),
            buffer: PropagationBuffer::new(
                config.min_propagation_targets,
                config.propagation_buffer_ttl,
                config.propagation_buffer_size,
            ),
            messages_propagated: 0,
        };

        let inner = Arc::new(NodeInner {
            config,
            local,
            local_id,
            state: RwLock::new(state),
            connector,
            locker,
            contacts,
            delivered,
            shutdown,
        });

        let propagation = Propagation::new(Arc::clone(&inner));
        let handshaker = Handshaker::new(Arc::clone(&inner), propagation.clone());
        let finder = NeighborFinder::new(Arc::clone(&inner), handshaker.clone());
        let updates = NeighborUpdateManager::new(Arc::clone(&inner), finder.clone());

        Self {
            inner,
            handshaker,
            finder,
            updates,
            propagation,
        }
    }

    /// Start participating in the partition's overlay.
    ///
    /// Seeds the contact pools from what discovery already knows and starts
    /// the finder and the update manager. Idempotent; a stopped node cannot
    /// be started again.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write().await;
            match state.lifecycle {
                Lifecycle::Started => return Ok(()),
                Lifecycle::Stopped => {
                    return Err(OverlayError::Stopped {
                        partition: self.inner.config.partition.clone(),
                    })
                }
                Lifecycle::Created => state.lifecycle = Lifecycle::Started,
            }
            for descriptor in self
                .inner
                .contacts
                .known_contacts(self.inner.config.max_contact_pool_size)
            {
                let handle = self.inner.handle_for(&descriptor);
                state.nearby.add(handle.clone());
                state.random.add(handle);
            }
        }

        info!(
            partition = %self.inner.config.partition,
            peer = %self.inner.local_id,
            "overlay node started"
        );
        self.finder.start(Vec::new());
        self.updates.start();
        Ok(())
    }

    /// Leave the overlay: notify neighbors, stop all scheduled work, clear
    /// every pool. Idempotent and terminal.
    pub async fn stop(&self) {
        let neighbors = {
            let mut state = self.inner.state.write().await;
            let was_running = state.is_running();
            state.lifecycle = Lifecycle::Stopped;
            if !was_running {
                let _ = self.inner.shutdown.send(true);
                self.finder.stop();
                return;
            }
            let neighbors = state.neighbors.handles();
            state.nearby.clear();
            state.random.clear();
            state.neighbors.clear();
            state.ongoing_handshakes.clear();
            state.reported_neighbors.clear();
            state.detector.clear();
            state.buffer.clear();
            neighbors
        };

        let notice = LeaveNotice {
            sender_id: self.inner.local_id,
            partition: self.inner.config.partition.clone(),
        };
        join_all(neighbors.iter().map(|handle| {
            let notice = notice.clone();
            async move {
                if let Err(error) = handle.rpc().leave_notice(notice).await {
                    debug!(peer = %handle.id(), %error, "leave notice undeliverable");
                }
            }
        }))
        .await;
        for handle in &neighbors {
            self.inner
                .locker
                .unlock(handle.descriptor(), &self.inner.config.partition);
        }

        let _ = self.inner.shutdown.send(true);
        self.finder.stop();
        info!(
            partition = %self.inner.config.partition,
            peer = %self.inner.local_id,
            "overlay node stopped"
        );
    }

    /// Flood a locally originated message to the overlay.
    ///
    /// Re-broadcasting an already-seen `(previous_ref, ref)` pair is a
    /// silent no-op.
    pub async fn broadcast(&self, message: DataMessage) -> Result<()> {
        if message.partition != self.inner.config.partition {
            return Err(OverlayError::PartitionMismatch {
                expected: self.inner.config.partition.clone(),
                actual: message.partition.clone(),
            });
        }
        let fresh = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() {
                return Err(OverlayError::NotRunning {
                    partition: self.inner.config.partition.clone(),
                });
            }
            state.detector.mark_and_check(
                message.publisher_id,
                message.previous_message_ref,
                message.message_ref,
            )
        };
        if fresh {
            self.propagation.fan_out(&message, None).await;
        }
        Ok(())
    }

    /// Subscribe to messages delivered by the overlay.
    pub fn subscribe(&self) -> broadcast::Receiver<DataMessage> {
        self.inner.delivered.subscribe()
    }

    /// Inbound data message from a neighbor.
    ///
    /// New messages are emitted to subscribers and re-propagated to every
    /// neighbor except the sender; duplicates are silently absorbed.
    pub async fn on_data(&self, message: DataMessage) {
        if message.partition != self.inner.config.partition {
            warn!(
                expected = %self.inner.config.partition,
                actual = %message.partition,
                "data message for wrong partition dropped"
            );
            return;
        }
        if message.sender_id == self.inner.local_id {
            return;
        }
        let fresh = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() {
                return;
            }
            state.detector.mark_and_check(
                message.publisher_id,
                message.previous_message_ref,
                message.message_ref,
            )
        };
        if !fresh {
            trace!(message_ref = %message.message_ref, "duplicate absorbed");
            return;
        }
        let _ = self.inner.delivered.send(message.clone());
        self.propagation
            .fan_out(&message, Some(message.sender_id))
            .await;
    }

    /// Inbound handshake request.
    pub async fn on_handshake_request(&self, request: HandshakeRequest) -> HandshakeResponse {
        if request.partition != self.inner.config.partition {
            warn!(
                expected = %self.inner.config.partition,
                actual = %request.partition,
                "handshake for wrong partition refused"
            );
            return HandshakeResponse::refused(request.request_id);
        }
        self.handshaker.handle_request(request).await
    }

    /// Inbound neighbor-update exchange.
    pub async fn on_neighbor_update(&self, update: NeighborUpdate) -> NeighborUpdate {
        if update.partition != self.inner.config.partition {
            warn!(
                expected = %self.inner.config.partition,
                actual = %update.partition,
                "neighbor update for wrong partition"
            );
            return NeighborUpdate {
                sender_id: self.inner.local_id,
                partition: self.inner.config.partition.clone(),
                neighbor_descriptors: Vec::new(),
                remove_me: true,
            };
        }
        self.updates.handle_update(update).await
    }

    /// Inbound leave notice: forget the sender everywhere and backfill.
    pub async fn on_leave_notice(&self, notice: LeaveNotice) {
        if notice.partition != self.inner.config.partition {
            warn!(
                expected = %self.inner.config.partition,
                actual = %notice.partition,
                "leave notice for wrong partition dropped"
            );
            return;
        }
        let removed = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() {
                return;
            }
            state.nearby.remove(&notice.sender_id);
            state.random.remove(&notice.sender_id);
            state.reported_neighbors.remove(&notice.sender_id);
            state.neighbors.remove(&notice.sender_id)
        };
        if let Some(handle) = &removed {
            self.inner
                .locker
                .unlock(handle.descriptor(), &self.inner.config.partition);
            debug!(peer = %handle.id(), "neighbor left the partition");
        }
        self.finder.start(Vec::new());
    }

    /// Inbound interleave notice: we were evicted; reconnect to the
    /// recommended target.
    pub async fn on_interleave_notice(&self, notice: InterleaveNotice) {
        if notice.partition != self.inner.config.partition {
            warn!(
                expected = %self.inner.config.partition,
                actual = %notice.partition,
                "interleave notice for wrong partition dropped"
            );
            return;
        }
        self.handshaker.handle_interleave_notice(notice).await;
    }

    /// Discovery pushed a fresh contact along with the new closest-K view.
    ///
    /// The nearby pool is replaced wholesale; proximity is the discovery
    /// layer's call, not ours.
    pub async fn on_new_contact(&self, descriptor: PeerDescriptor, closest: Vec<PeerDescriptor>) {
        let needs_more = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() {
                return;
            }
            let handles = closest
                .iter()
                .map(|descriptor| self.inner.handle_for(descriptor))
                .collect();
            state.nearby.replace_all(handles);
            state.random.add(self.inner.handle_for(&descriptor));
            state.neighbors.len() < self.inner.config.target_neighbor_count
        };
        if needs_more {
            self.finder.start(Vec::new());
        }
    }

    /// Discovery dropped a contact; same wholesale replacement.
    pub async fn on_contact_removed(
        &self,
        descriptor: PeerDescriptor,
        closest: Vec<PeerDescriptor>,
    ) {
        let mut state = self.inner.state.write().await;
        if !state.is_running() {
            return;
        }
        let handles = closest
            .iter()
            .map(|descriptor| self.inner.handle_for(descriptor))
            .collect();
        state.nearby.replace_all(handles);
        state.random.remove_by_descriptor(&descriptor);
    }

    /// The partition this node serves.
    pub fn partition(&self) -> &StreamPartitionId {
        &self.inner.config.partition
    }

    /// This node's peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// This node's descriptor.
    pub fn local_descriptor(&self) -> &PeerDescriptor {
        &self.inner.local
    }

    /// Current target neighbors, closest first.
    pub async fn neighbor_ids(&self) -> Vec<PeerId> {
        self.inner.state.read().await.neighbors.ids()
    }

    /// Whether the node is started and not yet stopped.
    pub async fn is_running(&self) -> bool {
        self.inner.state.read().await.is_running()
    }

    /// Whether a neighbor-search session is currently running.
    pub fn is_searching(&self) -> bool {
        self.finder.is_active()
    }

    /// Snapshot of the node's overlay state.
    pub async fn stats(&self) -> OverlayStats {
        let state = self.inner.state.read().await;
        OverlayStats {
            neighbor_count: state.neighbors.len(),
            nearby_contact_count: state.nearby.len(),
            random_contact_count: state.random.len(),
            messages_seen: state.detector.messages_seen(),
            duplicates_dropped: state.detector.duplicates_dropped(),
            messages_propagated: state.messages_propagated,
            finder_active: self.finder.is_active(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{data_message, descriptor, test_node};
    use freshet_proto::MessageRef;
    use std::time::Duration;

    fn config() -> OverlayConfig {
        OverlayConfig::new(StreamPartitionId::new("stream", 0))
            .with_handshake_initial_delay(Duration::from_millis(1))
            .with_handshake_retry_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_terminal() {
        let node = test_node(config());
        node.start().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running().await);

        node.stop().await;
        node.stop().await;
        assert!(!node.is_running().await);
        assert!(matches!(
            node.start().await,
            Err(OverlayError::Stopped { .. })
        ));
    }

    #[tokio::test]
    async fn broadcast_requires_a_running_node() {
        let node = test_node(config());
        let message = data_message("publisher", 1, None);
        assert!(matches!(
            node.broadcast(message).await,
            Err(OverlayError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn broadcast_rejects_foreign_partitions() {
        let node = test_node(config());
        node.start().await.unwrap();
        let mut message = data_message("publisher", 1, None);
        message.partition = StreamPartitionId::new("elsewhere", 9);
        assert!(matches!(
            node.broadcast(message).await,
            Err(OverlayError::PartitionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_data_is_emitted_once() {
        let node = test_node(config());
        node.start().await.unwrap();
        let mut delivered = node.subscribe();

        let mut message = data_message("publisher", 5, Some(MessageRef::new(4, 0)));
        message.sender_id = descriptor("relay").peer_id();

        node.on_data(message.clone()).await;
        node.on_data(message.clone()).await;

        assert_eq!(delivered.recv().await.unwrap(), message);
        assert!(delivered.try_recv().is_err());

        let stats = node.stats().await;
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[tokio::test]
    async fn own_broadcast_echo_is_absorbed() {
        let node = test_node(config());
        node.start().await.unwrap();
        let mut delivered = node.subscribe();

        let message = data_message("publisher", 3, None);
        node.broadcast(message.clone()).await.unwrap();

        // The same chain position coming back from a neighbor is a duplicate.
        let mut echo = message;
        echo.sender_id = descriptor("relay").peer_id();
        node.on_data(echo).await;
        assert!(delivered.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_notice_forgets_the_peer_and_rearms_the_finder() {
        let node = test_node(config());
        node.start().await.unwrap();
        // let the initial (contact-less) search session go idle first
        crate::testutil::wait_until(Duration::from_secs(1), || !node.is_searching()).await;

        let peer = crate::testutil::stub_handle("leaver");
        {
            let mut state = node.inner.state.write().await;
            state.nearby.add(peer.clone());
            state.random.add(peer.clone());
            state.neighbors.add(peer.clone());
        }

        node.on_leave_notice(LeaveNotice {
            sender_id: peer.id(),
            partition: node.partition().clone(),
        })
        .await;

        let state = node.inner.state.read().await;
        assert!(!state.nearby.contains(&peer.id()));
        assert!(!state.random.contains(&peer.id()));
        assert!(!state.neighbors.contains(&peer.id()));
        drop(state);
        assert!(node.is_searching());
    }

    #[tokio::test]
    async fn contact_churn_replaces_the_nearby_pool_wholesale() {
        let node = test_node(config());
        node.start().await.unwrap();

        node.on_new_contact(descriptor("a"), vec![descriptor("a"), descriptor("b")])
            .await;
        {
            let state = node.inner.state.read().await;
            assert_eq!(
                state.nearby.ids(),
                vec![descriptor("a").peer_id(), descriptor("b").peer_id()]
            );
            assert!(state.random.contains(&descriptor("a").peer_id()));
        }

        node.on_contact_removed(descriptor("a"), vec![descriptor("b")])
            .await;
        let state = node.inner.state.read().await;
        assert_eq!(state.nearby.ids(), vec![descriptor("b").peer_id()]);
        assert!(!state.random.contains(&descriptor("a").peer_id()));
    }
}
