//! Best-effort fan-out of data messages to target neighbors.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use freshet_proto::{DataMessage, MessageRef, PeerId};
use futures::future::join_all;
use tracing::{debug, trace};

use crate::node::NodeInner;
use crate::rpc::PeerHandle;

/// A message that has not yet reached its minimum fan-out.
#[derive(Debug)]
struct BufferedMessage {
    message: DataMessage,
    attempted: HashSet<PeerId>,
    delivered: usize,
    buffered_at: Instant,
}

/// FIFO buffer of under-delivered messages.
///
/// Delivery to a neighbor is attempted at most once per message; what this
/// buffer adds is delivery to neighbors that did not exist yet when the
/// message was first fanned out. Entries expire after a TTL and the buffer
/// is capacity-bounded, oldest dropped first.
#[derive(Debug)]
pub struct PropagationBuffer {
    min_targets: usize,
    ttl: Duration,
    capacity: usize,
    entries: VecDeque<BufferedMessage>,
}

impl PropagationBuffer {
    /// Create a buffer requiring `min_targets` deliveries per message.
    pub fn new(min_targets: usize, ttl: Duration, capacity: usize) -> Self {
        Self {
            min_targets,
            ttl,
            capacity,
            entries: VecDeque::new(),
        }
    }

    /// Buffer a message that reached only `delivered` of the required
    /// targets. `attempted` lists every neighbor the message was already
    /// sent to (or arrived from).
    pub fn insert(&mut self, message: DataMessage, attempted: HashSet<PeerId>, delivered: usize) {
        self.prune(Instant::now());
        if delivered >= self.min_targets {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(BufferedMessage {
            message,
            attempted,
            delivered,
            buffered_at: Instant::now(),
        });
    }

    /// Messages that still need targets and have not been attempted against
    /// `id`. Marks them attempted; the caller reports outcomes through
    /// [`record_delivery`](PropagationBuffer::record_delivery).
    pub fn take_pending_for(&mut self, id: PeerId) -> Vec<DataMessage> {
        self.prune(Instant::now());
        let mut pending = Vec::new();
        for entry in &mut self.entries {
            if entry.delivered >= self.min_targets
                || entry.message.publisher_id == id
                || entry.attempted.contains(&id)
            {
                continue;
            }
            entry.attempted.insert(id);
            pending.push(entry.message.clone());
        }
        pending
    }

    /// Count a successful delivery; the entry is dropped once satisfied.
    pub fn record_delivery(&mut self, publisher: PeerId, message_ref: MessageRef) {
        if let Some(index) = self.entries.iter().position(|entry| {
            entry.message.publisher_id == publisher && entry.message.message_ref == message_ref
        }) {
            self.entries[index].delivered += 1;
            if self.entries[index].delivered >= self.min_targets {
                self.entries.remove(index);
            }
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything (used on stop).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.buffered_at) > self.ttl {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Fans messages out to the current target neighbors.
#[derive(Clone)]
pub(crate) struct Propagation {
    inner: Arc<NodeInner>,
}

impl Propagation {
    pub fn new(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Deliver `message` to every current target neighbor except
    /// `exclude` (the peer it arrived from).
    ///
    /// Deliveries are concurrent and fire-and-forget per neighbor: a
    /// failure is logged, blocks nothing, and is not retried against that
    /// neighbor. A message short of the minimum fan-out is buffered for
    /// neighbors that join later.
    pub async fn fan_out(&self, message: &DataMessage, exclude: Option<PeerId>) {
        let outgoing = message.forwarded_by(self.inner.local_id);
        let targets: Vec<PeerHandle> = {
            let state = self.inner.state.read().await;
            state
                .neighbors
                .handles()
                .into_iter()
                .filter(|handle| Some(handle.id()) != exclude)
                .collect()
        };

        let results = join_all(targets.iter().map(|handle| {
            let copy = outgoing.clone();
            async move { (handle.id(), handle.rpc().send_data(copy).await) }
        }))
        .await;

        let mut attempted: HashSet<PeerId> = targets.iter().map(PeerHandle::id).collect();
        if let Some(excluded) = exclude {
            attempted.insert(excluded);
        }

        let mut delivered = 0;
        for (peer, result) in results {
            match result {
                Ok(()) => delivered += 1,
                Err(error) => debug!(%peer, %error, "data delivery failed"),
            }
        }
        trace!(
            message_ref = %outgoing.message_ref,
            delivered,
            wanted = self.inner.config.min_propagation_targets,
            "propagated message"
        );

        let mut state = self.inner.state.write().await;
        state.messages_propagated += 1;
        if delivered < self.inner.config.min_propagation_targets {
            state.buffer.insert(outgoing, attempted, delivered);
        }
    }

    /// Send buffered under-delivered messages to a freshly added neighbor.
    pub async fn on_neighbor_added(&self, handle: &PeerHandle) {
        let pending = {
            let mut state = self.inner.state.write().await;
            state.buffer.take_pending_for(handle.id())
        };
        for message in pending {
            match handle.rpc().send_data(message.clone()).await {
                Ok(()) => {
                    let mut state = self.inner.state.write().await;
                    state
                        .buffer
                        .record_delivery(message.publisher_id, message.message_ref);
                }
                Err(error) => {
                    debug!(peer = %handle.id(), %error, "buffered delivery failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use freshet_proto::StreamPartitionId;

    fn peer(name: &str) -> PeerId {
        PeerId::from_identity_key(name.as_bytes())
    }

    fn message(publisher: &str, timestamp: u64) -> DataMessage {
        DataMessage {
            partition: StreamPartitionId::new("stream", 0),
            publisher_id: peer(publisher),
            message_ref: MessageRef::new(timestamp, 0),
            previous_message_ref: None,
            sender_id: peer(publisher),
            content: bytes::Bytes::from_static(b"payload"),
        }
    }

    #[test]
    fn satisfied_messages_are_not_buffered() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_secs(30), 8);
        buffer.insert(message("p", 1), HashSet::new(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn late_neighbor_drains_pending_until_satisfied() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_secs(30), 8);
        let msg = message("p", 1);
        buffer.insert(msg.clone(), HashSet::new(), 1);

        let newcomer = peer("n");
        let pending = buffer.take_pending_for(newcomer);
        assert_eq!(pending.len(), 1);
        // attempted once, not handed out again for the same neighbor
        assert!(buffer.take_pending_for(newcomer).is_empty());

        buffer.record_delivery(msg.publisher_id, msg.message_ref);
        assert!(buffer.is_empty());
    }

    #[test]
    fn attempted_neighbors_are_skipped() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_secs(30), 8);
        let tried = peer("tried");
        buffer.insert(message("p", 1), HashSet::from([tried]), 0);
        assert!(buffer.take_pending_for(tried).is_empty());
        assert_eq!(buffer.take_pending_for(peer("fresh")).len(), 1);
    }

    #[test]
    fn publisher_never_gets_its_own_message_back() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_secs(30), 8);
        buffer.insert(message("p", 1), HashSet::new(), 0);
        assert!(buffer.take_pending_for(peer("p")).is_empty());
    }

    #[test]
    fn capacity_drops_oldest_first() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_secs(30), 2);
        buffer.insert(message("p", 1), HashSet::new(), 0);
        buffer.insert(message("p", 2), HashSet::new(), 0);
        buffer.insert(message("p", 3), HashSet::new(), 0);
        assert_eq!(buffer.len(), 2);
        let pending = buffer.take_pending_for(peer("n"));
        assert_eq!(pending[0].message_ref, MessageRef::new(2, 0));
    }

    #[test]
    fn expired_entries_are_pruned() {
        let mut buffer = PropagationBuffer::new(2, Duration::from_millis(10), 8);
        buffer.insert(message("p", 1), HashSet::new(), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(buffer.take_pending_for(peer("n")).is_empty());
        assert!(buffer.is_empty());
    }
}
