//! Periodic liveness/consistency exchange between established neighbors.

use std::sync::Arc;

use freshet_proto::{NeighborUpdate, PeerDescriptor};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::finder::NeighborFinder;
use crate::node::NodeInner;
use crate::rpc::PeerHandle;

/// Exchanges neighbor lists with every current neighbor on a fixed
/// interval.
///
/// This is the only mechanism that detects silently-broken symmetry: if a
/// peer no longer considers us a neighbor it replies `remove_me`, and we
/// drop it and backfill. The reported lists double as a source of
/// second-degree candidates when the local pool is under capacity, and a
/// failed exchange counts as a dead neighbor.
#[derive(Clone)]
pub(crate) struct NeighborUpdateManager {
    inner: Arc<NodeInner>,
    finder: NeighborFinder,
}

impl NeighborUpdateManager {
    pub fn new(inner: Arc<NodeInner>, finder: NeighborFinder) -> Self {
        Self { inner, finder }
    }

    /// Run the exchange loop until the node's shutdown signal fires.
    pub fn start(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut shutdown = manager.inner.shutdown.subscribe();
            let mut ticker = tokio::time::interval(manager.inner.config.neighbor_update_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        manager.run_once().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    /// One full exchange round against the current neighbor set.
    pub async fn run_once(&self) {
        let (neighbors, ours) = {
            let state = self.inner.state.read().await;
            if !state.is_running() {
                return;
            }
            (state.neighbors.handles(), state.neighbors.descriptors())
        };
        join_all(
            neighbors
                .iter()
                .map(|handle| self.exchange(handle, ours.clone())),
        )
        .await;
    }

    async fn exchange(&self, handle: &PeerHandle, ours: Vec<PeerDescriptor>) {
        let update = NeighborUpdate {
            sender_id: self.inner.local_id,
            partition: self.inner.config.partition.clone(),
            neighbor_descriptors: ours,
            remove_me: false,
        };

        match handle.rpc().neighbor_update(update).await {
            Ok(reply) if reply.remove_me => {
                debug!(peer = %handle.id(), "neighbor no longer lists us, removing");
                self.drop_neighbor(handle).await;
                self.finder.start(vec![handle.id()]);
            }
            Ok(reply) => {
                let found_candidates = {
                    let mut state = self.inner.state.write().await;
                    state
                        .reported_neighbors
                        .insert(handle.id(), reply.neighbor_descriptors.clone());
                    let mut added = false;
                    if state.neighbors.len() < self.inner.config.target_neighbor_count {
                        // Second-degree candidates fill the contact pool
                        // while we are under capacity.
                        for descriptor in &reply.neighbor_descriptors {
                            let id = descriptor.peer_id();
                            if id == self.inner.local_id || state.neighbors.contains(&id) {
                                continue;
                            }
                            added |= state.nearby.add(self.inner.handle_for(descriptor));
                        }
                    }
                    added
                };
                if found_candidates {
                    self.finder.start(Vec::new());
                }
            }
            Err(error) => {
                warn!(peer = %handle.id(), %error, "neighbor update failed, removing neighbor");
                self.drop_neighbor(handle).await;
                self.finder.start(vec![handle.id()]);
            }
        }
    }

    /// Server side: report our neighbor list, or ask to be removed when the
    /// caller is not one of our neighbors.
    pub async fn handle_update(&self, update: NeighborUpdate) -> NeighborUpdate {
        let mut state = self.inner.state.write().await;
        let is_neighbor = state.is_running() && state.neighbors.contains(&update.sender_id);
        if is_neighbor {
            state
                .reported_neighbors
                .insert(update.sender_id, update.neighbor_descriptors);
        }
        NeighborUpdate {
            sender_id: self.inner.local_id,
            partition: self.inner.config.partition.clone(),
            neighbor_descriptors: state.neighbors.descriptors(),
            remove_me: !is_neighbor,
        }
    }

    async fn drop_neighbor(&self, handle: &PeerHandle) {
        let removed = {
            let mut state = self.inner.state.write().await;
            state.reported_neighbors.remove(&handle.id());
            state.neighbors.remove(&handle.id())
        };
        if removed.is_some() {
            self.inner
                .locker
                .unlock(handle.descriptor(), &self.inner.config.partition);
        }
    }
}
