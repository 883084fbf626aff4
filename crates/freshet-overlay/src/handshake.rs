//! Neighbor negotiation: turning a contact into a neighbor.
//!
//! One handshake decides, for a single candidate at a time, whether a
//! symmetric neighbor relationship can be formed. The server-side decision
//! ladder includes the interleave repair move: a full node may sacrifice
//! its furthest neighbor to admit a requester that is markedly worse off,
//! redirecting the evicted peer to the requester as a replacement target.

use std::sync::Arc;

use freshet_proto::{HandshakeRequest, HandshakeResponse, InterleaveNotice, PeerId};
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, warn};

use crate::node::NodeInner;
use crate::propagation::Propagation;
use crate::rpc::PeerHandle;

#[derive(Clone)]
pub(crate) struct Handshaker {
    inner: Arc<NodeInner>,
    propagation: Propagation,
}

impl Handshaker {
    pub fn new(inner: Arc<NodeInner>, propagation: Propagation) -> Self {
        Self { inner, propagation }
    }

    /// One finder round: pick candidates from the contact pools and attempt
    /// handshakes against them concurrently.
    ///
    /// Returns the exclusion list extended with every candidate that
    /// refused or failed this round.
    pub async fn attempt_handshakes(&self, mut excluded: Vec<PeerId>) -> Vec<PeerId> {
        let candidates = {
            let state = self.inner.state.read().await;
            if !state.is_running()
                || state.neighbors.len() >= self.inner.config.target_neighbor_count
            {
                return excluded;
            }

            let mut unavailable = excluded.clone();
            unavailable.extend(state.neighbors.ids());
            unavailable.extend(state.ongoing_handshakes.iter().copied());

            // Well below target: two concurrent attempts against both ends
            // of the contact ordering. Near target: one careful attempt.
            let in_flight = state.neighbors.len() + state.ongoing_handshakes.len();
            let mut picks = if in_flight < self.inner.config.interleave_threshold() {
                state.nearby.closest_and_furthest(&unavailable)
            } else {
                state.nearby.closest(&unavailable).into_iter().collect()
            };
            if picks.is_empty() {
                picks = state.random.sample_random(&unavailable).into_iter().collect();
            }
            picks
        };

        if candidates.is_empty() {
            return excluded;
        }

        let outcomes = join_all(candidates.iter().map(|handle| async move {
            (handle.id(), self.attempt_handshake(handle, None).await)
        }))
        .await;

        for (peer, accepted) in outcomes {
            if !accepted {
                excluded.push(peer);
            }
        }
        excluded
    }

    /// Run the wire exchange against one candidate.
    ///
    /// Returns whether the candidate accepted. Refusals and transport
    /// failures read the same to the caller; the candidate just joins the
    /// round's exclusion list.
    pub async fn attempt_handshake(
        &self,
        handle: &PeerHandle,
        interleaving_from: Option<PeerId>,
    ) -> bool {
        let peer = handle.id();
        let request = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() || !state.ongoing_handshakes.insert(peer) {
                // Stopped, or the same candidate is already being attempted.
                return false;
            }
            HandshakeRequest {
                request_id: rand::thread_rng().gen(),
                partition: self.inner.config.partition.clone(),
                sender: self.inner.local.clone(),
                neighbor_ids: state.neighbors.ids(),
                contact_ids: state.nearby.ids(),
                interleaving_from,
            }
        };

        let outcome = handle.rpc().handshake(request).await;

        let accepted = {
            let mut state = self.inner.state.write().await;
            state.ongoing_handshakes.remove(&peer);
            match &outcome {
                Ok(response) if response.accepted && state.is_running() => {
                    let newly_added = state.neighbors.add(handle.clone());
                    if let Some(target) = &response.interleave_target {
                        let target_id = target.peer_id();
                        if target_id != self.inner.local_id && !state.neighbors.contains(&target_id)
                        {
                            state.nearby.add(self.inner.handle_for(target));
                        }
                    }
                    if newly_added || state.neighbors.contains(&peer) {
                        Some(newly_added)
                    } else {
                        // Inbound handshakes filled the pool while this
                        // exchange was in flight; the remote's update
                        // exchange will get remove_me and drop us.
                        debug!(%peer, "accepted but pool filled meanwhile");
                        None
                    }
                }
                _ => None,
            }
        };

        match (accepted, outcome) {
            (Some(newly_added), _) => {
                self.inner
                    .locker
                    .lock(handle.descriptor(), &self.inner.config.partition);
                debug!(%peer, "handshake accepted");
                if newly_added {
                    self.propagation.on_neighbor_added(handle).await;
                }
                true
            }
            (None, Ok(_)) => {
                debug!(%peer, "handshake refused");
                false
            }
            (None, Err(error)) => {
                warn!(%peer, %error, "handshake failed");
                false
            }
        }
    }

    /// Server side of the exchange.
    pub async fn handle_request(&self, request: HandshakeRequest) -> HandshakeResponse {
        let request_id = request.request_id;
        let requester_id = request.sender.peer_id();

        // Decide and mutate under the lock; notify outside it.
        let (response, added, evicted, notify_evicted) = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() || requester_id == self.inner.local_id {
                return HandshakeResponse::refused(request_id);
            }

            if state.neighbors.contains(&requester_id) {
                // Re-negotiating an existing relationship is fine.
                (HandshakeResponse::accepted(request_id), None, None, false)
            } else if request.interleaving_from.is_some() {
                // The requester was displaced specifically to make room
                // here; accept unconditionally, shedding our furthest
                // neighbor if we are full.
                let evicted = if state.neighbors.is_full() {
                    state
                        .neighbors
                        .furthest(&[requester_id])
                        .map(|victim| {
                            state.neighbors.remove(&victim.id());
                            victim
                        })
                } else {
                    None
                };
                let handle = self.inner.handle_for(&request.sender);
                state.neighbors.add(handle.clone());
                (
                    HandshakeResponse::accepted(request_id),
                    Some(handle),
                    evicted,
                    false,
                )
            } else if !state.neighbors.is_full() {
                let handle = self.inner.handle_for(&request.sender);
                state.neighbors.add(handle.clone());
                (
                    HandshakeResponse::accepted(request_id),
                    Some(handle),
                    None,
                    false,
                )
            } else if request.neighbor_ids.len() < self.inner.config.interleave_threshold() {
                // Interleave: the requester is markedly worse off than we
                // are. Displace our furthest neighbor and redirect it to the
                // requester, skipping neighbors the requester already has,
                // for whom the redirect buys nothing.
                let mut useless = request.neighbor_ids.clone();
                useless.push(requester_id);
                match state.neighbors.furthest(&useless) {
                    Some(victim) => {
                        state.neighbors.remove(&victim.id());
                        let handle = self.inner.handle_for(&request.sender);
                        state.neighbors.add(handle.clone());
                        let response = HandshakeResponse {
                            request_id,
                            accepted: true,
                            interleave_target: Some(victim.descriptor().clone()),
                        };
                        (response, Some(handle), Some(victim), true)
                    }
                    None => (HandshakeResponse::refused(request_id), None, None, false),
                }
            } else {
                (HandshakeResponse::refused(request_id), None, None, false)
            }
        };

        if let Some(handle) = &added {
            self.inner
                .locker
                .lock(handle.descriptor(), &self.inner.config.partition);
            debug!(peer = %handle.id(), interleaved = evicted.is_some(), "accepted handshake");
            self.propagation.on_neighbor_added(handle).await;
        }

        if let Some(victim) = &evicted {
            self.inner
                .locker
                .unlock(victim.descriptor(), &self.inner.config.partition);
            debug!(peer = %victim.id(), "evicted furthest neighbor");
            if notify_evicted {
                let notice = InterleaveNotice {
                    sender_id: self.inner.local_id,
                    partition: self.inner.config.partition.clone(),
                    interleave_target: request.sender.clone(),
                };
                if let Err(error) = victim.rpc().interleave_notice(notice).await {
                    debug!(peer = %victim.id(), %error, "interleave notice undeliverable");
                }
            }
        }

        response
    }

    /// React to being evicted elsewhere: drop the evictor and reconnect to
    /// the recommended target, which must accept unconditionally.
    pub async fn handle_interleave_notice(&self, notice: InterleaveNotice) {
        let evictor = {
            let mut state = self.inner.state.write().await;
            if !state.is_running() {
                return;
            }
            state.reported_neighbors.remove(&notice.sender_id);
            state.neighbors.remove(&notice.sender_id)
        };
        if let Some(evictor) = &evictor {
            self.inner
                .locker
                .unlock(evictor.descriptor(), &self.inner.config.partition);
        }

        let target_id = notice.interleave_target.peer_id();
        if target_id == self.inner.local_id {
            return;
        }
        {
            let state = self.inner.state.read().await;
            if state.neighbors.contains(&target_id) {
                return;
            }
        }
        let handle = self.inner.handle_for(&notice.interleave_target);
        if !self
            .attempt_handshake(&handle, Some(notice.sender_id))
            .await
        {
            debug!(peer = %target_id, "interleave reconnect refused");
        }
    }
}
