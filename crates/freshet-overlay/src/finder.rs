//! The self-rescheduling search loop that drives a node up to its target
//! degree.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use freshet_proto::PeerId;
use tracing::debug;

use crate::handshake::Handshaker;
use crate::node::NodeInner;

/// A neighbor-search session: not a thread, a cooperative loop.
///
/// While active, the session runs handshake rounds against the contact
/// pools at a fixed interval until the target degree is reached or no
/// eligible contacts remain, then goes idle. It is re-armed by contact and
/// leave events, never by busy-waiting. The retry interval doubles as the
/// timeout mechanism for handshakes that never complete: their candidates
/// simply stay un-excluded until the next round.
#[derive(Clone)]
pub(crate) struct NeighborFinder {
    inner: Arc<NodeInner>,
    handshaker: Handshaker,
    active: Arc<AtomicBool>,
}

impl NeighborFinder {
    pub fn new(inner: Arc<NodeInner>, handshaker: Handshaker) -> Self {
        Self {
            inner,
            handshaker,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin a search session excluding the given peers for its duration.
    ///
    /// No-op while a session is already running or after shutdown.
    pub fn start(&self, excluded: Vec<PeerId>) {
        if self.inner.is_shutdown() || self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let finder = self.clone();
        tokio::spawn(async move {
            finder.run(excluded).await;
            finder.active.store(false, Ordering::SeqCst);
        });
    }

    /// Mark the session idle; the loop observes the flag before its next
    /// round. In-flight handshakes are not aborted.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Whether a search session is currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn run(&self, mut excluded: Vec<PeerId>) {
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::select! {
            _ = tokio::time::sleep(self.inner.config.handshake_initial_delay) => {}
            _ = shutdown.changed() => return,
        }

        loop {
            if *shutdown.borrow() || !self.active.load(Ordering::SeqCst) {
                return;
            }

            excluded = self.handshaker.attempt_handshakes(excluded).await;

            let (degree, eligible) = {
                let state = self.inner.state.read().await;
                (state.neighbors.len(), state.eligible_contacts(&excluded))
            };
            if degree >= self.inner.config.target_neighbor_count || eligible == 0 {
                debug!(degree, eligible, "neighbor search going idle");
                self.active.store(false, Ordering::SeqCst);
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.handshake_retry_interval) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}
