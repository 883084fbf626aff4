//! Configuration for one overlay node.

use std::time::Duration;

use freshet_proto::StreamPartitionId;

/// Configuration for an [`OverlayNode`](crate::OverlayNode).
///
/// All defaults are resolved here, at construction time; no component
/// re-derives a default. [`normalized`](OverlayConfig::normalized) clamps
/// the dependent fields so that `min_propagation_targets ≤ N` and
/// `handshake_slack ≤ N` always hold.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Partition this node participates in.
    pub partition: StreamPartitionId,

    /// Target neighbor degree N.
    pub target_neighbor_count: usize,

    /// Capacity of the nearby and random contact pools.
    pub max_contact_pool_size: usize,

    /// Minimum successful fan-out K per message before the propagation
    /// buffer stops caring about it.
    pub min_propagation_targets: usize,

    /// Slack below N at which a requester counts as "worse off" and may
    /// displace an existing neighbor (the interleave move). A requester
    /// reporting fewer than `N - handshake_slack` neighbors qualifies.
    pub handshake_slack: usize,

    /// Interval between neighbor-update exchanges.
    pub neighbor_update_interval: Duration,

    /// Delay before a freshly started neighbor-finder session's first round.
    pub handshake_initial_delay: Duration,

    /// Interval between neighbor-finder rounds; doubles as the retry/timeout
    /// mechanism for handshakes that never complete.
    pub handshake_retry_interval: Duration,

    /// How long an under-delivered message stays buffered waiting for new
    /// neighbors.
    pub propagation_buffer_ttl: Duration,

    /// Maximum number of buffered under-delivered messages.
    pub propagation_buffer_size: usize,

    /// Maximum number of message chains tracked for duplicate detection.
    pub max_message_chains: usize,
}

impl OverlayConfig {
    /// Create a config for the given partition with default settings.
    pub fn new(partition: StreamPartitionId) -> Self {
        Self {
            partition,
            target_neighbor_count: 4,
            max_contact_pool_size: 20,
            min_propagation_targets: 2,
            handshake_slack: 2,
            neighbor_update_interval: Duration::from_secs(10),
            handshake_initial_delay: Duration::from_millis(250),
            handshake_retry_interval: Duration::from_secs(1),
            propagation_buffer_ttl: Duration::from_secs(30),
            propagation_buffer_size: 256,
            max_message_chains: 1024,
        }
    }

    /// Set the target neighbor degree.
    #[must_use]
    pub fn with_target_neighbor_count(mut self, count: usize) -> Self {
        self.target_neighbor_count = count;
        self
    }

    /// Set the contact pool capacity.
    #[must_use]
    pub fn with_max_contact_pool_size(mut self, size: usize) -> Self {
        self.max_contact_pool_size = size;
        self
    }

    /// Set the minimum propagation fan-out.
    #[must_use]
    pub fn with_min_propagation_targets(mut self, targets: usize) -> Self {
        self.min_propagation_targets = targets;
        self
    }

    /// Set the interleave qualification slack.
    #[must_use]
    pub fn with_handshake_slack(mut self, slack: usize) -> Self {
        self.handshake_slack = slack;
        self
    }

    /// Set the neighbor-update exchange interval.
    #[must_use]
    pub fn with_neighbor_update_interval(mut self, interval: Duration) -> Self {
        self.neighbor_update_interval = interval;
        self
    }

    /// Set the neighbor-finder initial delay.
    #[must_use]
    pub fn with_handshake_initial_delay(mut self, delay: Duration) -> Self {
        self.handshake_initial_delay = delay;
        self
    }

    /// Set the neighbor-finder retry interval.
    #[must_use]
    pub fn with_handshake_retry_interval(mut self, interval: Duration) -> Self {
        self.handshake_retry_interval = interval;
        self
    }

    /// Resolve dependent fields against the configured degree.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.min_propagation_targets = self.min_propagation_targets.min(self.target_neighbor_count);
        self.handshake_slack = self.handshake_slack.min(self.target_neighbor_count);
        self
    }

    /// Neighbor count below which a handshake requester qualifies for the
    /// interleave repair move.
    pub fn interleave_threshold(&self) -> usize {
        self.target_neighbor_count
            .saturating_sub(self.handshake_slack)
    }
}
