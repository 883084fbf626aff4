//! Duplicate suppression for flooded messages.

use std::collections::{HashMap, VecDeque};

use freshet_proto::{MessageRef, PeerId};
use tracing::trace;

/// Tracks the highest [`MessageRef`] seen per message chain to decide
/// whether a message is new.
///
/// A chain is keyed by its publisher. Flooding terminates because every
/// node forwards a given `(previous_ref, ref)` pair at most once; a gap
/// between the recorded high-water mark and a message's `previous_ref` does
/// not reject the message, since ordering within a chain is the publisher's
/// concern, not the overlay's.
///
/// Chains are evicted oldest-first beyond `max_chains` to bound memory.
#[derive(Debug)]
pub struct DuplicateDetector {
    max_chains: usize,
    chains: HashMap<PeerId, MessageRef>,
    chain_order: VecDeque<PeerId>,
    seen: u64,
    dropped: u64,
}

impl DuplicateDetector {
    /// Create a detector tracking at most `max_chains` chains.
    pub fn new(max_chains: usize) -> Self {
        Self {
            max_chains: max_chains.max(1),
            chains: HashMap::new(),
            chain_order: VecDeque::new(),
            seen: 0,
            dropped: 0,
        }
    }

    /// Record `current` for the publisher's chain and report whether it was
    /// new.
    ///
    /// Returns `true` (and advances the high-water mark) when the chain is
    /// unknown or `current` is greater than the recorded mark; `false` for
    /// anything at or below the mark. The second call with the same pair is
    /// always a no-op returning `false`.
    pub fn mark_and_check(
        &mut self,
        publisher: PeerId,
        previous: Option<MessageRef>,
        current: MessageRef,
    ) -> bool {
        self.seen += 1;

        match self.chains.get_mut(&publisher) {
            Some(latest) => {
                if current > *latest {
                    if let Some(previous) = previous {
                        if previous > *latest {
                            trace!(%publisher, %previous, mark = %latest, "gap in message chain");
                        }
                    }
                    *latest = current;
                    true
                } else {
                    self.dropped += 1;
                    false
                }
            }
            None => {
                if self.chains.len() >= self.max_chains {
                    if let Some(oldest) = self.chain_order.pop_front() {
                        self.chains.remove(&oldest);
                    }
                }
                self.chains.insert(publisher, current);
                self.chain_order.push_back(publisher);
                true
            }
        }
    }

    /// Number of chains currently tracked.
    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Total messages checked.
    pub fn messages_seen(&self) -> u64 {
        self.seen
    }

    /// Messages absorbed as duplicates.
    pub fn duplicates_dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget everything (used on stop).
    pub fn clear(&mut self) {
        self.chains.clear();
        self.chain_order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn publisher(name: &str) -> PeerId {
        PeerId::from_identity_key(name.as_bytes())
    }

    #[test]
    fn first_message_of_a_chain_is_new() {
        let mut detector = DuplicateDetector::new(8);
        assert!(detector.mark_and_check(publisher("p"), None, MessageRef::new(1, 0)));
    }

    #[test]
    fn same_pair_twice_is_a_noop() {
        let mut detector = DuplicateDetector::new(8);
        let current = MessageRef::new(5, 1);
        let previous = Some(MessageRef::new(5, 0));
        assert!(detector.mark_and_check(publisher("p"), previous, current));
        assert!(!detector.mark_and_check(publisher("p"), previous, current));
        assert_eq!(detector.duplicates_dropped(), 1);
    }

    #[test]
    fn older_message_is_a_duplicate() {
        let mut detector = DuplicateDetector::new(8);
        detector.mark_and_check(publisher("p"), None, MessageRef::new(10, 0));
        assert!(!detector.mark_and_check(publisher("p"), None, MessageRef::new(9, 5)));
    }

    #[test]
    fn gap_does_not_reject() {
        let mut detector = DuplicateDetector::new(8);
        detector.mark_and_check(publisher("p"), None, MessageRef::new(1, 0));
        // previous_ref (5,0) was never seen, yet (6,0) must still pass
        assert!(detector.mark_and_check(
            publisher("p"),
            Some(MessageRef::new(5, 0)),
            MessageRef::new(6, 0),
        ));
    }

    #[test]
    fn chains_are_independent() {
        let mut detector = DuplicateDetector::new(8);
        detector.mark_and_check(publisher("a"), None, MessageRef::new(10, 0));
        assert!(detector.mark_and_check(publisher("b"), None, MessageRef::new(1, 0)));
        assert_eq!(detector.chain_count(), 2);
    }

    #[test]
    fn oldest_chain_is_evicted_at_capacity() {
        let mut detector = DuplicateDetector::new(2);
        detector.mark_and_check(publisher("a"), None, MessageRef::new(1, 0));
        detector.mark_and_check(publisher("b"), None, MessageRef::new(1, 0));
        detector.mark_and_check(publisher("c"), None, MessageRef::new(1, 0));
        assert_eq!(detector.chain_count(), 2);
        // chain "a" was forgotten, so its old message reads as new again
        assert!(detector.mark_and_check(publisher("a"), None, MessageRef::new(1, 0)));
    }

    proptest! {
        #[test]
        fn accepted_refs_are_strictly_increasing(
            refs in proptest::collection::vec((0u64..50, 0u32..4), 1..60),
        ) {
            let mut detector = DuplicateDetector::new(8);
            let mut accepted = Vec::new();
            for (ts, seq) in refs {
                let current = MessageRef::new(ts, seq);
                if detector.mark_and_check(publisher("p"), None, current) {
                    accepted.push(current);
                }
            }
            prop_assert!(accepted.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
