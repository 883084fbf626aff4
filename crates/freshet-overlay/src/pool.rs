//! Capacity-bounded, keyed collections of peer handles.

use std::collections::HashMap;

use freshet_proto::{PeerDescriptor, PeerId};
use rand::seq::SliceRandom;

use crate::rpc::PeerHandle;

/// A bounded collection of [`PeerHandle`]s keyed by peer id.
///
/// One overlay node uses three of these: the nearby-contact pool, the
/// random-contact pool and the target-neighbor set. The pool keeps the
/// order handles were inserted in; the contact pools are populated already
/// sorted by discovery-layer proximity, so "closest" is the front of that
/// order and "furthest" the back. No distance metric is computed here.
///
/// Invariants: `len() ≤ limit`, the local id is never a member, and no id
/// appears twice.
#[derive(Debug)]
pub struct PeerPool {
    local_id: PeerId,
    limit: usize,
    order: Vec<PeerId>,
    handles: HashMap<PeerId, PeerHandle>,
}

impl PeerPool {
    /// Create an empty pool.
    pub fn new(local_id: PeerId, limit: usize) -> Self {
        Self {
            local_id,
            limit,
            order: Vec::new(),
            handles: HashMap::new(),
        }
    }

    /// Insert a handle.
    ///
    /// No-op (returning `false`) when the handle is the local node, the pool
    /// is full, or the id is already present. Returns `true` on the first
    /// insertion of an id; callers react to that instead of listening for a
    /// "peer added" event.
    pub fn add(&mut self, handle: PeerHandle) -> bool {
        let id = handle.id();
        if id == self.local_id || self.handles.len() >= self.limit || self.handles.contains_key(&id)
        {
            return false;
        }
        self.order.push(id);
        self.handles.insert(id, handle);
        true
    }

    /// Remove by id. Idempotent; returns the handle if it was present.
    pub fn remove(&mut self, id: &PeerId) -> Option<PeerHandle> {
        let removed = self.handles.remove(id);
        if removed.is_some() {
            self.order.retain(|member| member != id);
        }
        removed
    }

    /// Remove by descriptor. Idempotent.
    pub fn remove_by_descriptor(&mut self, descriptor: &PeerDescriptor) -> Option<PeerHandle> {
        self.remove(&descriptor.peer_id())
    }

    /// Membership test.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.handles.contains_key(id)
    }

    /// Get a member's handle.
    pub fn get(&self, id: &PeerId) -> Option<&PeerHandle> {
        self.handles.get(id)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Whether the pool has reached its capacity.
    pub fn is_full(&self) -> bool {
        self.handles.len() >= self.limit
    }

    /// Number of members not in the exclusion set.
    pub fn len_excluding(&self, exclude: &[PeerId]) -> usize {
        self.order
            .iter()
            .filter(|&id| !exclude.contains(id))
            .count()
    }

    /// A uniformly random non-excluded member.
    pub fn sample_random(&self, exclude: &[PeerId]) -> Option<PeerHandle> {
        let eligible: Vec<&PeerId> = self
            .order
            .iter()
            .filter(|&id| !exclude.contains(id))
            .collect();
        let id = eligible.choose(&mut rand::thread_rng())?;
        self.handles.get(*id).cloned()
    }

    /// The first non-excluded member in pool order.
    pub fn closest(&self, exclude: &[PeerId]) -> Option<PeerHandle> {
        self.order
            .iter()
            .find(|&id| !exclude.contains(id))
            .and_then(|id| self.handles.get(id))
            .cloned()
    }

    /// The last non-excluded member in pool order.
    pub fn furthest(&self, exclude: &[PeerId]) -> Option<PeerHandle> {
        self.order
            .iter()
            .rev()
            .find(|&id| !exclude.contains(id))
            .and_then(|id| self.handles.get(id))
            .cloned()
    }

    /// Both ends of the non-excluded pool order, deduplicated.
    ///
    /// Yields one handle when only one member is eligible.
    pub fn closest_and_furthest(&self, exclude: &[PeerId]) -> Vec<PeerHandle> {
        let mut picks = Vec::with_capacity(2);
        if let Some(closest) = self.closest(exclude) {
            picks.push(closest);
        }
        if let Some(furthest) = self.furthest(exclude) {
            if picks.iter().all(|handle| handle.id() != furthest.id()) {
                picks.push(furthest);
            }
        }
        picks
    }

    /// Clear and re-insert up to `limit` handles, preserving `add` semantics.
    pub fn replace_all(&mut self, handles: Vec<PeerHandle>) {
        self.clear();
        for handle in handles {
            self.add(handle);
        }
    }

    /// Empty the pool without notifying anyone.
    pub fn clear(&mut self) {
        self.order.clear();
        self.handles.clear();
    }

    /// Member ids in pool order.
    pub fn ids(&self) -> Vec<PeerId> {
        self.order.clone()
    }

    /// Member handles in pool order.
    pub fn handles(&self) -> Vec<PeerHandle> {
        self.order
            .iter()
            .filter_map(|id| self.handles.get(id))
            .cloned()
            .collect()
    }

    /// Member descriptors in pool order.
    pub fn descriptors(&self) -> Vec<PeerDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.handles.get(id))
            .map(|handle| handle.descriptor().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{local_id, stub_handle};
    use proptest::prelude::*;

    fn pool(limit: usize) -> PeerPool {
        PeerPool::new(local_id(), limit)
    }

    #[test]
    fn add_reports_first_insertion_only() {
        let mut pool = pool(4);
        let handle = stub_handle("a");
        assert!(pool.add(handle.clone()));
        assert!(!pool.add(handle));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn add_rejects_local_node() {
        let mut pool = pool(4);
        assert!(!pool.add(stub_handle("local")));
        assert!(pool.is_empty());
    }

    #[test]
    fn add_respects_capacity() {
        let mut pool = pool(2);
        assert!(pool.add(stub_handle("a")));
        assert!(pool.add(stub_handle("b")));
        assert!(!pool.add(stub_handle("c")));
        assert_eq!(pool.len(), 2);
        assert!(pool.is_full());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut pool = pool(4);
        let handle = stub_handle("a");
        let id = handle.id();
        pool.add(handle);
        assert!(pool.remove(&id).is_some());
        assert!(pool.remove(&id).is_none());
        assert!(!pool.contains(&id));
    }

    #[test]
    fn selection_honors_pool_order_and_exclusions() {
        let mut pool = pool(4);
        let (a, b, c) = (stub_handle("a"), stub_handle("b"), stub_handle("c"));
        pool.add(a.clone());
        pool.add(b.clone());
        pool.add(c.clone());

        assert_eq!(pool.closest(&[]).unwrap().id(), a.id());
        assert_eq!(pool.furthest(&[]).unwrap().id(), c.id());
        assert_eq!(pool.closest(&[a.id()]).unwrap().id(), b.id());
        assert_eq!(pool.furthest(&[c.id()]).unwrap().id(), b.id());
        assert_eq!(pool.len_excluding(&[a.id(), c.id()]), 1);

        let ends = pool.closest_and_furthest(&[]);
        assert_eq!(ends.len(), 2);
        assert_eq!(ends[0].id(), a.id());
        assert_eq!(ends[1].id(), c.id());

        let lone = pool.closest_and_furthest(&[a.id(), b.id()]);
        assert_eq!(lone.len(), 1);
        assert_eq!(lone[0].id(), c.id());
    }

    #[test]
    fn sample_random_skips_excluded() {
        let mut pool = pool(4);
        let (a, b) = (stub_handle("a"), stub_handle("b"));
        pool.add(a.clone());
        pool.add(b.clone());
        for _ in 0..20 {
            let picked = pool.sample_random(&[a.id()]).unwrap();
            assert_eq!(picked.id(), b.id());
        }
        assert!(pool.sample_random(&[a.id(), b.id()]).is_none());
    }

    #[test]
    fn replace_all_resets_contents_up_to_limit() {
        let mut pool = pool(2);
        pool.add(stub_handle("a"));
        pool.replace_all(vec![stub_handle("b"), stub_handle("c"), stub_handle("d")]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&stub_handle("a").id()));
        assert_eq!(pool.ids(), vec![stub_handle("b").id(), stub_handle("c").id()]);
    }

    #[test]
    fn clear_empties_silently() {
        let mut pool = pool(4);
        pool.add(stub_handle("a"));
        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.ids().is_empty());
    }

    proptest! {
        #[test]
        fn bound_and_uniqueness_hold_under_arbitrary_inserts(
            names in proptest::collection::vec(0u8..20, 0..40),
            limit in 1usize..6,
        ) {
            let mut pool = PeerPool::new(local_id(), limit);
            for name in names {
                pool.add(stub_handle(&format!("peer-{name}")));
            }
            prop_assert!(pool.len() <= limit);
            let ids = pool.ids();
            let mut deduped = ids.clone();
            deduped.sort();
            deduped.dedup();
            prop_assert_eq!(ids.len(), deduped.len());
            prop_assert!(!pool.contains(&local_id()));
        }
    }
}
