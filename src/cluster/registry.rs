//! Deployed-source cache and per-node hosting confirmation.
//!
//! The cache holds every deployed digest's source so it can be replayed onto
//! whichever node owns it after ring churn. The hosting sets record which node
//! has acknowledged a deploy of which digest.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::cluster::ring::PlacementRing;
use crate::types::{Digest, NodeId};

/// Allocation bookkeeping.
///
/// NOT a separate actor - owned by the coordinator core and called via &mut self.
#[derive(Debug, Default)]
pub struct AllocationRegistry {
    sources: BTreeMap<Digest, Bytes>,
    hosting: HashMap<NodeId, HashSet<Digest>>,
}

impl AllocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache (or replace) a digest's source.
    pub fn cache(&mut self, digest: Digest, source: Bytes) {
        self.sources.insert(digest, source);
    }

    pub fn source(&self, digest: &Digest) -> Option<&Bytes> {
        self.sources.get(digest)
    }

    pub fn is_cached(&self, digest: &Digest) -> bool {
        self.sources.contains_key(digest)
    }

    /// Record that `node` acknowledged a deploy of `digest`.
    pub fn confirm(&mut self, node: &NodeId, digest: &Digest) {
        self.hosting
            .entry(node.clone())
            .or_default()
            .insert(digest.clone());
    }

    pub fn hosts(&self, node: &NodeId, digest: &Digest) -> bool {
        self.hosting
            .get(node)
            .is_some_and(|set| set.contains(digest))
    }

    pub fn hosted_count(&self, node: &NodeId) -> usize {
        self.hosting.get(node).map_or(0, HashSet::len)
    }

    /// Remove a digest from the cache and from every hosting set.
    pub fn evict(&mut self, digest: &Digest) -> bool {
        for set in self.hosting.values_mut() {
            set.remove(digest);
        }
        self.sources.remove(digest).is_some()
    }

    /// Forget everything a node hosted (it left the pool).
    pub fn forget_node(&mut self, node: &NodeId) {
        self.hosting.remove(node);
    }

    /// Cached allocations whose digest maps to `node` on `ring`.
    pub fn owned_by(&self, ring: &PlacementRing, node: &NodeId) -> Vec<(Digest, Bytes)> {
        self.sources
            .iter()
            .filter(|(digest, _)| ring.get(digest.as_str()) == Some(node))
            .map(|(digest, source)| (digest.clone(), source.clone()))
            .collect()
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.sources.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Drop the whole cache. Hosting confirmations go with it, since a flushed
    /// digest can no longer be considered allocated.
    pub fn flush(&mut self) {
        self.sources.clear();
        self.hosting.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(s: &str) -> Digest {
        Digest::from_string(s).unwrap()
    }

    fn node(s: &str) -> NodeId {
        NodeId::from_string(s).unwrap()
    }

    #[test]
    fn test_cache_and_confirm() {
        let mut reg = AllocationRegistry::new();
        reg.cache(digest("d1"), Bytes::from_static(b"src"));
        assert!(reg.is_cached(&digest("d1")));
        assert!(!reg.hosts(&node("n1"), &digest("d1")));

        reg.confirm(&node("n1"), &digest("d1"));
        assert!(reg.hosts(&node("n1"), &digest("d1")));
        assert_eq!(reg.hosted_count(&node("n1")), 1);
    }

    #[test]
    fn test_evict_clears_hosting() {
        let mut reg = AllocationRegistry::new();
        reg.cache(digest("d1"), Bytes::from_static(b"src"));
        reg.confirm(&node("n1"), &digest("d1"));
        reg.confirm(&node("n2"), &digest("d1"));

        assert!(reg.evict(&digest("d1")));
        assert!(!reg.is_cached(&digest("d1")));
        assert!(!reg.hosts(&node("n1"), &digest("d1")));
        assert!(!reg.hosts(&node("n2"), &digest("d1")));
        assert!(!reg.evict(&digest("d1")));
    }

    #[test]
    fn test_forget_node_keeps_cache() {
        let mut reg = AllocationRegistry::new();
        reg.cache(digest("d1"), Bytes::from_static(b"src"));
        reg.confirm(&node("n1"), &digest("d1"));
        reg.forget_node(&node("n1"));
        assert!(reg.is_cached(&digest("d1")));
        assert_eq!(reg.hosted_count(&node("n1")), 0);
    }

    #[test]
    fn test_owned_by_follows_ring() {
        let mut ring = PlacementRing::new(32);
        ring.add(&node("n1"));
        ring.add(&node("n2"));

        let mut reg = AllocationRegistry::new();
        for i in 0..50 {
            reg.cache(digest(&format!("d{}", i)), Bytes::from_static(b"src"));
        }

        let n1 = reg.owned_by(&ring, &node("n1"));
        let n2 = reg.owned_by(&ring, &node("n2"));
        assert_eq!(n1.len() + n2.len(), 50);
        for (d, _) in &n1 {
            assert_eq!(ring.get(d.as_str()), Some(&node("n1")));
        }
    }
}
