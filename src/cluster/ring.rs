//! Consistent-hash placement ring.
//!
//! Each member owns `replicas` virtual points on a 64-bit circle. A key is owned
//! by the member holding the first point at or after the key's hash (wrapping).
//! Adding or removing one member only moves the keys that fall in the spans its
//! points cover, so churn remaps roughly 1/N of the key space.

use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::NodeId;

/// Hash ring mapping keys to exactly one member.
#[derive(Debug, Clone)]
pub struct PlacementRing {
    replicas: usize,
    points: BTreeMap<u64, NodeId>,
    members: BTreeSet<NodeId>,
}

impl PlacementRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: BTreeMap::new(),
            members: BTreeSet::new(),
        }
    }

    /// Add a member. Adding an existing member is a no-op.
    pub fn add(&mut self, node: &NodeId) -> bool {
        if !self.members.insert(node.clone()) {
            return false;
        }
        for replica in 0..self.replicas {
            // On the (astronomically rare) point collision the earlier holder keeps it.
            self.points
                .entry(point_hash(node, replica))
                .or_insert_with(|| node.clone());
        }
        true
    }

    /// Remove a member. Returns whether it was present.
    pub fn delete(&mut self, node: &NodeId) -> bool {
        if !self.members.remove(node) {
            return false;
        }
        for replica in 0..self.replicas {
            let point = point_hash(node, replica);
            if self.points.get(&point) == Some(node) {
                self.points.remove(&point);
            }
        }
        true
    }

    /// Owner of `key`, or `None` when the ring is empty.
    pub fn get(&self, key: &str) -> Option<&NodeId> {
        let hash = key_hash(key.as_bytes());
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, node)| node)
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.members.contains(node)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &NodeId> {
        self.members.iter()
    }
}

fn point_hash(node: &NodeId, replica: usize) -> u64 {
    key_hash(format!("{}-{}", node, replica).as_bytes())
}

fn key_hash(bytes: &[u8]) -> u64 {
    let hash = Sha256::digest(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash[..8]);
    u64::from_be_bytes(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn node(name: &str) -> NodeId {
        NodeId::from_string(name).unwrap()
    }

    fn owners(ring: &PlacementRing, keys: &[String]) -> HashMap<String, NodeId> {
        keys.iter()
            .map(|k| (k.clone(), ring.get(k).unwrap().clone()))
            .collect()
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("digest-{}", i)).collect()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = PlacementRing::new(16);
        assert!(ring.is_empty());
        assert!(ring.get("x").is_none());
    }

    #[test]
    fn test_single_member_owns_everything() {
        let mut ring = PlacementRing::new(16);
        ring.add(&node("test"));
        assert_eq!(ring.get("x"), Some(&node("test")));
        assert_eq!(ring.get("y"), Some(&node("test")));
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut ring = PlacementRing::new(16);
        assert!(ring.add(&node("t1")));
        assert!(!ring.add(&node("t1")));
        assert_eq!(ring.len(), 1);
        assert!(ring.delete(&node("t1")));
        assert!(!ring.delete(&node("t1")));
        assert!(ring.get("x").is_none());
    }

    #[test]
    fn test_lookup_is_deterministic_and_spread() {
        let mut ring = PlacementRing::new(160);
        for name in ["t1", "t2", "t3", "t4", "t5"] {
            ring.add(&node(name));
        }
        let keys = keys(1000);
        let first = owners(&ring, &keys);
        assert_eq!(first, owners(&ring, &keys));

        let mut per_node: HashMap<NodeId, usize> = HashMap::new();
        for owner in first.values() {
            *per_node.entry(owner.clone()).or_default() += 1;
        }
        assert_eq!(per_node.len(), 5);
        for count in per_node.values() {
            assert!(*count > 100, "skewed placement: {:?}", per_node);
        }
    }

    #[test]
    fn test_removal_only_remaps_removed_members_keys() {
        let mut ring = PlacementRing::new(160);
        for name in ["t1", "t2", "t3", "t4", "t5"] {
            ring.add(&node(name));
        }
        let keys = keys(2000);
        let before = owners(&ring, &keys);

        ring.delete(&node("t3"));
        let after = owners(&ring, &keys);

        for key in &keys {
            if before[key] != node("t3") {
                assert_eq!(before[key], after[key], "key {} moved needlessly", key);
            } else {
                assert_ne!(after[key], node("t3"));
            }
        }
    }

    #[test]
    fn test_delete_falls_back_to_remaining() {
        let mut ring = PlacementRing::new(16);
        ring.add(&node("t1"));
        ring.add(&node("t2"));
        ring.add(&node("t3"));
        ring.delete(&node("t2"));
        ring.delete(&node("t3"));
        assert_eq!(ring.get("x"), Some(&node("t1")));
        assert_eq!(ring.members().count(), 1);
    }

    proptest! {
        #[test]
        fn prop_join_only_moves_keys_to_new_member(
            members in 1usize..8,
            key_count in 1usize..300,
        ) {
            let mut ring = PlacementRing::new(32);
            for i in 0..members {
                ring.add(&node(&format!("n{}", i)));
            }
            let keys = keys(key_count);
            let before = owners(&ring, &keys);

            let joiner = node("joiner");
            ring.add(&joiner);
            let after = owners(&ring, &keys);

            for key in &keys {
                prop_assert!(after[key] == before[key] || after[key] == joiner);
            }
        }
    }
}
