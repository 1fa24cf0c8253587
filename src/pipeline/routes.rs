//! Named routes: stable names pointing at a deployed digest.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::Digest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub route: String,
    pub digest: Digest,
}

/// Route → digest table.
///
/// NOT a separate actor - owned by the coordinator core and called via &mut self.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Digest>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point `route` at `digest`, returning the digest it pointed at before.
    pub fn assign(&mut self, route: impl Into<String>, digest: Digest) -> Option<Digest> {
        self.routes.insert(route.into(), digest)
    }

    pub fn remove(&mut self, route: &str) -> Option<Digest> {
        self.routes.remove(route)
    }

    pub fn get(&self, route: &str) -> Option<&Digest> {
        self.routes.get(route)
    }

    pub fn list(&self) -> Vec<RouteEntry> {
        self.routes
            .iter()
            .map(|(route, digest)| RouteEntry {
                route: route.clone(),
                digest: digest.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_replace_remove() {
        let d1 = Digest::from_string("d1").unwrap();
        let d2 = Digest::from_string("d2").unwrap();
        let mut table = RouteTable::new();

        assert_eq!(table.assign("/hello", d1.clone()), None);
        assert_eq!(table.assign("/hello", d2.clone()), Some(d1));
        assert_eq!(table.get("/hello"), Some(&d2));
        assert_eq!(
            table.list(),
            vec![RouteEntry {
                route: "/hello".to_string(),
                digest: d2.clone()
            }]
        );
        assert_eq!(table.remove("/hello"), Some(d2));
        assert!(table.is_empty());
    }
}
