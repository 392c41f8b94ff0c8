use super::membership::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Highest write version observed per originating node. Component-wise
/// monotonic: no operation ever lowers a component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionVector {
    versions: HashMap<NodeId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        VersionVector {
            versions: HashMap::new(),
        }
    }

    pub fn get(&self, node_id: &NodeId) -> u64 {
        self.versions.get(node_id).copied().unwrap_or(0)
    }

    /// Advance the component for `node_id` and return the new version.
    pub fn advance(&mut self, node_id: &NodeId) -> u64 {
        let counter = self.versions.entry(node_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Record that `version` from `node_id` has been seen.
    pub fn observe(&mut self, node_id: &NodeId, version: u64) {
        let counter = self.versions.entry(node_id.clone()).or_insert(0);
        *counter = (*counter).max(version);
    }

    pub fn merge(&mut self, other: &VersionVector) {
        for (node_id, &version) in &other.versions {
            self.observe(node_id, version);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, u64)> {
        self.versions.iter().map(|(k, &v)| (k, v))
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_sequential() {
        let mut vv = VersionVector::new();
        let a = NodeId::from("a");
        assert_eq!(vv.advance(&a), 1);
        assert_eq!(vv.advance(&a), 2);
        assert_eq!(vv.get(&a), 2);
    }

    #[test]
    fn test_observe_never_decreases() {
        let mut vv = VersionVector::new();
        let a = NodeId::from("a");
        vv.observe(&a, 5);
        vv.observe(&a, 3);
        assert_eq!(vv.get(&a), 5);
    }

    #[test]
    fn test_merge_takes_component_max() {
        let mut left = VersionVector::new();
        let mut right = VersionVector::new();
        left.observe(&NodeId::from("a"), 4);
        right.observe(&NodeId::from("a"), 2);
        right.observe(&NodeId::from("b"), 7);
        left.merge(&right);
        assert_eq!(left.get(&NodeId::from("a")), 4);
        assert_eq!(left.get(&NodeId::from("b")), 7);
    }
}
