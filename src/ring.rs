//! Consistent hashing over the cluster keyspace.
//!
//! Each node contributes `replicas` anchor points to a hash ring; a key is
//! owned by the node whose first anchor sits clockwise of the key's hash.
//! Anchors are derived deterministically from `decimal(i) || node_id`, so a
//! node's anchors can be removed symmetrically when it leaves.

use crc::{Crc, CRC_32_ISO_HDLC};
use std::collections::HashMap;
use std::sync::Arc;

/// Hash function mapping bytes to a ring position.
pub type HashFn = Arc<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Anchors each node contributes to the ring by default.
pub const DEFAULT_REPLICAS: usize = 50;

const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A consistent hash ring mapping keys to node addresses.
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    /// Sorted anchor positions. Hash collisions between nodes leave
    /// duplicates here; they are removed symmetrically on `remove`.
    anchors: Vec<u32>,
    /// Anchor position -> owning node. The most recent `add` wins a
    /// collision.
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Create an empty ring with CRC32-IEEE hashing and
    /// [`DEFAULT_REPLICAS`] anchors per node.
    pub fn new() -> Self {
        Self {
            hash: Arc::new(|data| CRC32_IEEE.checksum(data)),
            replicas: DEFAULT_REPLICAS,
            anchors: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Override the number of anchors per node.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }

    /// Override the ring hash function.
    pub fn with_hash_fn(mut self, hash: impl Fn(&[u8]) -> u32 + Send + Sync + 'static) -> Self {
        self.hash = Arc::new(hash);
        self
    }

    fn anchor_hash(&self, replica: usize, node: &str) -> u32 {
        (self.hash)(format!("{replica}{node}").as_bytes())
    }

    /// Add nodes to the ring, each contributing `replicas` anchors.
    pub fn add<S: Into<String>>(&mut self, nodes: impl IntoIterator<Item = S>) {
        for node in nodes {
            let node = node.into();
            for i in 0..self.replicas {
                let h = self.anchor_hash(i, &node);
                self.anchors.push(h);
                self.owners.insert(h, node.clone());
            }
        }
        self.anchors.sort_unstable();
    }

    /// Remove a node and exactly its `replicas` anchors.
    pub fn remove(&mut self, node: &str) {
        for i in 0..self.replicas {
            let h = self.anchor_hash(i, node);
            if let Ok(idx) = self.anchors.binary_search(&h) {
                self.anchors.remove(idx);
            }
            self.owners.remove(&h);
        }
    }

    /// Owner of `key`: the node at the first anchor clockwise of the key's
    /// hash, wrapping to the first anchor. `None` when the ring is empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.anchors.is_empty() {
            return None;
        }
        let h = (self.hash)(key.as_bytes());
        let idx = self.anchors.partition_point(|&a| a < h) % self.anchors.len();
        self.owners.get(&self.anchors[idx]).map(String::as_str)
    }

    /// Whether the ring has no anchors.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("replicas", &self.replicas)
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ring whose hash is the decimal value of its input, which makes
    /// anchor placement fully predictable.
    fn numeric_ring() -> HashRing {
        HashRing::new()
            .with_replicas(3)
            .with_hash_fn(|data| std::str::from_utf8(data).unwrap().parse().unwrap())
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::new();
        assert!(ring.is_empty());
        assert_eq!(ring.get("key"), None);
    }

    #[test]
    fn test_ownership_and_wrap() {
        let mut ring = numeric_ring();
        // Anchors: 2, 4, 6, 12, 14, 16, 22, 24, 26.
        ring.add(["6", "4", "2"]);

        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));
        // 27 is past the last anchor and wraps to the first.
        assert_eq!(ring.get("27"), Some("2"));
    }

    #[test]
    fn test_add_shifts_ownership() {
        let mut ring = numeric_ring();
        ring.add(["6", "4", "2"]);
        assert_eq!(ring.get("27"), Some("2"));

        // New anchors 8, 18, 28; 27 now lands on 28.
        ring.add(["8"]);
        assert_eq!(ring.get("27"), Some("8"));
    }

    #[test]
    fn test_remove_deletes_all_anchors() {
        let mut ring = numeric_ring();
        ring.add(["6", "4", "2"]);
        ring.remove("2");

        assert_eq!(ring.get("2"), Some("4"));
        assert_eq!(ring.get("27"), Some("4"));
        for key in ["1", "5", "13", "25"] {
            assert_ne!(ring.get(key), Some("2"));
        }
    }

    #[test]
    fn test_remove_keeps_anchors_sorted() {
        let mut ring = numeric_ring();
        ring.add(["6", "4", "2"]);
        ring.remove("4");
        assert!(ring.anchors.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(ring.anchors.len(), 6);
    }

    #[test]
    fn test_remove_last_node_empties_ring() {
        let mut ring = numeric_ring();
        ring.add(["2"]);
        ring.remove("2");
        assert!(ring.is_empty());
        assert_eq!(ring.get("2"), None);
    }

    #[test]
    fn test_default_replica_count() {
        let mut ring = HashRing::new();
        ring.add(["10.0.0.1:9000"]);
        assert_eq!(ring.anchors.len(), DEFAULT_REPLICAS);
    }

    #[test]
    fn test_crc32_lookup_is_stable() {
        let mut ring = HashRing::new();
        ring.add(["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]);
        let owner = ring.get("user:42").map(str::to_string);
        assert!(owner.is_some());
        // Same key, same owner, across repeated lookups.
        for _ in 0..10 {
            assert_eq!(ring.get("user:42"), owner.as_deref());
        }
    }
}
