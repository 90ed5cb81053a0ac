//! # Weighted Consistent-Hash Router
//!
//! Maps a routing key to the node that owns it.
//!
//! Each node contributes `weight * VNODES_PER_WEIGHT` positions to a 32-bit
//! ring. A key belongs to the first position strictly greater than its hash,
//! wrapping to the smallest position. Adding or removing a node only inserts
//! or deletes that node's own positions, so keys owned by other nodes keep
//! their owner.
//!
//! A ring with a single node skips hashing entirely.

use std::collections::HashMap;

use lkv_common::{LkvError, LkvResult};

/// Ring positions contributed by each unit of weight.
pub const VNODES_PER_WEIGHT: u32 = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    hash: u32,
    node: usize,
}

/// Sorted ring of virtual node positions.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    // Node ids by registration order; `None` marks a removed node.
    nodes: Vec<Option<String>>,
    index: HashMap<String, (usize, u32)>,
    positions: Vec<Position>,
}

impl HashRing {
    pub fn new() -> Self {
        HashRing::default()
    }

    /// Adds a node with `weight` units of the key space.
    pub fn add_node(&mut self, id: impl Into<String>, weight: u32) -> LkvResult<()> {
        let id = id.into();
        if weight == 0 {
            return Err(LkvError::Config(format!("{id}: weight must be positive")));
        }
        if self.index.contains_key(&id) {
            return Err(LkvError::Config(format!("{id}: node already routed")));
        }

        let slot = self.nodes.len();
        let count = weight.saturating_mul(VNODES_PER_WEIGHT);
        self.positions.reserve(count as usize);
        for vnode in 0..count {
            self.positions.push(Position {
                hash: vnode_hash(&id, vnode),
                node: slot,
            });
        }
        // Ties on hash are broken by node slot, keeping the order deterministic.
        self.positions.sort_unstable();

        self.nodes.push(Some(id.clone()));
        self.index.insert(id, (slot, weight));
        Ok(())
    }

    /// Removes a node and its positions. Returns false when unknown.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let (slot, _) = match self.index.remove(id) {
            Some(entry) => entry,
            None => return false,
        };
        self.nodes[slot] = None;
        self.positions.retain(|position| position.node != slot);
        true
    }

    /// Returns the node owning `key`, or `None` for an empty ring.
    pub fn route(&self, key: &[u8]) -> Option<&str> {
        if self.index.len() == 1 {
            return self.index.keys().next().map(String::as_str);
        }
        if self.positions.is_empty() {
            return None;
        }

        let owner = self.successor(key_hash(key))?;
        self.nodes[owner.node].as_deref()
    }

    /// First position strictly greater than `hash`, wrapping to the smallest.
    fn successor(&self, hash: u32) -> Option<&Position> {
        let idx = self.positions.partition_point(|position| position.hash <= hash);
        self.positions.get(idx).or_else(|| self.positions.first())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn weight(&self, id: &str) -> Option<u32> {
        self.index.get(id).map(|&(_, weight)| weight)
    }

    /// Routed node ids in registration order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| node.as_deref())
    }

    /// Number of routed nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of virtual positions on the ring.
    pub fn positions(&self) -> usize {
        self.positions.len()
    }
}

fn vnode_hash(id: &str, vnode: u32) -> u32 {
    key_hash(format!("{id}#{vnode}").as_bytes())
}

/// CRC-32 of `key`, passed through the murmur3 finalizer so that keys
/// differing in a few trailing bytes spread across the whole ring.
fn key_hash(key: &[u8]) -> u32 {
    let mut hash = crc32fast::hash(key);
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;
    hash
}
