use std::collections::HashMap;

use crate::error::TreeError;
use crate::hash::NodeHash;

/// Backing storage for encoded tree nodes, addressed by content hash.
///
/// Stores are append-only from the tree's point of view: a node, once
/// written, must keep resolving to the same bytes for as long as any retained
/// root can reach it. A store may garbage-collect nodes unreachable from
/// every retained root.
pub trait NodeStore {
    /// Fetches the encoded node stored under `hash`.
    fn get(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, TreeError>;

    /// Stores `bytes` under `hash`.
    fn put(&mut self, hash: NodeHash, bytes: Vec<u8>) -> Result<(), TreeError>;
}

/// An in-memory node store. Keeps every node ever written.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: HashMap<NodeHash, Vec<u8>>,
}

impl MemoryNodeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes held.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the store holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, TreeError> {
        Ok(self.nodes.get(hash).cloned())
    }

    fn put(&mut self, hash: NodeHash, bytes: Vec<u8>) -> Result<(), TreeError> {
        self.nodes.insert(hash, bytes);
        Ok(())
    }
}
