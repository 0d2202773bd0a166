use crate::hash::{KeyHash, NodeHash};

/// Failures of tree operations.
///
/// Apart from [`TreeError::UnknownKey`], every variant signals a broken node
/// store or a corrupted tree. Continuing after one of those risks committing
/// to a divergent root, so callers must treat them as fatal.
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// A referenced node is absent from the node store.
    #[error("node {0} is missing from the node store")]
    MissingNode(NodeHash),
    /// A stored node's bytes do not hash back to its address.
    #[error("node bytes stored under {expected} hash to {actual}")]
    HashMismatch {
        /// The address the node was requested under.
        expected: NodeHash,
        /// What the stored bytes actually hash to.
        actual: NodeHash,
    },
    /// A stored node's bytes do not decode to a valid node.
    #[error("node {0} is malformed and cannot be decoded")]
    CorruptNode(NodeHash),
    /// The key is not present in the tree.
    #[error("key {0} is not in the tree")]
    UnknownKey(KeyHash),
    /// The backing node store failed.
    #[error("node store failure: {0}")]
    Store(String),
}
