//! An incremental Merkle-Patricia commitment tree.
//!
//! Keys are fixed-width [`KeyHash`]es (the Sha256 of an entry's identifying
//! key) and values are [`ValueHash`]es (the Sha256 of the serialized entry),
//! so the tree is always 64 nibbles deep and two distinct keys diverge before
//! either path ends. The tree is a compressed hexary radix structure; its
//! [`root`](PatriciaTree::root) is a pure function of the committed key/value
//! set, independent of update order, and a single update touches only the
//! nodes along one path.
//!
//! Nodes are content-addressed and immutable once written: an update writes
//! the replacement nodes into the [`NodeStore`] and re-points the root, which
//! keeps earlier roots provable and makes speculative root computation (apply,
//! read the root, reset) safe. A store lookup whose bytes do not hash back to
//! the requested address is a fatal [`TreeError::HashMismatch`]; it indicates
//! a storage bug, never a retryable condition.

#![deny(missing_docs)]

mod error;
mod hash;
mod node;
mod proof;
mod store;
mod tree;

pub use error::TreeError;
pub use hash::{KeyHash, NodeHash, RootHash, ValueHash};
pub use node::Node;
pub use proof::{MerkleProof, ProofError};
pub use store::{MemoryNodeStore, NodeStore};
pub use tree::PatriciaTree;
