use borsh::BorshDeserialize;

use crate::error::TreeError;
use crate::hash::{KeyHash, NodeHash, RootHash, ValueHash};
use crate::node::{common_prefix, key_nibbles, Node};
use crate::proof::MerkleProof;
use crate::store::NodeStore;

/// A Merkle-Patricia tree bound to a node store.
///
/// The tree never mutates a stored node: `update` and `remove` write the
/// replacement nodes along the touched path and re-point the root. The root
/// can therefore be [`reset`](Self::reset_root) to any earlier root whose
/// nodes the store still holds, which is how speculative root computation and
/// commit-time publication are built on top.
pub struct PatriciaTree<S> {
    store: S,
    root: Option<NodeHash>,
}

impl<S: NodeStore> PatriciaTree<S> {
    /// Creates an empty tree over `store`.
    pub fn new(store: S) -> Self {
        Self { store, root: None }
    }

    /// Opens a tree at a previously committed `root`.
    ///
    /// Fails when the root node is absent from the store or fails its
    /// integrity check.
    pub fn with_root(store: S, root: RootHash) -> Result<Self, TreeError> {
        let mut tree = Self::new(store);
        tree.reset_root(root)?;
        Ok(tree)
    }

    /// The current root commitment. All-zero for the empty tree.
    pub fn root(&self) -> RootHash {
        self.root.map(RootHash::from).unwrap_or(RootHash::EMPTY)
    }

    /// Points the tree at `root` without touching the store.
    ///
    /// The target root's node must still be resolvable; this is what makes
    /// discarding a speculative update safe.
    pub fn reset_root(&mut self, root: RootHash) -> Result<(), TreeError> {
        if root.is_empty() {
            self.root = None;
            return Ok(());
        }
        let hash = NodeHash::from(root);
        self.resolve(&hash)?;
        self.root = Some(hash);
        Ok(())
    }

    /// The backing node store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutable access to the backing node store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Looks up the value hash committed under `key`.
    pub fn get(&self, key: &KeyHash) -> Result<Option<ValueHash>, TreeError> {
        let Some(root) = self.root else {
            return Ok(None);
        };
        let path = key_nibbles(key);
        let mut current = root;
        let mut offset = 0;
        loop {
            match self.resolve(&current)? {
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => {
                    return Ok((leaf_path == path[offset..]).then_some(value));
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if !path[offset..].starts_with(&ext_path) {
                        return Ok(None);
                    }
                    offset += ext_path.len();
                    current = child;
                }
                Node::Branch { children } => match children[path[offset] as usize] {
                    Some(child) => {
                        offset += 1;
                        current = child;
                    }
                    None => return Ok(None),
                },
            }
        }
    }

    /// Inserts or overwrites the value hash stored under `key`.
    pub fn update(&mut self, key: &KeyHash, value: ValueHash) -> Result<(), TreeError> {
        let path = key_nibbles(key);
        let new_root = match self.root {
            None => self.write_node(&Node::Leaf { path, value })?,
            Some(root) => self.insert_at(root, &path, value)?,
        };
        self.root = Some(new_root);
        Ok(())
    }

    /// Removes the leaf stored under `key`.
    ///
    /// Fails with [`TreeError::UnknownKey`] when the key is not committed.
    pub fn remove(&mut self, key: &KeyHash) -> Result<(), TreeError> {
        let root = self.root.ok_or(TreeError::UnknownKey(*key))?;
        let path = key_nibbles(key);
        let replacement = self.remove_at(root, &path, key)?;
        self.root = match replacement {
            None => None,
            Some(node) => Some(self.write_node(&node)?),
        };
        Ok(())
    }

    /// Produces an inclusion or exclusion proof for `key` against the
    /// current root.
    ///
    /// The proof carries the encoded nodes along the lookup path, root first,
    /// ending at the node that decides the key's presence.
    pub fn prove(&self, key: &KeyHash) -> Result<MerkleProof, TreeError> {
        let mut nodes = Vec::new();
        let Some(root) = self.root else {
            return Ok(MerkleProof::new(*key, nodes));
        };
        let path = key_nibbles(key);
        let mut current = root;
        let mut offset = 0;
        loop {
            let (bytes, node) = self.resolve_bytes(&current)?;
            nodes.push(bytes);
            match node {
                Node::Leaf { .. } => return Ok(MerkleProof::new(*key, nodes)),
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if !path[offset..].starts_with(&ext_path) {
                        return Ok(MerkleProof::new(*key, nodes));
                    }
                    offset += ext_path.len();
                    current = child;
                }
                Node::Branch { children } => match children[path[offset] as usize] {
                    Some(child) => {
                        offset += 1;
                        current = child;
                    }
                    None => return Ok(MerkleProof::new(*key, nodes)),
                },
            }
        }
    }

    fn resolve(&self, hash: &NodeHash) -> Result<Node, TreeError> {
        Ok(self.resolve_bytes(hash)?.1)
    }

    fn resolve_bytes(&self, hash: &NodeHash) -> Result<(Vec<u8>, Node), TreeError> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or(TreeError::MissingNode(*hash))?;
        let actual = NodeHash::with(&bytes);
        if actual != *hash {
            return Err(TreeError::HashMismatch {
                expected: *hash,
                actual,
            });
        }
        let node = Node::try_from_slice(&bytes).map_err(|_| TreeError::CorruptNode(*hash))?;
        Ok((bytes, node))
    }

    fn write_node(&mut self, node: &Node) -> Result<NodeHash, TreeError> {
        let bytes = node.encode();
        let hash = NodeHash::with(&bytes);
        self.store.put(hash, bytes)?;
        Ok(hash)
    }

    // Keys are fixed width, so two distinct key paths always diverge before
    // either path is exhausted; the divergence handling below relies on that.
    fn insert_at(
        &mut self,
        node_hash: NodeHash,
        path: &[u8],
        value: ValueHash,
    ) -> Result<NodeHash, TreeError> {
        let replacement = match self.resolve(&node_hash)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    Node::Leaf {
                        path: leaf_path,
                        value,
                    }
                } else {
                    let shared = common_prefix(&leaf_path, path);
                    let mut children: [Option<NodeHash>; 16] = Default::default();
                    let existing = Node::Leaf {
                        path: leaf_path[shared + 1..].to_vec(),
                        value: leaf_value,
                    };
                    children[leaf_path[shared] as usize] = Some(self.write_node(&existing)?);
                    let inserted = Node::Leaf {
                        path: path[shared + 1..].to_vec(),
                        value,
                    };
                    children[path[shared] as usize] = Some(self.write_node(&inserted)?);
                    self.wrap_in_extension(&path[..shared], Node::Branch { children })?
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let shared = common_prefix(&ext_path, path);
                if shared == ext_path.len() {
                    let child = self.insert_at(child, &path[shared..], value)?;
                    Node::Extension {
                        path: ext_path,
                        child,
                    }
                } else {
                    let mut children: [Option<NodeHash>; 16] = Default::default();
                    children[ext_path[shared] as usize] = Some(if shared + 1 == ext_path.len() {
                        child
                    } else {
                        self.write_node(&Node::Extension {
                            path: ext_path[shared + 1..].to_vec(),
                            child,
                        })?
                    });
                    let leaf = Node::Leaf {
                        path: path[shared + 1..].to_vec(),
                        value,
                    };
                    children[path[shared] as usize] = Some(self.write_node(&leaf)?);
                    self.wrap_in_extension(&path[..shared], Node::Branch { children })?
                }
            }
            Node::Branch { mut children } => {
                let index = path[0] as usize;
                let child = match children[index] {
                    Some(child) => self.insert_at(child, &path[1..], value)?,
                    None => self.write_node(&Node::Leaf {
                        path: path[1..].to_vec(),
                        value,
                    })?,
                };
                children[index] = Some(child);
                Node::Branch { children }
            }
        };
        self.write_node(&replacement)
    }

    fn wrap_in_extension(&mut self, shared: &[u8], node: Node) -> Result<Node, TreeError> {
        if shared.is_empty() {
            return Ok(node);
        }
        let child = self.write_node(&node)?;
        Ok(Node::Extension {
            path: shared.to_vec(),
            child,
        })
    }

    // Returns the decoded replacement for the node, or `None` when the
    // subtree is now empty. Decoded nodes let the parent merge paths when a
    // branch collapses to a single child.
    fn remove_at(
        &mut self,
        node_hash: NodeHash,
        path: &[u8],
        key: &KeyHash,
    ) -> Result<Option<Node>, TreeError> {
        match self.resolve(&node_hash)? {
            Node::Leaf {
                path: leaf_path, ..
            } => {
                if leaf_path == path {
                    Ok(None)
                } else {
                    Err(TreeError::UnknownKey(*key))
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if !path.starts_with(&ext_path) {
                    return Err(TreeError::UnknownKey(*key));
                }
                match self.remove_at(child, &path[ext_path.len()..], key)? {
                    None => Ok(None),
                    Some(Node::Leaf { path: rest, value }) => Ok(Some(Node::Leaf {
                        path: join_paths(&ext_path, &rest),
                        value,
                    })),
                    Some(Node::Extension { path: rest, child }) => Ok(Some(Node::Extension {
                        path: join_paths(&ext_path, &rest),
                        child,
                    })),
                    Some(branch) => {
                        let child = self.write_node(&branch)?;
                        Ok(Some(Node::Extension {
                            path: ext_path,
                            child,
                        }))
                    }
                }
            }
            Node::Branch { mut children } => {
                let index = path[0] as usize;
                let child = children[index].ok_or(TreeError::UnknownKey(*key))?;
                children[index] = match self.remove_at(child, &path[1..], key)? {
                    None => None,
                    Some(node) => Some(self.write_node(&node)?),
                };

                let mut remaining = children
                    .iter()
                    .enumerate()
                    .filter_map(|(nibble, child)| child.map(|hash| (nibble as u8, hash)));
                match (remaining.next(), remaining.next()) {
                    (None, _) => Ok(None),
                    (Some((nibble, hash)), None) => {
                        // the fork is gone; fold the last child upward
                        Ok(Some(match self.resolve(&hash)? {
                            Node::Leaf { path: rest, value } => Node::Leaf {
                                path: join_paths(&[nibble], &rest),
                                value,
                            },
                            Node::Extension { path: rest, child } => Node::Extension {
                                path: join_paths(&[nibble], &rest),
                                child,
                            },
                            Node::Branch { .. } => Node::Extension {
                                path: vec![nibble],
                                child: hash,
                            },
                        }))
                    }
                    _ => Ok(Some(Node::Branch { children })),
                }
            }
        }
    }
}

fn join_paths(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut joined = Vec::with_capacity(prefix.len() + rest.len());
    joined.extend_from_slice(prefix);
    joined.extend_from_slice(rest);
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;

    fn empty_tree() -> PatriciaTree<MemoryNodeStore> {
        PatriciaTree::new(MemoryNodeStore::new())
    }

    fn key(tag: u8) -> KeyHash {
        KeyHash::with([tag])
    }

    fn value(tag: u8) -> ValueHash {
        ValueHash::with([tag])
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = empty_tree();
        assert_eq!(tree.root(), RootHash::EMPTY);
        assert_eq!(tree.get(&key(1)).unwrap(), None);
    }

    #[test]
    fn update_and_get_round_trip() {
        let mut tree = empty_tree();
        for tag in 0..32 {
            tree.update(&key(tag), value(tag)).unwrap();
        }
        for tag in 0..32 {
            assert_eq!(tree.get(&key(tag)).unwrap(), Some(value(tag)));
        }
        assert_eq!(tree.get(&key(99)).unwrap(), None);
    }

    #[test]
    fn overwrite_changes_the_root_deterministically() {
        let mut tree = empty_tree();
        tree.update(&key(1), value(1)).unwrap();
        let first = tree.root();

        tree.update(&key(1), value(2)).unwrap();
        assert_ne!(tree.root(), first);
        assert_eq!(tree.get(&key(1)).unwrap(), Some(value(2)));

        tree.update(&key(1), value(1)).unwrap();
        assert_eq!(tree.root(), first);
    }

    #[test]
    fn remove_restores_the_previous_root() {
        let mut tree = empty_tree();
        tree.update(&key(1), value(1)).unwrap();
        let one = tree.root();

        tree.update(&key(2), value(2)).unwrap();
        tree.update(&key(3), value(3)).unwrap();
        tree.remove(&key(3)).unwrap();
        tree.remove(&key(2)).unwrap();

        assert_eq!(tree.root(), one);
        tree.remove(&key(1)).unwrap();
        assert_eq!(tree.root(), RootHash::EMPTY);
    }

    #[test]
    fn remove_of_unknown_key_fails() {
        let mut tree = empty_tree();
        assert!(matches!(
            tree.remove(&key(1)),
            Err(TreeError::UnknownKey(_))
        ));

        tree.update(&key(1), value(1)).unwrap();
        assert!(matches!(
            tree.remove(&key(2)),
            Err(TreeError::UnknownKey(_))
        ));
        assert_eq!(tree.get(&key(1)).unwrap(), Some(value(1)));
    }

    #[test]
    fn root_is_independent_of_insertion_order() {
        let mut forward = empty_tree();
        let mut reverse = empty_tree();
        for tag in 0..64 {
            forward.update(&key(tag), value(tag)).unwrap();
        }
        for tag in (0..64).rev() {
            reverse.update(&key(tag), value(tag)).unwrap();
        }
        assert_eq!(forward.root(), reverse.root());
    }

    #[test]
    fn reset_root_recovers_an_earlier_generation() {
        let mut tree = empty_tree();
        tree.update(&key(1), value(1)).unwrap();
        let before = tree.root();

        tree.update(&key(2), value(2)).unwrap();
        tree.remove(&key(1)).unwrap();

        tree.reset_root(before).unwrap();
        assert_eq!(tree.get(&key(1)).unwrap(), Some(value(1)));
        assert_eq!(tree.get(&key(2)).unwrap(), None);
    }

    #[test]
    fn missing_node_is_fatal() {
        let mut tree = empty_tree();
        tree.update(&key(1), value(1)).unwrap();
        let root = tree.root();

        let opened = PatriciaTree::with_root(MemoryNodeStore::new(), root);
        assert!(matches!(opened, Err(TreeError::MissingNode(_))));
    }

    // A store that hands back tampered bytes for one node.
    struct TamperingStore {
        inner: MemoryNodeStore,
        victim: Option<NodeHash>,
    }

    impl NodeStore for TamperingStore {
        fn get(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, TreeError> {
            let mut bytes = self.inner.get(hash)?;
            if Some(*hash) == self.victim {
                if let Some(bytes) = bytes.as_mut() {
                    bytes[0] ^= 0xff;
                }
            }
            Ok(bytes)
        }

        fn put(&mut self, hash: NodeHash, bytes: Vec<u8>) -> Result<(), TreeError> {
            self.inner.put(hash, bytes)
        }
    }

    #[test]
    fn tampered_node_surfaces_hash_mismatch() {
        let mut tree = PatriciaTree::new(TamperingStore {
            inner: MemoryNodeStore::new(),
            victim: None,
        });
        tree.update(&key(1), value(1)).unwrap();
        tree.update(&key(2), value(2)).unwrap();

        tree.store_mut().victim = Some(NodeHash::from(tree.root()));
        assert!(matches!(
            tree.get(&key(1)),
            Err(TreeError::HashMismatch { .. })
        ));
    }
}
