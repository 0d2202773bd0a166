use borsh::{BorshDeserialize, BorshSerialize};

use crate::hash::{KeyHash, NodeHash, RootHash, ValueHash};
use crate::node::{key_nibbles, Node};

/// A compact inclusion or exclusion proof for one key.
///
/// Carries the encoded nodes along the lookup path, root first. Verification
/// replays the lookup against a trusted root: each node must hash to the
/// address its parent references, and the terminal node decides whether the
/// key is present.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MerkleProof {
    key: KeyHash,
    nodes: Vec<Vec<u8>>,
}

/// Ways a proof can fail to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProofError {
    /// The proof has no nodes but the root commits to a non-empty tree.
    #[error("proof is empty but the root commits to a non-empty tree")]
    MissingNodes,
    /// A supplied node does not hash to the address referencing it.
    #[error("proof node does not hash to the reference pointing at it")]
    NodeMismatch,
    /// A supplied node could not be decoded.
    #[error("proof node is malformed")]
    MalformedNode,
    /// The proof ends before the lookup reaches a terminal node.
    #[error("proof ends before reaching a terminal node")]
    Truncated,
    /// The proof carries nodes past its terminal node.
    #[error("proof carries nodes past its terminal node")]
    TrailingNodes,
}

impl MerkleProof {
    pub(crate) fn new(key: KeyHash, nodes: Vec<Vec<u8>>) -> Self {
        Self { key, nodes }
    }

    /// The key the proof speaks about.
    pub fn key(&self) -> &KeyHash {
        &self.key
    }

    /// The encoded nodes along the lookup path, root first.
    pub fn nodes(&self) -> &[Vec<u8>] {
        &self.nodes
    }

    /// Replays the proof against a trusted `root`.
    ///
    /// Returns the proven value hash for an inclusion proof, or `None` for a
    /// valid exclusion proof.
    pub fn verify(&self, root: RootHash) -> Result<Option<ValueHash>, ProofError> {
        if root.is_empty() {
            return if self.nodes.is_empty() {
                Ok(None)
            } else {
                Err(ProofError::TrailingNodes)
            };
        }

        let path = key_nibbles(&self.key);
        let mut offset = 0;
        let mut expected = NodeHash::from(root);
        let mut nodes = self.nodes.iter();
        let mut bytes = nodes.next().ok_or(ProofError::MissingNodes)?;

        loop {
            if NodeHash::with(bytes) != expected {
                return Err(ProofError::NodeMismatch);
            }
            let node = Node::try_from_slice(bytes).map_err(|_| ProofError::MalformedNode)?;
            let next_reference = match node {
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => {
                    let proven = (leaf_path == path[offset..]).then_some(value);
                    return finish(nodes, proven);
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if !path[offset..].starts_with(&ext_path) {
                        return finish(nodes, None);
                    }
                    offset += ext_path.len();
                    child
                }
                Node::Branch { children } => match children[path[offset] as usize] {
                    Some(child) => {
                        offset += 1;
                        child
                    }
                    None => return finish(nodes, None),
                },
            };
            expected = next_reference;
            bytes = nodes.next().ok_or(ProofError::Truncated)?;
        }
    }
}

fn finish<'a>(
    mut remaining: impl Iterator<Item = &'a Vec<u8>>,
    proven: Option<ValueHash>,
) -> Result<Option<ValueHash>, ProofError> {
    if remaining.next().is_some() {
        return Err(ProofError::TrailingNodes);
    }
    Ok(proven)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use crate::tree::PatriciaTree;

    fn key(tag: u8) -> KeyHash {
        KeyHash::with([tag])
    }

    fn value(tag: u8) -> ValueHash {
        ValueHash::with([tag])
    }

    fn populated_tree() -> PatriciaTree<MemoryNodeStore> {
        let mut tree = PatriciaTree::new(MemoryNodeStore::new());
        for tag in 0..16 {
            tree.update(&key(tag), value(tag)).unwrap();
        }
        tree
    }

    #[test]
    fn inclusion_proof_verifies() {
        let tree = populated_tree();
        for tag in 0..16 {
            let proof = tree.prove(&key(tag)).unwrap();
            assert_eq!(proof.verify(tree.root()).unwrap(), Some(value(tag)));
        }
    }

    #[test]
    fn exclusion_proof_verifies() {
        let tree = populated_tree();
        let proof = tree.prove(&key(200)).unwrap();
        assert_eq!(proof.verify(tree.root()).unwrap(), None);
    }

    #[test]
    fn empty_tree_proves_exclusion_with_no_nodes() {
        let tree = PatriciaTree::new(MemoryNodeStore::new());
        let proof = tree.prove(&key(1)).unwrap();
        assert!(proof.nodes().is_empty());
        assert_eq!(proof.verify(RootHash::EMPTY).unwrap(), None);
    }

    #[test]
    fn proof_fails_against_the_wrong_root() {
        let tree = populated_tree();
        let proof = tree.prove(&key(1)).unwrap();

        let mut other = populated_tree();
        other.update(&key(1), value(99)).unwrap();

        assert_eq!(
            proof.verify(other.root()),
            Err(ProofError::NodeMismatch)
        );
    }

    #[test]
    fn truncated_proof_is_rejected() {
        let tree = populated_tree();
        let full = tree.prove(&key(1)).unwrap();
        assert!(full.nodes().len() > 1);

        let truncated = MerkleProof::new(
            key(1),
            full.nodes()[..full.nodes().len() - 1].to_vec(),
        );
        assert_eq!(truncated.verify(tree.root()), Err(ProofError::Truncated));
    }

    #[test]
    fn trailing_nodes_are_rejected() {
        let tree = populated_tree();
        let proof = tree.prove(&key(1)).unwrap();

        let mut nodes = proof.nodes().to_vec();
        nodes.push(nodes[0].clone());
        let padded = MerkleProof::new(key(1), nodes);
        assert_eq!(padded.verify(tree.root()), Err(ProofError::TrailingNodes));
    }
}
