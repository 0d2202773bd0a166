use borsh::{BorshDeserialize, BorshSerialize};

use crate::hash::{KeyHash, NodeHash, ValueHash};

/// One node of the compressed hexary tree.
///
/// Paths are sequences of nibbles (values `0..16`). Because keys are
/// fixed-width hashes, every leaf sits at nibble depth 64 and a branch never
/// carries a value of its own.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum Node {
    /// Terminal node holding the value hash for the key whose remaining
    /// nibbles are `path`.
    Leaf {
        /// Nibbles between this node and the full key.
        path: Vec<u8>,
        /// Hash of the entry stored under the key.
        value: ValueHash,
    },
    /// A run of nibbles shared by every key below `child`.
    Extension {
        /// The shared nibbles.
        path: Vec<u8>,
        /// The node the run leads to.
        child: NodeHash,
    },
    /// A 16-way fork, one slot per next nibble.
    Branch {
        /// Child addresses indexed by nibble.
        children: [Option<NodeHash>; 16],
    },
}

impl Node {
    /// Serializes the node to its canonical byte form.
    pub fn encode(&self) -> Vec<u8> {
        self.try_to_vec().expect("node serialization cannot fail")
    }

    /// The content address of the node.
    pub fn hash(&self) -> NodeHash {
        NodeHash::with(self.encode())
    }
}

/// Expands a key hash into its 64 nibbles, high nibble first.
pub(crate) fn key_nibbles(key: &KeyHash) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(64);
    for byte in key.as_bytes() {
        nibbles.push(byte >> 4);
        nibbles.push(byte & 0x0f);
    }
    nibbles
}

/// Length of the longest shared prefix of two nibble paths.
pub(crate) fn common_prefix(left: &[u8], right: &[u8]) -> usize {
    left.iter().zip(right).take_while(|(a, b)| a == b).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibbles_cover_the_full_key() {
        let key = KeyHash([0xab; 32]);
        let nibbles = key_nibbles(&key);
        assert_eq!(nibbles.len(), 64);
        assert!(nibbles.iter().all(|n| *n == 0xa || *n == 0xb));
        assert_eq!(&nibbles[..2], &[0xa, 0xb]);
    }

    #[test]
    fn common_prefix_stops_at_divergence() {
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix(&[1, 2], &[1, 2]), 2);
        assert_eq!(common_prefix(&[5], &[6]), 0);
    }

    #[test]
    fn encoding_round_trips() {
        let mut children: [Option<NodeHash>; 16] = Default::default();
        children[3] = Some(NodeHash::with(b"child"));
        for node in [
            Node::Leaf {
                path: vec![1, 2, 3],
                value: ValueHash::with(b"value"),
            },
            Node::Extension {
                path: vec![0xf],
                child: NodeHash::with(b"next"),
            },
            Node::Branch { children },
        ] {
            let decoded = Node::try_from_slice(&node.encode()).unwrap();
            assert_eq!(decoded, node);
            assert_eq!(decoded.hash(), node.hash());
        }
    }
}
