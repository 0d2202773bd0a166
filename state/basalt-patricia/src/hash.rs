use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone,
            Copy,
            Default,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            BorshSerialize,
            BorshDeserialize,
        )]
        pub struct $name(pub [u8; 32]);

        impl $name {
            /// Hashes `bytes` into a new value.
            pub fn with(bytes: impl AsRef<[u8]>) -> Self {
                Self(Sha256::digest(bytes.as_ref()).into())
            }

            /// Returns the raw digest.
            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), hex::encode(self.0))
            }
        }
    };
}

hash_newtype!(
    /// The fixed-width hash an entry is keyed by inside the tree.
    KeyHash
);

hash_newtype!(
    /// The hash of an entry's serialized form, stored at the key's leaf.
    ValueHash
);

hash_newtype!(
    /// The content address of an encoded tree node.
    NodeHash
);

hash_newtype!(
    /// The root commitment of a key/value set.
    RootHash
);

impl RootHash {
    /// The root of a tree with no entries.
    pub const EMPTY: RootHash = RootHash([0; 32]);

    /// Returns whether this is the empty-tree root.
    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl From<NodeHash> for RootHash {
    fn from(hash: NodeHash) -> Self {
        RootHash(hash.0)
    }
}

impl From<RootHash> for NodeHash {
    fn from(root: RootHash) -> Self {
        NodeHash(root.0)
    }
}
