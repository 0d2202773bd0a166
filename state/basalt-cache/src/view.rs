use std::collections::btree_map;

use basalt_deltaset::Snapshot;
use basalt_patricia::RootHash;

use crate::descriptor::CacheDescriptor;
use crate::Height;

/// An immutable snapshot of one sub-cache.
///
/// A view binds a committed generation, the Merkle root it was committed
/// under, and the height it was taken at. It is lock-free and safe to share
/// across threads: the generation it references is never mutated in place,
/// so the view keeps reading it unchanged however many commits happen later.
pub struct CacheView<D: CacheDescriptor> {
    snapshot: Snapshot<D::Key, D::Entry>,
    merkle_root: RootHash,
    height: Height,
}

impl<D: CacheDescriptor> CacheView<D> {
    pub(crate) fn new(
        snapshot: Snapshot<D::Key, D::Entry>,
        merkle_root: RootHash,
        height: Height,
    ) -> Self {
        Self {
            snapshot,
            merkle_root,
            height,
        }
    }

    /// The height the view was bound at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The Merkle root the viewed generation was committed under.
    pub fn merkle_root(&self) -> RootHash {
        self.merkle_root
    }

    /// Returns the committed entry stored under `key`.
    pub fn find(&self, key: &D::Key) -> Option<&D::Entry> {
        self.snapshot.get(key)
    }

    /// Returns whether `key` is committed.
    pub fn contains(&self, key: &D::Key) -> bool {
        self.snapshot.contains(key)
    }

    /// Number of committed entries. Constant time.
    pub fn len(&self) -> usize {
        self.snapshot.len()
    }

    /// Returns whether the view holds no entries.
    pub fn is_empty(&self) -> bool {
        self.snapshot.is_empty()
    }

    /// Iterates over the committed entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, D::Key, D::Entry> {
        self.snapshot.iter()
    }
}
