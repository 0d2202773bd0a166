use std::sync::Arc;

use basalt_deltaset::{Delta, ElementError, Iter};
use basalt_patricia::{KeyHash, RootHash, ValueHash};
use borsh::BorshSerialize;

use crate::descriptor::CacheDescriptor;
use crate::height_group::HeightGroupedSet;
use crate::storage::EntryCodec;
use crate::sub_cache::SubCache;
use crate::Height;

/// The single writer's transactional handle over one sub-cache.
///
/// A delta merges its private overlay over the committed generation it was
/// opened on. Mutations follow the misuse policy of the engine: inserting a
/// live key or removing an absent one is a bug in the calling pipeline and
/// panics; the `try_` variants exist for replay paths that must surface the
/// same conditions as data errors instead.
///
/// Dropping a delta discards the overlay and touches nothing committed.
pub struct CacheDelta<D: CacheDescriptor> {
    pub(crate) sub: Arc<SubCache<D>>,
    pub(crate) inner: Delta<D::Key, D::Entry>,
    pub(crate) codec: D::Codec,
    pub(crate) height: Height,
    pub(crate) pending_root: Option<RootHash>,
    pub(crate) expiry_adds: HeightGroupedSet<D::Key>,
    pub(crate) expiry_backup: Option<HeightGroupedSet<D::Key>>,
    pub(crate) prune_up_to: Option<Height>,
}

impl<D: CacheDescriptor> CacheDelta<D> {
    pub(crate) fn new(sub: Arc<SubCache<D>>, inner: Delta<D::Key, D::Entry>, height: Height) -> Self {
        Self {
            sub,
            inner,
            codec: D::Codec::default(),
            height,
            pending_root: None,
            expiry_adds: HeightGroupedSet::new(),
            expiry_backup: None,
            prune_up_to: None,
        }
    }

    /// The height the delta was opened at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the merged entry stored under `key`.
    pub fn find(&self, key: &D::Key) -> Option<&D::Entry> {
        self.inner.get(key)
    }

    /// Returns a mutable reference to the merged entry stored under `key`.
    ///
    /// The first mutable access to a committed entry clones it into the
    /// overlay before returning the reference, so the committed generation
    /// stays untouched and the key is marked dirty for root recomputation.
    pub fn find_mut(&mut self, key: &D::Key) -> Option<&mut D::Entry> {
        self.inner.get_mut(key)
    }

    /// Returns whether `key` is live in the merged view.
    pub fn contains(&self, key: &D::Key) -> bool {
        self.inner.contains(key)
    }

    /// Merged entry count.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns whether the merged view holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns whether the overlay records any pending change.
    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    /// Iterates over the merged view in key order.
    pub fn iter(&self) -> Iter<'_, D::Key, D::Entry> {
        self.inner.iter()
    }

    /// Stages `entry` for insertion.
    ///
    /// # Panics
    /// Panics when the entry's key is already live in the merged view;
    /// duplicate inserts are a bug in the calling pipeline.
    pub fn insert(&mut self, entry: D::Entry) {
        let key = D::key_of(&entry);
        if let Err(err) = self.inner.insert(key.clone(), entry) {
            panic!("cache {}: cannot insert {:?}: {}", D::NAME, key, err);
        }
    }

    /// Fallible insert for replay paths.
    pub fn try_insert(&mut self, entry: D::Entry) -> Result<(), ElementError> {
        self.inner.insert(D::key_of(&entry), entry).map(|_| ())
    }

    /// Stages the removal of `key`.
    ///
    /// # Panics
    /// Panics when the key is absent from the merged view; removing an
    /// unknown key is a bug in the calling pipeline, not a no-op.
    pub fn remove(&mut self, key: &D::Key) {
        if let Err(err) = self.inner.remove(key) {
            panic!("cache {}: cannot remove {:?}: {}", D::NAME, key, err);
        }
    }

    /// Fallible removal for replay paths.
    pub fn try_remove(&mut self, key: &D::Key) -> Result<(), ElementError> {
        self.inner.remove(key).map(|_| ())
    }

    /// The Merkle root the delta currently commits to: the last recomputed
    /// pending root, or the committed root when nothing was recomputed yet.
    pub fn merkle_root(&self) -> RootHash {
        self.pending_root.unwrap_or_else(|| self.sub.merkle_root())
    }

    /// Recomputes the pending Merkle root from the overlay's dirty keys.
    ///
    /// The replacement nodes are written into the shared node store but the
    /// committed root pointer is left untouched, so discarding the delta
    /// discards the speculative root with it. Called by aggregate commit
    /// validation; any failure here aborts the commit before any state moves.
    pub fn update_merkle_root(&mut self, height: Height) -> anyhow::Result<RootHash> {
        let mut tree = self.sub.tree.lock().expect("merkle tree lock poisoned");
        let committed = tree.root();

        let outcome = (|| -> anyhow::Result<RootHash> {
            for (key, entry) in self.inner.added().chain(self.inner.modified()) {
                let value = ValueHash::with(self.codec.to_bytes(entry)?);
                tree.update(&hash_key::<D>(key), value)?;
            }
            for key in self.inner.removed() {
                tree.remove(&hash_key::<D>(key))?;
            }
            Ok(tree.root())
        })();

        // only the root pointer moves back; the speculative nodes stay put
        tree.reset_root(committed)
            .expect("committed merkle root must stay resolvable");

        let pending = outcome?;
        self.pending_root = Some(pending);
        tracing::trace!(
            cache = D::NAME,
            height,
            root = %pending,
            "recomputed pending merkle root"
        );
        Ok(pending)
    }

    /// Schedules `key` to deactivate at `height`.
    pub fn schedule_expiry(&mut self, height: Height, key: D::Key) {
        self.expiry_adds.add(height, key);
    }

    /// Merges a whole expiry schedule into the pending one. Used by summary
    /// restore paths.
    pub fn merge_expiry_schedule(&mut self, schedule: HeightGroupedSet<D::Key>) {
        self.expiry_adds.merge(schedule);
    }

    /// The merged expiry schedule: committed groups plus pending additions.
    pub fn expiry_schedule(&self) -> HeightGroupedSet<D::Key> {
        let mut merged = self.sub.committed_expiry();
        merged.merge(self.expiry_adds.clone());
        merged
    }

    /// Marks every entry deactivating at exactly `height` dirty and returns
    /// their keys, so the caller can process the expiring entries and their
    /// Merkle leaves are recomputed at commit.
    pub fn touch(&mut self, height: Height) -> Vec<D::Key> {
        let mut keys = self.sub.committed_expiry_at(height);
        keys.extend(self.expiry_adds.at(height).cloned());
        keys.sort();
        keys.dedup();
        for key in &keys {
            let _ = self.inner.get_mut(key);
        }
        keys
    }

    /// Stages the removal of every entry scheduled at or below `height` and
    /// drains the corresponding groups. Identifiers whose entry is already
    /// gone are skipped, which is what makes pruning idempotent. Returns the
    /// number of removals staged.
    pub fn prune(&mut self, height: Height) -> usize {
        let committed = self.sub.committed_expired(height);
        let pending: Vec<D::Key> = self.expiry_adds.expired(height).cloned().collect();

        let mut staged = 0;
        for key in committed.into_iter().chain(pending) {
            if self.inner.remove(&key).is_ok() {
                staged += 1;
            }
        }

        self.expiry_adds.prune(height);
        self.prune_up_to = Some(self.prune_up_to.map_or(height, |h| h.max(height)));
        staged
    }

    /// Copies the overlay and the pending expiry schedule into the backup
    /// slot. An existing backup is kept unless `replace` is set.
    pub fn backup_changes(&mut self, replace: bool) {
        if self.expiry_backup.is_none() || replace {
            self.expiry_backup = Some(self.expiry_adds.clone());
        }
        self.inner.backup_changes(replace);
    }

    /// Rolls the overlay back to the most recent backup, or to the state the
    /// delta was opened in when none was taken.
    pub fn restore_changes(&mut self) {
        self.inner.restore_changes();
        self.expiry_adds = self.expiry_backup.take().unwrap_or_else(HeightGroupedSet::new);
        self.pending_root = None;
    }
}

pub(crate) fn hash_key<D: CacheDescriptor>(key: &D::Key) -> KeyHash {
    KeyHash::with(key.try_to_vec().expect("key serialization cannot fail"))
}
