use std::sync::{Arc, Mutex, RwLock};

use basalt_deltaset::BaseSet;
use basalt_patricia::{MemoryNodeStore, PatriciaTree, RootHash};

use crate::delta::CacheDelta;
use crate::descriptor::CacheDescriptor;
use crate::height_group::HeightGroupedSet;
use crate::view::CacheView;
use crate::Height;

/// One typed sub-cache: an ordered container paired with its commitment tree
/// and expiry schedule.
///
/// The committed side (generation, Merkle root, expiry groups) only ever
/// changes through [`Self::commit`], which validates the delta first and then
/// applies it as pure data movement: the container swaps in a fresh
/// generation and the tree root moves to nodes the validation step already
/// wrote. Views taken before the swap keep reading the old generation.
pub struct SubCache<D: CacheDescriptor> {
    base: BaseSet<D::Key, D::Entry>,
    pub(crate) tree: Mutex<PatriciaTree<MemoryNodeStore>>,
    committed_root: RwLock<RootHash>,
    expiry: RwLock<HeightGroupedSet<D::Key>>,
    pruned_at: RwLock<Option<Height>>,
}

impl<D: CacheDescriptor> Default for SubCache<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: CacheDescriptor> SubCache<D> {
    /// Creates an empty sub-cache.
    pub fn new() -> Self {
        Self {
            base: BaseSet::new(),
            tree: Mutex::new(PatriciaTree::new(MemoryNodeStore::new())),
            committed_root: RwLock::new(RootHash::EMPTY),
            expiry: RwLock::new(HeightGroupedSet::new()),
            pruned_at: RwLock::new(None),
        }
    }

    /// Takes an immutable snapshot bound at `height`.
    pub fn create_view(&self, height: Height) -> CacheView<D> {
        CacheView::new(self.base.snapshot(), self.merkle_root(), height)
    }

    /// Opens a writer delta at `height` against the current generation.
    pub fn create_delta(self: &Arc<Self>, height: Height) -> CacheDelta<D> {
        CacheDelta::new(Arc::clone(self), self.base.begin_delta(), height)
    }

    /// The committed Merkle root.
    pub fn merkle_root(&self) -> RootHash {
        *self.committed_root.read().expect("merkle root lock poisoned")
    }

    /// Number of committed entries. Constant time.
    pub fn size(&self) -> usize {
        self.base.snapshot().len()
    }

    /// Validates and applies `delta`, returning the committed root.
    ///
    /// All fallible work (staleness check, root recomputation over the dirty
    /// keys) happens before anything committed moves; after validation the
    /// apply step cannot fail.
    pub fn commit(&self, mut delta: CacheDelta<D>) -> anyhow::Result<RootHash> {
        let root = self.validate_delta(&mut delta)?;
        self.commit_delta(delta);
        Ok(root)
    }

    pub(crate) fn validate_delta(&self, delta: &mut CacheDelta<D>) -> anyhow::Result<RootHash> {
        assert!(
            std::ptr::eq(delta.sub.as_ref(), self),
            "cache {}: delta belongs to a different sub-cache instance",
            D::NAME
        );
        anyhow::ensure!(
            self.base.is_current(&delta.inner),
            "cache {}: delta was opened against a superseded generation",
            D::NAME
        );
        delta.update_merkle_root(delta.height)
    }

    pub(crate) fn commit_delta(&self, delta: CacheDelta<D>) {
        let CacheDelta {
            inner,
            height,
            pending_root,
            expiry_adds,
            prune_up_to,
            ..
        } = delta;
        let pending_root =
            pending_root.expect("pending merkle root must be computed before commit");

        let changes = self
            .base
            .commit(inner)
            .expect("validated delta no longer matches its base set");
        self.tree
            .lock()
            .expect("merkle tree lock poisoned")
            .reset_root(pending_root)
            .expect("pending merkle root must be materialized in the node store");
        *self.committed_root.write().expect("merkle root lock poisoned") = pending_root;

        let mut expiry = self.expiry.write().expect("expiry lock poisoned");
        expiry.merge(expiry_adds);
        if let Some(prune_height) = prune_up_to {
            expiry.prune(prune_height);
            let mut pruned_at = self.pruned_at.write().expect("prune marker lock poisoned");
            *pruned_at = Some(pruned_at.map_or(prune_height, |h| h.max(prune_height)));
        }

        tracing::debug!(
            cache = D::NAME,
            height,
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            root = %pending_root,
            "committed sub-cache delta"
        );
    }

    pub(crate) fn committed_expiry(&self) -> HeightGroupedSet<D::Key> {
        self.expiry.read().expect("expiry lock poisoned").clone()
    }

    pub(crate) fn committed_expiry_at(&self, height: Height) -> Vec<D::Key> {
        self.expiry
            .read()
            .expect("expiry lock poisoned")
            .at(height)
            .cloned()
            .collect()
    }

    pub(crate) fn committed_expired(&self, height: Height) -> Vec<D::Key> {
        self.expiry
            .read()
            .expect("expiry lock poisoned")
            .expired(height)
            .cloned()
            .collect()
    }

    pub(crate) fn has_expired_groups(&self, height: Height) -> bool {
        self.expiry
            .read()
            .expect("expiry lock poisoned")
            .expired(height)
            .next()
            .is_some()
    }

    pub(crate) fn already_pruned(&self, height: Height) -> bool {
        self.pruned_at
            .read()
            .expect("prune marker lock poisoned")
            .map_or(false, |pruned| pruned >= height)
    }
}

#[cfg(test)]
mod tests {
    use borsh::{BorshDeserialize, BorshSerialize};

    use super::*;
    use crate::storage::BorshEntryCodec;

    #[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
    struct Account {
        address: [u8; 8],
        balance: u64,
    }

    struct AccountDescriptor;

    impl CacheDescriptor for AccountDescriptor {
        const NAME: &'static str = "accounts";
        type Key = [u8; 8];
        type Entry = Account;
        type Codec = BorshEntryCodec<Account>;

        fn key_of(entry: &Self::Entry) -> Self::Key {
            entry.address
        }
    }

    fn account(tag: u8, balance: u64) -> Account {
        Account {
            address: [tag; 8],
            balance,
        }
    }

    fn empty_cache() -> Arc<SubCache<AccountDescriptor>> {
        Arc::new(SubCache::new())
    }

    #[test]
    fn view_taken_before_commit_never_sees_the_delta() {
        let cache = empty_cache();
        let before = cache.create_view(0);

        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        cache.commit(delta).unwrap();

        assert!(before.find(&[1; 8]).is_none());
        let after = cache.create_view(1);
        assert_eq!(after.find(&[1; 8]), Some(&account(1, 100)));
    }

    #[test]
    fn discarded_delta_mutates_nothing() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        cache.commit(delta).unwrap();
        let root = cache.merkle_root();

        let mut doomed = cache.create_delta(2);
        doomed.remove(&[1; 8]);
        doomed.insert(account(2, 50));
        drop(doomed);

        let view = cache.create_view(1);
        assert_eq!(view.find(&[1; 8]), Some(&account(1, 100)));
        assert_eq!(view.len(), 1);
        assert_eq!(cache.merkle_root(), root);
    }

    #[test]
    fn commit_updates_the_merkle_root_deterministically() {
        let cache = empty_cache();
        assert!(cache.merkle_root().is_empty());

        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        let root_one = cache.commit(delta).unwrap();
        assert_eq!(cache.merkle_root(), root_one);

        let mut delta = cache.create_delta(2);
        delta.insert(account(2, 200));
        let root_two = cache.commit(delta).unwrap();
        assert_ne!(root_two, root_one);

        let mut delta = cache.create_delta(3);
        delta.remove(&[2; 8]);
        let root_three = cache.commit(delta).unwrap();
        assert_eq!(root_three, root_one);
    }

    #[test]
    fn modifying_an_entry_changes_its_merkle_leaf() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        let before = cache.commit(delta).unwrap();

        let mut delta = cache.create_delta(2);
        delta.find_mut(&[1; 8]).unwrap().balance = 101;
        let after = cache.commit(delta).unwrap();
        assert_ne!(after, before);

        assert_eq!(cache.create_view(2).find(&[1; 8]).unwrap().balance, 101);
    }

    #[test]
    #[should_panic(expected = "cannot insert")]
    fn duplicate_insert_panics() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        delta.insert(account(1, 200));
    }

    #[test]
    #[should_panic(expected = "cannot remove")]
    fn unknown_remove_panics() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.remove(&[9; 8]);
    }

    #[test]
    fn superseded_delta_fails_validation() {
        let cache = empty_cache();

        let mut stale = cache.create_delta(1);
        stale.insert(account(1, 100));

        let mut winner = cache.create_delta(1);
        winner.insert(account(2, 200));
        cache.commit(winner).unwrap();

        let err = cache.commit(stale).unwrap_err();
        assert!(err.to_string().contains("superseded"));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn scheduled_entries_are_pruned_once() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        delta.insert(account(2, 200));
        delta.schedule_expiry(5, [1; 8]);
        cache.commit(delta).unwrap();

        let mut delta = cache.create_delta(5);
        assert_eq!(delta.prune(5), 1);
        cache.commit(delta).unwrap();

        let view = cache.create_view(5);
        assert!(!view.contains(&[1; 8]));
        assert!(view.contains(&[2; 8]));

        // second prune at the same height stages nothing
        let mut again = cache.create_delta(5);
        assert_eq!(again.prune(5), 0);
        drop(again);
        assert!(cache.already_pruned(5));
    }

    #[test]
    fn touch_returns_and_dirties_expiring_entries() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        delta.schedule_expiry(7, [1; 8]);
        cache.commit(delta).unwrap();

        let mut delta = cache.create_delta(7);
        let expiring = delta.touch(7);
        assert_eq!(expiring, vec![[1; 8]]);
        drop(delta);
    }

    #[test]
    fn restore_changes_rolls_back_to_the_backup() {
        let cache = empty_cache();
        let mut delta = cache.create_delta(1);
        delta.insert(account(1, 100));
        delta.backup_changes(false);

        delta.insert(account(2, 200));
        delta.schedule_expiry(9, [2; 8]);
        delta.restore_changes();

        assert!(delta.contains(&[1; 8]));
        assert!(!delta.contains(&[2; 8]));
        assert!(delta.expiry_schedule().is_empty());
        cache.commit(delta).unwrap();
        assert_eq!(cache.size(), 1);
    }
}
