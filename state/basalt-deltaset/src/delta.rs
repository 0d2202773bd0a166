use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::iter::Peekable;
use std::sync::Arc;

use crate::base_set::Snapshot;

/// Errors raised by delta mutations and commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ElementError {
    /// The key is already live in the merged view.
    #[error("key is already present in the set")]
    DuplicateKey,
    /// The key is absent from the merged view.
    #[error("key is not present in the set")]
    UnknownKey,
    /// The delta's base generation has been superseded by a later commit.
    #[error("delta was opened against a superseded generation")]
    StaleDelta,
}

/// How an insert landed in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was new; the entry is pending as an addition.
    Inserted,
    /// The key had a pending removal, which the insert cancelled.
    Unremoved,
}

/// How a removal landed in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    /// A committed key is now pending removal.
    Removed,
    /// The key was a pending insert, which the removal cancelled.
    Unadded,
}

/// The copy-on-write overlay of one in-flight unit of work.
///
/// A delta is private to the thread that opened it. Reads see the overlay
/// merged over the base snapshot; the committed generation is never touched
/// until [`BaseSet::commit`](crate::BaseSet::commit) flattens the overlay into
/// a fresh one.
///
/// Overlay invariants, maintained by every mutation:
/// - `added` is disjoint from the base generation,
/// - `modified` and `removed` only hold keys of the base generation,
/// - a key appears in at most one of the three maps.
pub struct Delta<K, V> {
    base: Arc<BTreeMap<K, V>>,
    added: BTreeMap<K, V>,
    modified: BTreeMap<K, V>,
    removed: BTreeSet<K>,
    backup: Option<Backup<K, V>>,
}

struct Backup<K, V> {
    added: BTreeMap<K, V>,
    modified: BTreeMap<K, V>,
    removed: BTreeSet<K>,
}

/// The flattened changes a committed delta applied, keyed in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaChanges<K, V> {
    /// Entries that were not present in the previous generation.
    pub added: BTreeMap<K, V>,
    /// Entries whose committed counterpart was overwritten.
    pub modified: BTreeMap<K, V>,
    /// Keys erased from the previous generation.
    pub removed: BTreeSet<K>,
}

impl<K, V> DeltaChanges<K, V> {
    /// Returns whether no changes were recorded.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    /// Number of dirty keys across all three groups.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

impl<K: Ord, V> Delta<K, V> {
    pub(crate) fn new(snapshot: Snapshot<K, V>) -> Self {
        Self {
            base: snapshot.into_inner(),
            added: BTreeMap::new(),
            modified: BTreeMap::new(),
            removed: BTreeSet::new(),
            backup: None,
        }
    }

    pub(crate) fn base(&self) -> &Arc<BTreeMap<K, V>> {
        &self.base
    }

    pub(crate) fn into_parts(self) -> (Arc<BTreeMap<K, V>>, DeltaChanges<K, V>) {
        (
            self.base,
            DeltaChanges {
                added: self.added,
                modified: self.modified,
                removed: self.removed,
            },
        )
    }

    /// Returns the merged value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        if let Some(value) = self.added.get(key) {
            return Some(value);
        }
        if let Some(value) = self.modified.get(key) {
            return Some(value);
        }
        if self.removed.contains(key) {
            return None;
        }
        self.base.get(key)
    }

    /// Returns whether `key` is live in the merged view.
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Merged entry count: committed + added − removed.
    ///
    /// The overlay invariants keep the three groups disjoint, so nothing is
    /// ever double counted.
    pub fn len(&self) -> usize {
        self.base.len() + self.added.len() - self.removed.len()
    }

    /// Returns whether the merged view holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether the overlay records any pending change.
    pub fn is_dirty(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.removed.is_empty()
    }

    /// Pending additions in key order.
    pub fn added(&self) -> btree_map::Iter<'_, K, V> {
        self.added.iter()
    }

    /// Pending modifications in key order.
    pub fn modified(&self) -> btree_map::Iter<'_, K, V> {
        self.modified.iter()
    }

    /// Pending removals in key order.
    pub fn removed(&self) -> impl Iterator<Item = &K> {
        self.removed.iter()
    }

    /// Iterates over the merged view in key order.
    ///
    /// The iterator is lazy and restartable; mutation while it is live is
    /// prevented by the borrow it holds on the delta.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            base: self.base.iter().peekable(),
            added: self.added.iter().peekable(),
            modified: &self.modified,
            removed: &self.removed,
        }
    }
}

impl<K: Ord + Clone, V> Delta<K, V> {
    /// Stages `value` under `key`.
    ///
    /// Fails with [`ElementError::DuplicateKey`] when the key is already live
    /// in the merged view. Inserting over a pending removal cancels the
    /// removal; the entry lands in the modified group because its committed
    /// counterpart still exists.
    pub fn insert(&mut self, key: K, value: V) -> Result<InsertOutcome, ElementError> {
        if self.added.contains_key(&key) || self.modified.contains_key(&key) {
            return Err(ElementError::DuplicateKey);
        }
        if self.removed.remove(&key) {
            self.modified.insert(key, value);
            return Ok(InsertOutcome::Unremoved);
        }
        if self.base.contains_key(&key) {
            return Err(ElementError::DuplicateKey);
        }
        self.added.insert(key, value);
        Ok(InsertOutcome::Inserted)
    }

    /// Stages the removal of `key`.
    ///
    /// Fails with [`ElementError::UnknownKey`] when the key is absent from
    /// the merged view; removing twice is an error, not a no-op. Removing a
    /// pending insert drops it from the overlay entirely.
    pub fn remove(&mut self, key: &K) -> Result<RemoveOutcome, ElementError> {
        if self.added.remove(key).is_some() {
            return Ok(RemoveOutcome::Unadded);
        }
        if self.removed.contains(key) {
            return Err(ElementError::UnknownKey);
        }
        if self.modified.remove(key).is_some() {
            self.removed.insert(key.clone());
            return Ok(RemoveOutcome::Removed);
        }
        if self.base.contains_key(key) {
            self.removed.insert(key.clone());
            return Ok(RemoveOutcome::Removed);
        }
        Err(ElementError::UnknownKey)
    }
}

impl<K: Ord + Clone, V: Clone> Delta<K, V> {
    /// Copies the overlay out as a [`DeltaChanges`], for commitment-tree
    /// maintenance and external change consumers. Only dirty keys are
    /// cloned.
    pub fn changes(&self) -> DeltaChanges<K, V> {
        DeltaChanges {
            added: self.added.clone(),
            modified: self.modified.clone(),
            removed: self.removed.clone(),
        }
    }

    /// Returns a mutable reference to the merged value stored under `key`.
    ///
    /// The first mutable access to a committed entry clones it into the
    /// modified group before returning the reference, so the committed
    /// generation is never edited in place.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.removed.contains(key) {
            return None;
        }
        if self.added.contains_key(key) {
            return self.added.get_mut(key);
        }
        if !self.modified.contains_key(key) {
            let committed = self.base.get(key)?;
            self.modified.insert(key.clone(), committed.clone());
        }
        self.modified.get_mut(key)
    }

    /// Copies the current overlay into the backup slot.
    ///
    /// When a backup already exists it is kept unless `replace` is set.
    pub fn backup_changes(&mut self, replace: bool) {
        if self.backup.is_some() && !replace {
            return;
        }
        self.backup = Some(Backup {
            added: self.added.clone(),
            modified: self.modified.clone(),
            removed: self.removed.clone(),
        });
    }

    /// Rolls the overlay back to the most recent backup.
    ///
    /// When no backup was taken the overlay is cleared, restoring the state
    /// the delta was opened in.
    pub fn restore_changes(&mut self) {
        match self.backup.take() {
            Some(backup) => {
                self.added = backup.added;
                self.modified = backup.modified;
                self.removed = backup.removed;
            }
            None => {
                self.added.clear();
                self.modified.clear();
                self.removed.clear();
            }
        }
    }
}

/// Lazy merging iterator over a delta, in key order.
pub struct Iter<'a, K, V> {
    base: Peekable<btree_map::Iter<'a, K, V>>,
    added: Peekable<btree_map::Iter<'a, K, V>>,
    modified: &'a BTreeMap<K, V>,
    removed: &'a BTreeSet<K>,
}

impl<'a, K: Ord, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let take_base = match (self.base.peek(), self.added.peek()) {
                (None, None) => return None,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                // added keys are disjoint from the base generation
                (Some((base_key, _)), Some((added_key, _))) => base_key < added_key,
            };

            if !take_base {
                return self.added.next();
            }

            let (key, value) = self.base.next().expect("peeked entry must exist");
            if self.removed.contains(key) {
                continue;
            }
            return Some((key, self.modified.get(key).unwrap_or(value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;
    use crate::BaseSet;

    fn delta_over(entries: &[(u8, u32)]) -> (BaseSet<u8, u32>, Delta<u8, u32>) {
        let set = BaseSet::from_entries(entries.iter().copied());
        let delta = set.begin_delta();
        (set, delta)
    }

    #[test]
    fn get_prefers_overlay_over_base() {
        let (_, mut delta) = delta_over(&[(1, 10), (2, 20), (3, 30)]);

        delta.insert(4, 40).unwrap();
        *delta.get_mut(&2).unwrap() = 21;
        delta.remove(&3).unwrap();

        assert_eq!(delta.get(&1), Some(&10));
        assert_eq!(delta.get(&2), Some(&21));
        assert_eq!(delta.get(&3), None);
        assert_eq!(delta.get(&4), Some(&40));
        assert_eq!(delta.len(), 3);
    }

    #[test]
    fn duplicate_insert_is_an_error() {
        let (_, mut delta) = delta_over(&[(1, 10)]);

        assert_eq!(delta.insert(1, 11), Err(ElementError::DuplicateKey));
        delta.insert(2, 20).unwrap();
        assert_eq!(delta.insert(2, 21), Err(ElementError::DuplicateKey));
    }

    #[test]
    fn unknown_remove_is_an_error_not_a_noop() {
        let (_, mut delta) = delta_over(&[(1, 10)]);

        assert_eq!(delta.remove(&9), Err(ElementError::UnknownKey));
        assert_eq!(delta.remove(&1), Ok(RemoveOutcome::Removed));
        assert_eq!(delta.remove(&1), Err(ElementError::UnknownKey));
    }

    #[test]
    fn insert_over_pending_removal_is_an_unremove() {
        let (set, mut delta) = delta_over(&[(1, 10)]);

        delta.remove(&1).unwrap();
        assert_eq!(delta.insert(1, 11), Ok(InsertOutcome::Unremoved));
        assert_eq!(delta.get(&1), Some(&11));

        let changes = set.commit(delta).unwrap();
        assert!(changes.added.is_empty());
        assert!(changes.removed.is_empty());
        assert_eq!(changes.modified.get(&1), Some(&11));
    }

    #[test]
    fn remove_of_pending_insert_unadds_it() {
        let (set, mut delta) = delta_over(&[]);

        delta.insert(1, 10).unwrap();
        assert_eq!(delta.remove(&1), Ok(RemoveOutcome::Unadded));
        assert_eq!(delta.get(&1), None);
        assert!(!delta.is_dirty());

        assert!(set.commit(delta).unwrap().is_empty());
    }

    #[test]
    fn first_mutable_access_copies_the_committed_entry() {
        let (set, mut delta) = delta_over(&[(1, 10)]);

        *delta.get_mut(&1).unwrap() += 1;
        *delta.get_mut(&1).unwrap() += 1;

        assert_eq!(delta.get(&1), Some(&12));
        assert_eq!(set.snapshot().get(&1), Some(&10));
        assert_eq!(delta.modified().count(), 1);
    }

    #[test]
    fn get_mut_refuses_removed_keys() {
        let (_, mut delta) = delta_over(&[(1, 10)]);

        delta.remove(&1).unwrap();
        assert!(delta.get_mut(&1).is_none());
    }

    #[test]
    fn iteration_merges_in_key_order() {
        let (_, mut delta) = delta_over(&[(2, 20), (4, 40), (6, 60)]);

        delta.insert(1, 10).unwrap();
        delta.insert(5, 50).unwrap();
        *delta.get_mut(&4).unwrap() = 41;
        delta.remove(&6).unwrap();

        let merged: Vec<_> = delta.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(merged, vec![(1, 10), (2, 20), (4, 41), (5, 50)]);
        assert_eq!(merged.len(), delta.len());

        // restartable
        assert_eq!(delta.iter().count(), 4);
    }

    #[test]
    fn backup_and_restore_round_trip() {
        let (_, mut delta) = delta_over(&[(1, 10)]);

        delta.insert(2, 20).unwrap();
        delta.backup_changes(false);

        delta.insert(3, 30).unwrap();
        delta.remove(&1).unwrap();
        delta.restore_changes();

        assert_eq!(delta.get(&1), Some(&10));
        assert_eq!(delta.get(&2), Some(&20));
        assert_eq!(delta.get(&3), None);
    }

    #[test]
    fn restore_without_backup_clears_the_overlay() {
        let (_, mut delta) = delta_over(&[(1, 10)]);

        delta.insert(2, 20).unwrap();
        delta.remove(&1).unwrap();
        delta.restore_changes();

        assert!(!delta.is_dirty());
        assert_eq!(delta.get(&1), Some(&10));
    }

    #[test]
    fn backup_without_replace_keeps_the_first_backup() {
        let (_, mut delta) = delta_over(&[]);

        delta.insert(1, 10).unwrap();
        delta.backup_changes(false);
        delta.insert(2, 20).unwrap();
        delta.backup_changes(false);
        delta.restore_changes();

        assert!(delta.contains(&1));
        assert!(!delta.contains(&2));
    }

    // One step of an arbitrary overlay script.
    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u32),
        Remove(u8),
        Mutate(u8, u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::Insert(k % 32, v)),
            any::<u8>().prop_map(|k| Op::Remove(k % 32)),
            (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::Mutate(k % 32, v)),
        ]
    }

    proptest! {
        // Merge law: for every script, the delta's merged view equals a plain
        // map that applied the same accepted operations directly.
        #[test]
        fn merged_view_matches_model(
            committed in proptest::collection::btree_map(any::<u8>().prop_map(|k| k % 32), any::<u32>(), 0..16),
            script in proptest::collection::vec(op_strategy(), 0..64),
        ) {
            let set = BaseSet::from_entries(committed.clone());
            let mut delta = set.begin_delta();
            let mut model: BTreeMap<u8, u32> = committed;

            for op in script {
                match op {
                    Op::Insert(k, v) => {
                        let result = delta.insert(k, v);
                        prop_assert_eq!(result.is_ok(), !model.contains_key(&k));
                        if result.is_ok() {
                            model.insert(k, v);
                        }
                    }
                    Op::Remove(k) => {
                        let result = delta.remove(&k);
                        prop_assert_eq!(result.is_ok(), model.remove(&k).is_some());
                    }
                    Op::Mutate(k, v) => {
                        match delta.get_mut(&k) {
                            Some(slot) => {
                                prop_assert!(model.contains_key(&k));
                                *slot = v;
                                model.insert(k, v);
                            }
                            None => prop_assert!(!model.contains_key(&k)),
                        }
                    }
                }
            }

            prop_assert_eq!(delta.len(), model.len());
            let merged: Vec<_> = delta.iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(merged, expected);

            // committing reproduces the model exactly
            set.commit(delta).unwrap();
            let committed: Vec<_> = set.snapshot().iter().map(|(k, v)| (*k, *v)).collect();
            let expected: Vec<_> = model.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(committed, expected);
        }
    }
}
