use std::collections::{BTreeMap, BTreeSet};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::Height;

/// Identifiers grouped by the height at which they fall out of scope.
///
/// The expiry schedule behind height-based `touch` and `prune`: each group
/// holds the keys that deactivate at exactly that height, and pruning drains
/// every group at or below the prune height. Groups are kept sorted so the
/// drain is a single range split.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct HeightGroupedSet<K: Ord> {
    groups: BTreeMap<Height, BTreeSet<K>>,
}

impl<K: Ord> Default for HeightGroupedSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord> HeightGroupedSet<K> {
    /// Creates an empty schedule.
    pub fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }

    /// Schedules `key` to deactivate at `height`.
    pub fn add(&mut self, height: Height, key: K) {
        self.groups.entry(height).or_default().insert(key);
    }

    /// Drops `key` from the group at `height`, if scheduled there.
    pub fn remove(&mut self, height: Height, key: &K) {
        if let Some(group) = self.groups.get_mut(&height) {
            group.remove(key);
            if group.is_empty() {
                self.groups.remove(&height);
            }
        }
    }

    /// Keys deactivating at exactly `height`.
    pub fn at(&self, height: Height) -> impl Iterator<Item = &K> {
        self.groups.get(&height).into_iter().flatten()
    }

    /// Keys deactivating at or below `height`, lowest group first.
    pub fn expired(&self, height: Height) -> impl Iterator<Item = &K> {
        self.groups.range(..=height).flat_map(|(_, group)| group)
    }

    /// Drains every group at or below `height` and returns the drained keys.
    pub fn prune(&mut self, height: Height) -> Vec<K> {
        let retained = match height.checked_add(1) {
            Some(bound) => self.groups.split_off(&bound),
            None => BTreeMap::new(),
        };
        let drained = std::mem::replace(&mut self.groups, retained);
        drained.into_values().flatten().collect()
    }

    /// Merges every group of `other` into this schedule.
    pub fn merge(&mut self, other: HeightGroupedSet<K>) {
        for (height, group) in other.groups {
            self.groups.entry(height).or_default().extend(group);
        }
    }

    /// Iterates over all `(height, key)` pairs, lowest height first.
    pub fn iter(&self) -> impl Iterator<Item = (Height, &K)> {
        self.groups
            .iter()
            .flat_map(|(height, group)| group.iter().map(move |key| (*height, key)))
    }

    /// Number of scheduled keys across all groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeSet::len).sum()
    }

    /// Returns whether no key is scheduled.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
