use std::collections::btree_map;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::delta::{Delta, DeltaChanges, ElementError};

/// The committed side of a set: an ordered map published as immutable
/// generations.
///
/// Entries enter and leave the committed map only through [`BaseSet::commit`];
/// there is no direct mutation path. Each commit builds a complete new
/// generation and swaps it in under a short write lock, so snapshots taken
/// before the swap keep reading the old generation untouched.
pub struct BaseSet<K, V> {
    committed: RwLock<Arc<BTreeMap<K, V>>>,
}

impl<K, V> Default for BaseSet<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> BaseSet<K, V> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Arc::new(BTreeMap::new())),
        }
    }

    /// Takes a snapshot of the current committed generation.
    pub fn snapshot(&self) -> Snapshot<K, V> {
        let committed = self.committed.read().expect("base set lock poisoned");
        Snapshot {
            entries: Arc::clone(&committed),
        }
    }
}

impl<K: Ord + Clone, V: Clone> BaseSet<K, V> {
    /// Creates a set whose first generation holds `entries`.
    pub fn from_entries(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            committed: RwLock::new(Arc::new(entries.into_iter().collect())),
        }
    }

    /// Opens a delta against the current committed generation.
    pub fn begin_delta(&self) -> Delta<K, V> {
        Delta::new(self.snapshot())
    }

    /// Returns whether `delta` was opened against the current generation.
    ///
    /// A delta opened before another delta committed is stale; committing it
    /// would silently discard the intervening generation, so [`Self::commit`]
    /// rejects it.
    pub fn is_current(&self, delta: &Delta<K, V>) -> bool {
        let committed = self.committed.read().expect("base set lock poisoned");
        Arc::ptr_eq(delta.base(), &committed)
    }

    /// Flattens `delta` into a fresh generation and publishes it.
    ///
    /// Fails with [`ElementError::StaleDelta`] when the delta's base
    /// generation has been superseded. Once the staleness check passes the
    /// commit is pure data movement and cannot fail; readers observe the swap
    /// as a single transition. Returns the changes that were applied.
    pub fn commit(&self, delta: Delta<K, V>) -> Result<DeltaChanges<K, V>, ElementError> {
        let (base, changes) = delta.into_parts();
        let mut committed = self.committed.write().expect("base set lock poisoned");
        if !Arc::ptr_eq(&base, &committed) {
            return Err(ElementError::StaleDelta);
        }

        let mut next = BTreeMap::clone(&committed);
        for (key, value) in &changes.added {
            next.insert(key.clone(), value.clone());
        }
        for (key, value) in &changes.modified {
            next.insert(key.clone(), value.clone());
        }
        for key in &changes.removed {
            next.remove(key);
        }

        *committed = Arc::new(next);
        Ok(changes)
    }
}

/// A read-only handle onto one committed generation.
///
/// Cloning is an `Arc` bump. Snapshots stay valid across later commits; they
/// simply keep reading the generation they were taken from.
pub struct Snapshot<K, V> {
    entries: Arc<BTreeMap<K, V>>,
}

impl<K, V> Clone for Snapshot<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<K: Ord, V> Snapshot<K, V> {
    /// Returns the committed value stored under `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Returns whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the committed entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.entries.iter()
    }

    pub(crate) fn into_inner(self) -> Arc<BTreeMap<K, V>> {
        self.entries
    }
}
