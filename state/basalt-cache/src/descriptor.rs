use std::fmt::Debug;

use borsh::BorshSerialize;

use crate::storage::EntryCodec;

/// Compile-time description of one sub-cache.
///
/// A descriptor ties together the entry type a sub-cache stores, the key its
/// entries are identified by, and the codec they are persisted and hashed
/// with. Every view, delta, storage, and aggregate accessor is generic over
/// the descriptor, so call sites keep full type safety while the aggregate
/// stores sub-caches type-erased.
pub trait CacheDescriptor: Send + Sync + 'static {
    /// Name used in logs, configuration, and panic messages.
    const NAME: &'static str;

    /// The identifier entries are keyed by. Its serialized form feeds the
    /// Merkle key hash, so it must be stable across runs.
    type Key: Ord + Clone + Debug + BorshSerialize + Send + Sync + 'static;

    /// The entry value type.
    type Entry: Clone + Send + Sync + 'static;

    /// The codec entries are serialized with, both for persistence and for
    /// the Merkle value hash.
    type Codec: EntryCodec<Entry = Self::Entry> + Default + Send + Sync + 'static;

    /// Extracts the key an entry is stored under.
    fn key_of(entry: &Self::Entry) -> Self::Key;
}
