//! Typed sub-caches and the Merkle-committed state aggregate.
//!
//! A sub-cache pairs one entry type's ordered container with a Patricia
//! commitment tree and a versioned serializer; the [`StateCache`] aggregate
//! composes any number of them behind one commit height. Readers take
//! consistent cross-cache snapshots ([`StateCacheView`]) that never observe
//! pending writer state; the single in-flight writer mutates through a
//! [`StateCacheDelta`] and publishes everything at once through
//! [`StateCache::commit`].
//!
//! Error handling follows three tiers: programmer misuse (duplicate insert,
//! removal of an unknown key, a second concurrent writer, access to an
//! unregistered sub-cache) panics immediately; data-integrity and
//! capability failures ([`TreeError`](basalt_patricia::TreeError),
//! [`StorageError`]) are typed results the caller must treat as fatal or
//! dispatch on; expected absence is an `Option`.

#![deny(missing_docs)]

mod aggregate;
mod config;
mod delta;
mod descriptor;
mod height_group;
mod storage;
mod sub_cache;
mod view;

pub use aggregate::{
    DetachedDelta, StateCache, StateCacheBuilder, StateCacheDelta, StateCacheView, StateHash,
    StateHashInfo, SubCachePlugin, SubCachePluginAdapter,
};
pub use config::CacheConfig;
pub use delta::CacheDelta;
pub use descriptor::CacheDescriptor;
pub use height_group::HeightGroupedSet;
pub use storage::{BorshEntryCodec, CacheStorage, EntryCodec, FullEntryStorage, StorageError};
pub use sub_cache::SubCache;
pub use view::CacheView;

/// A block height. Sub-cache deltas are opened at an explicit height and the
/// aggregate advances to the committed height atomically with every commit.
pub type Height = u64;
