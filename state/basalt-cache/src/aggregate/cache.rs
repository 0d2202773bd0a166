use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use basalt_patricia::RootHash;
use sha2::{Digest, Sha256};

use crate::aggregate::plugin::{SubCachePlugin, SubCachePluginAdapter};
use crate::config::CacheConfig;
use crate::delta::CacheDelta;
use crate::descriptor::CacheDescriptor;
use crate::storage::{CacheStorage, StorageError};
use crate::view::CacheView;
use crate::Height;

/// The hash committing to the full aggregate state: the digest of every
/// sub-cache's Merkle root, in registration order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub [u8; 32]);

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash(0x{})", hex::encode(self.0))
    }
}

/// A state hash together with the sub-cache roots it was computed from.
#[derive(Debug, Clone)]
pub struct StateHashInfo {
    /// The aggregate state hash.
    pub state_hash: StateHash,
    /// The per-sub-cache Merkle roots, in registration order.
    pub sub_cache_roots: Vec<RootHash>,
}

fn calculate_state_hash(roots: &[RootHash]) -> StateHash {
    if roots.is_empty() {
        return StateHash([0; 32]);
    }
    let mut hasher = Sha256::new();
    for root in roots {
        hasher.update(root.as_bytes());
    }
    StateHash(hasher.finalize().into())
}

// Held while a writer is outstanding; releases the slot on drop.
struct WriterGuard {
    slot: Arc<AtomicBool>,
}

impl WriterGuard {
    fn acquire(slot: &Arc<AtomicBool>) -> Self {
        Self::try_acquire(slot).unwrap_or_else(|| {
            panic!("concurrent modifications are not supported: another delta is outstanding")
        })
    }

    fn try_acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self {
                slot: Arc::clone(slot),
            })
    }
}

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// Construction-time registry for the aggregate.
///
/// Sub-caches are registered exactly once, before the aggregate exists;
/// registering the same descriptor twice panics, and a name listed in
/// [`CacheConfig::disabled`] is skipped. The registered set is immutable
/// afterwards.
pub struct StateCacheBuilder {
    config: CacheConfig,
    plugins: Vec<Box<dyn SubCachePlugin>>,
    index: HashMap<TypeId, usize>,
}

impl StateCacheBuilder {
    /// Creates a builder with `config`.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Registers the sub-cache described by `D`, persisted through `storage`.
    ///
    /// # Panics
    /// Panics when `D` was already registered.
    pub fn register<D, S>(mut self, storage: S) -> Self
    where
        D: CacheDescriptor,
        S: CacheStorage<D> + 'static,
    {
        if self.config.is_disabled(D::NAME) {
            tracing::warn!(cache = D::NAME, "sub-cache disabled by configuration");
            return self;
        }

        let previous = self.index.insert(TypeId::of::<D>(), self.plugins.len());
        if previous.is_some() {
            panic!("sub-cache {} is already registered", D::NAME);
        }
        self.plugins
            .push(Box::new(SubCachePluginAdapter::<D, S>::new(storage)));
        self
    }

    /// Finishes construction at height 0.
    pub fn build(self) -> StateCache {
        tracing::debug!(
            sub_caches = self.plugins.len(),
            "state cache constructed"
        );
        StateCache {
            plugins: self.plugins,
            index: Arc::new(self.index),
            height: RwLock::new(0),
            writer: Arc::new(AtomicBool::new(false)),
            config: self.config,
        }
    }
}

/// The aggregate of every registered sub-cache, sharing one commit height.
///
/// The height lock is the aggregate's single synchronization point: views
/// are assembled under the read lock and commits apply under the write lock,
/// so a reader assembles its cross-cache snapshot entirely before or
/// entirely after any commit, never across one. One writer delta may be
/// outstanding at a time.
pub struct StateCache {
    plugins: Vec<Box<dyn SubCachePlugin>>,
    index: Arc<HashMap<TypeId, usize>>,
    height: RwLock<Height>,
    writer: Arc<AtomicBool>,
    config: CacheConfig,
}

impl StateCache {
    /// The current committed height.
    pub fn height(&self) -> Height {
        *self.height.read().expect("cache height lock poisoned")
    }

    /// Takes a consistent view across every sub-cache, bound at the current
    /// committed height.
    pub fn create_view(&self) -> StateCacheView {
        let height = self.height.read().expect("cache height lock poisoned");
        let views = self
            .plugins
            .iter()
            .map(|plugin| plugin.create_view(*height))
            .collect();
        let roots = self.plugins.iter().map(|plugin| plugin.merkle_root()).collect();
        StateCacheView {
            height: *height,
            views,
            roots,
            index: Arc::clone(&self.index),
        }
    }

    /// Takes a view, asserting it binds at `height`.
    ///
    /// # Panics
    /// Panics when `height` is not the committed height; the aggregate holds
    /// exactly one committed snapshot, so any other height is misuse.
    pub fn create_view_at(&self, height: Height) -> StateCacheView {
        let view = self.create_view();
        assert_eq!(
            view.height(),
            height,
            "view requested at height {height} but the committed height is {}",
            view.height()
        );
        view
    }

    /// Opens the aggregate writer delta at `height`.
    ///
    /// # Panics
    /// Panics when another delta is already outstanding; the engine supports
    /// exactly one in-flight writer.
    pub fn create_delta(&self, height: Height) -> StateCacheDelta {
        let guard = WriterGuard::acquire(&self.writer);
        StateCacheDelta {
            height,
            deltas: self.open_sub_deltas(height),
            index: Arc::clone(&self.index),
            _guard: guard,
        }
    }

    /// Opens a delta that is not yet attached to the writer slot.
    ///
    /// The detached handle can be carried across threads and re-locked with
    /// [`DetachedDelta::try_lock`] once no other writer is outstanding.
    pub fn create_detached_delta(&self, height: Height) -> DetachedDelta {
        DetachedDelta {
            height,
            deltas: self.open_sub_deltas(height),
            index: Arc::clone(&self.index),
            writer: Arc::clone(&self.writer),
        }
    }

    fn open_sub_deltas(&self, height: Height) -> Vec<Box<dyn Any + Send>> {
        self.plugins
            .iter()
            .map(|plugin| plugin.create_delta(height))
            .collect()
    }

    /// Commits `delta` and advances the aggregate to `height`.
    ///
    /// Every sub-cache's pending overlay is validated and its Merkle root
    /// recomputed first; only when all of that fallible work has succeeded
    /// does the apply phase run, under the height write lock, as pure data
    /// movement. A validation failure therefore leaves every sub-cache and
    /// the height exactly as they were.
    pub fn commit(&self, delta: StateCacheDelta, height: Height) -> anyhow::Result<StateHashInfo> {
        assert!(
            Arc::ptr_eq(&delta.index, &self.index),
            "delta belongs to a different state cache"
        );
        let StateCacheDelta {
            mut deltas, _guard, ..
        } = delta;

        let mut roots = Vec::with_capacity(self.plugins.len());
        for (plugin, sub_delta) in self.plugins.iter().zip(deltas.iter_mut()) {
            roots.push(plugin.validate_pending(sub_delta.as_mut())?);
        }
        let state_hash = calculate_state_hash(&roots);

        {
            let mut committed_height = self.height.write().expect("cache height lock poisoned");
            for (plugin, sub_delta) in self.plugins.iter().zip(deltas.drain(..)) {
                plugin.commit_pending(sub_delta);
            }
            *committed_height = height;
        }

        tracing::debug!(height, state_hash = %state_hash, "committed state cache");
        Ok(StateHashInfo {
            state_hash,
            sub_cache_roots: roots,
        })
    }

    /// Prunes every sub-cache relative to `height`: expiry groups at or
    /// below `height - retention_depth` are dropped. Runs after commit on
    /// the writer thread; repeating a prune at the same height is a no-op.
    ///
    /// # Panics
    /// Panics when a writer delta is outstanding.
    pub fn prune(&self, height: Height) -> anyhow::Result<()> {
        let _guard = WriterGuard::acquire(&self.writer);
        // hold the publication lock so a view never straddles a half-pruned
        // aggregate
        let _height = self.height.write().expect("cache height lock poisoned");
        let prune_height = height.saturating_sub(self.config.retention_depth);
        for plugin in &self.plugins {
            plugin
                .prune(prune_height)
                .with_context(|| format!("pruning sub-cache {}", plugin.name()))?;
        }
        tracing::debug!(height, prune_height, "pruned state cache");
        Ok(())
    }

    /// Writes the full committed entry set of sub-cache `D`.
    pub fn save_all<D: CacheDescriptor>(
        &self,
        writer: &mut dyn Write,
    ) -> Result<(), StorageError> {
        self.plugin_of::<D>().save_all(self.height(), writer)
    }

    /// Writes the cache-wide summary of sub-cache `D`.
    ///
    /// Fails with [`StorageError::SummaryUnsupported`] when the sub-cache's
    /// storage derives no summary; callers fall back to [`Self::save_all`].
    pub fn save_summary<D: CacheDescriptor>(
        &self,
        writer: &mut dyn Write,
    ) -> Result<(), StorageError> {
        self.plugin_of::<D>().save_summary(self.height(), writer)
    }

    /// Restores sub-cache `D` on startup: from `summary` when one was
    /// checkpointed, otherwise by replaying `entries`.
    ///
    /// # Panics
    /// Panics when a writer delta is outstanding.
    pub fn restore<D: CacheDescriptor>(
        &self,
        summary: Option<&mut dyn Read>,
        entries: Option<&mut dyn Read>,
    ) -> anyhow::Result<()> {
        let _guard = WriterGuard::acquire(&self.writer);
        self.plugin_of::<D>().restore(summary, entries)
    }

    /// Committed entry counts per sub-cache, for the diagnostics collector.
    /// Constant time per sub-cache.
    pub fn sizes(&self) -> Vec<(&'static str, usize)> {
        self.plugins
            .iter()
            .map(|plugin| (plugin.name(), plugin.size()))
            .collect()
    }

    fn plugin_of<D: CacheDescriptor>(&self) -> &dyn SubCachePlugin {
        let index = self
            .index
            .get(&TypeId::of::<D>())
            .unwrap_or_else(|| panic!("sub-cache {} is not registered", D::NAME));
        self.plugins[*index].as_ref()
    }
}

/// A consistent read-only snapshot across every sub-cache.
pub struct StateCacheView {
    height: Height,
    views: Vec<Box<dyn Any + Send + Sync>>,
    roots: Vec<RootHash>,
    index: Arc<HashMap<TypeId, usize>>,
}

impl StateCacheView {
    /// The height the view was bound at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The typed view of sub-cache `D`.
    ///
    /// # Panics
    /// Panics when `D` was never registered; registration is a startup
    /// invariant, so a miss here is a bug in the calling pipeline.
    pub fn sub<D: CacheDescriptor>(&self) -> &CacheView<D> {
        let index = self
            .index
            .get(&TypeId::of::<D>())
            .unwrap_or_else(|| panic!("sub-cache {} is not registered", D::NAME));
        self.views[*index]
            .downcast_ref::<CacheView<D>>()
            .expect("sub-cache view type mismatch")
    }

    /// The state hash of the snapshot, with the roots it was computed from.
    pub fn state_hash(&self) -> StateHashInfo {
        StateHashInfo {
            state_hash: calculate_state_hash(&self.roots),
            sub_cache_roots: self.roots.clone(),
        }
    }
}

/// The aggregate writer's transactional handle.
///
/// Holds the writer slot for as long as it lives; dropping it without
/// committing discards every sub-cache overlay and releases the slot.
pub struct StateCacheDelta {
    height: Height,
    deltas: Vec<Box<dyn Any + Send>>,
    index: Arc<HashMap<TypeId, usize>>,
    _guard: WriterGuard,
}

impl StateCacheDelta {
    /// The height the delta was opened at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// The typed delta of sub-cache `D`.
    ///
    /// # Panics
    /// Panics when `D` was never registered.
    pub fn sub<D: CacheDescriptor>(&self) -> &CacheDelta<D> {
        self.deltas[self.index_of::<D>()]
            .downcast_ref::<CacheDelta<D>>()
            .expect("sub-cache delta type mismatch")
    }

    /// The typed mutable delta of sub-cache `D`.
    ///
    /// # Panics
    /// Panics when `D` was never registered.
    pub fn sub_mut<D: CacheDescriptor>(&mut self) -> &mut CacheDelta<D> {
        let index = self.index_of::<D>();
        self.deltas[index]
            .downcast_mut::<CacheDelta<D>>()
            .expect("sub-cache delta type mismatch")
    }

    fn index_of<D: CacheDescriptor>(&self) -> usize {
        *self
            .index
            .get(&TypeId::of::<D>())
            .unwrap_or_else(|| panic!("sub-cache {} is not registered", D::NAME))
    }
}

/// An aggregate delta not yet holding the writer slot.
pub struct DetachedDelta {
    height: Height,
    deltas: Vec<Box<dyn Any + Send>>,
    index: Arc<HashMap<TypeId, usize>>,
    writer: Arc<AtomicBool>,
}

impl fmt::Debug for DetachedDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetachedDelta")
            .field("height", &self.height)
            .field("sub_caches", &self.deltas.len())
            .finish()
    }
}

impl DetachedDelta {
    /// The height the delta was opened at.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Attempts to take the writer slot and attach the delta.
    ///
    /// Fails and hands the detached delta back when another writer is
    /// outstanding, so the caller can retry.
    pub fn try_lock(self) -> Result<StateCacheDelta, DetachedDelta> {
        match WriterGuard::try_acquire(&self.writer) {
            Some(guard) => Ok(StateCacheDelta {
                height: self.height,
                deltas: self.deltas,
                index: self.index,
                _guard: guard,
            }),
            None => Err(self),
        }
    }
}
