use std::any::{Any, TypeId};
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context;
use basalt_patricia::RootHash;

use crate::delta::CacheDelta;
use crate::descriptor::CacheDescriptor;
use crate::storage::{CacheStorage, StorageError};
use crate::sub_cache::SubCache;
use crate::Height;

/// The type-erased capability set the aggregate drives every sub-cache
/// through.
///
/// Views and deltas cross this boundary as `Any` boxes; the typed accessors
/// on the aggregate handles downcast them back, so call sites never touch
/// this trait directly.
pub trait SubCachePlugin: Send + Sync {
    /// The sub-cache's registered name.
    fn name(&self) -> &'static str;

    /// The `TypeId` of the descriptor this plugin was built from.
    fn descriptor_id(&self) -> TypeId;

    /// Number of committed entries. Constant time; feeds diagnostics.
    fn size(&self) -> usize;

    /// The committed Merkle root.
    fn merkle_root(&self) -> RootHash;

    /// Takes a typed view, boxed, bound at `height`.
    fn create_view(&self, height: Height) -> Box<dyn Any + Send + Sync>;

    /// Opens a typed delta, boxed, at `height`.
    fn create_delta(&self, height: Height) -> Box<dyn Any + Send>;

    /// Runs every fallible part of committing `delta`: staleness check and
    /// pending-root recomputation. Nothing committed moves here.
    fn validate_pending(&self, delta: &mut (dyn Any + Send)) -> anyhow::Result<RootHash>;

    /// Applies a validated `delta`. Pure data movement; cannot fail.
    fn commit_pending(&self, delta: Box<dyn Any + Send>);

    /// Drops entries whose expiry group closed at or below `height`.
    /// Idempotent: a repeated call at the same height is a no-op.
    fn prune(&self, height: Height) -> anyhow::Result<()>;

    /// Writes the full committed entry set at `height`.
    fn save_all(&self, height: Height, writer: &mut dyn Write) -> Result<(), StorageError>;

    /// Writes the cache-wide summary at `height`.
    fn save_summary(&self, height: Height, writer: &mut dyn Write) -> Result<(), StorageError>;

    /// Restores persisted state on startup: from `summary` when one was
    /// checkpointed, otherwise by replaying `entries`. A cold start with
    /// neither is valid and leaves the sub-cache empty.
    fn restore(
        &self,
        summary: Option<&mut dyn Read>,
        entries: Option<&mut dyn Read>,
    ) -> anyhow::Result<()>;
}

/// Adapts one typed sub-cache and its storage to the erased plugin surface.
pub struct SubCachePluginAdapter<D: CacheDescriptor, S: CacheStorage<D>> {
    sub: Arc<SubCache<D>>,
    storage: S,
}

impl<D: CacheDescriptor, S: CacheStorage<D>> SubCachePluginAdapter<D, S> {
    /// Creates the adapter around an empty sub-cache.
    pub fn new(storage: S) -> Self {
        Self {
            sub: Arc::new(SubCache::new()),
            storage,
        }
    }

    fn downcast_delta(delta: &mut (dyn Any + Send)) -> &mut CacheDelta<D> {
        delta
            .downcast_mut::<CacheDelta<D>>()
            .expect("sub-cache delta type mismatch")
    }
}

impl<D: CacheDescriptor, S: CacheStorage<D> + 'static> SubCachePlugin
    for SubCachePluginAdapter<D, S>
{
    fn name(&self) -> &'static str {
        D::NAME
    }

    fn descriptor_id(&self) -> TypeId {
        TypeId::of::<D>()
    }

    fn size(&self) -> usize {
        self.sub.size()
    }

    fn merkle_root(&self) -> RootHash {
        self.sub.merkle_root()
    }

    fn create_view(&self, height: Height) -> Box<dyn Any + Send + Sync> {
        Box::new(self.sub.create_view(height))
    }

    fn create_delta(&self, height: Height) -> Box<dyn Any + Send> {
        Box::new(self.sub.create_delta(height))
    }

    fn validate_pending(&self, delta: &mut (dyn Any + Send)) -> anyhow::Result<RootHash> {
        self.sub
            .validate_delta(Self::downcast_delta(delta))
            .with_context(|| format!("validating pending changes of cache {}", D::NAME))
    }

    fn commit_pending(&self, delta: Box<dyn Any + Send>) {
        let delta = delta
            .downcast::<CacheDelta<D>>()
            .expect("sub-cache delta type mismatch");
        self.sub.commit_delta(*delta);
    }

    fn prune(&self, height: Height) -> anyhow::Result<()> {
        if self.sub.already_pruned(height) {
            return Ok(());
        }

        let mut delta = self.sub.create_delta(height);
        let staged = delta.prune(height);
        if staged == 0 && !self.sub.has_expired_groups(height) {
            return Ok(());
        }

        self.sub
            .commit(delta)
            .with_context(|| format!("pruning cache {} at height {height}", D::NAME))?;
        tracing::debug!(cache = D::NAME, height, dropped = staged, "pruned sub-cache");
        Ok(())
    }

    fn save_all(&self, height: Height, writer: &mut dyn Write) -> Result<(), StorageError> {
        let view = self.sub.create_view(height);
        self.storage.save_all(&view, writer)
    }

    fn save_summary(&self, height: Height, writer: &mut dyn Write) -> Result<(), StorageError> {
        let delta = self.sub.create_delta(height);
        self.storage.save_summary(&delta, writer)
    }

    fn restore(
        &self,
        summary: Option<&mut dyn Read>,
        entries: Option<&mut dyn Read>,
    ) -> anyhow::Result<()> {
        let mut delta = self.sub.create_delta(0);
        match (summary, entries) {
            (Some(reader), _) => {
                self.storage
                    .load_summary(reader, &mut delta)
                    .with_context(|| format!("restoring summary of cache {}", D::NAME))?;
                tracing::debug!(cache = D::NAME, "restored cache summary");
            }
            (None, Some(reader)) => {
                self.storage
                    .load_all(reader, &mut delta)
                    .with_context(|| format!("replaying entries of cache {}", D::NAME))?;
                tracing::debug!(
                    cache = D::NAME,
                    entries = delta.len(),
                    "no summary checkpointed; replayed full entry set"
                );
            }
            (None, None) => return Ok(()),
        }
        self.sub
            .commit(delta)
            .with_context(|| format!("committing restored state of cache {}", D::NAME))
            .map(|_| ())
    }
}
