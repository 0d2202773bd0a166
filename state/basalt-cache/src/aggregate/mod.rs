//! The type-indexed aggregate of sub-caches sharing one commit height.

mod cache;
mod plugin;

pub use cache::{
    DetachedDelta, StateCache, StateCacheBuilder, StateCacheDelta, StateCacheView, StateHash,
    StateHashInfo,
};
pub use plugin::{SubCachePlugin, SubCachePluginAdapter};
