//! Versioned, disk-persisted mirrors of coordinator state

pub mod cluster_cache;
pub mod family;
pub mod path_lock;

pub use cluster_cache::{CacheDelta, CacheSnapshot, ClusterCache, UpdateCallback, COMMON_CLUSTER_ID};
pub use family::{CacheFamily, CacheKind};
