//! Tag-indexed result cache.
//!
//! - **Cacher**: read-through wrapper with double-checked population under a
//!   per-key distributed lock
//! - **Invalidator**: records the tags of every stored entry in the metadata
//!   index and evicts entries matching tag predicates
//! - **Locker**: majority-quorum lock with TTL leases
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! prefix = "monitor"
//! period_seconds = 1800
//! lock_ttl_ms = 4000
//! ```

mod cacher;
mod config;
mod error;
mod invalidator;
mod keys;
mod locker;
mod metadata;
mod store;
mod sync;
mod tags;
mod trigger;

pub use cacher::{CacheMode, CachedFn, Cacher, CacherBuilder, FunctionSpec};
pub use config::CacheConfig;
pub use error::CacheError;
pub use invalidator::CacheInvalidator;
pub use keys::{cache_key, lock_resource};
pub use locker::{
    FakeLocker, LockError, LockInstance, LockToken, Locker, MemoryLockInstance, RedLock,
};
pub use metadata::{
    CacheMetadata, IndexError, MemoryIndex, MetadataIndex, MetadataQuery, NewCacheMetadata,
};
pub use store::{CacheStore, MemoryStore, StoreError};
pub use tags::{
    MAX_TAG_INDEX_LEN, RESERVED_TAG, TagKind, TagScalar, TagSchema, TagSpec, TagType, TagValue,
    Tags, encode_tag_index, index_contains, like_patterns, tokens, validate_tag_name,
};
pub use trigger::{
    GET_RUNS, MONITOR_DEDICATED_COLUMN, MONITOR_INVALIDATE_BY, MONITOR_PREFIX, MonitorTrigger,
    get_runs_spec, monitor_invalidator,
};
