//! Namespace-partitioned cache store.
//!
//! [`CacheStore`] is the only shared mutable state in Stratus. Two backends
//! implement it:
//!
//! - [`InMemoryCacheStore`]: a locked map, for tests and single-process use
//! - [`LmdbCacheStore`]: durable, memory-mapped LMDB via heed
//!
//! Both apply a [`NamespaceUpdate`] atomically and drop TTL-expired entities
//! lazily on read.

pub mod lmdb_backend;
pub mod memory;
pub mod namespace_key;
pub mod traits;

pub use lmdb_backend::{LmdbCacheError, LmdbCacheStore};
pub use memory::InMemoryCacheStore;
pub use namespace_key::NamespacedKey;
pub use traits::{CacheStats, CacheStore, NamespaceUpdate, NamespaceWrite};
