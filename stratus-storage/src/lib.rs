//! Stratus Storage - Cache Store and Commit
//!
//! Defines the [`CacheStore`] abstraction, its in-memory and LMDB backends,
//! and the [`Committer`] that applies agent results with authoritative
//! reconciliation.

pub mod cache;
pub mod commit;

pub use cache::{
    CacheStats, CacheStore, InMemoryCacheStore, LmdbCacheError, LmdbCacheStore, NamespaceUpdate,
    NamespaceWrite, NamespacedKey,
};
pub use commit::{CommitKind, CommitRequest, CommitSummary, Committer};

use std::sync::Arc;

use stratus_core::{StoreBackend, StoreConfig, StratusResult};

/// Open the store selected by configuration.
pub fn open_store(config: &StoreConfig) -> StratusResult<Arc<dyn CacheStore>> {
    match &config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryCacheStore::new())),
        StoreBackend::Lmdb { path, max_size_mb } => {
            Ok(Arc::new(LmdbCacheStore::new(path, *max_size_mb)?))
        }
    }
}
