//! Cache store trait and the types it reports.
//!
//! A [`CacheStore`] is a namespace-partitioned map of [`CacheEntity`] values.
//! Writes are upserts (attributes replaced, relationships unioned) and
//! evictions. Both are visible to reads as soon as the call returns.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use stratus_core::{
    AgentScope, CacheEntity, CacheKey, StorageError, StratusError, StratusResult,
};

/// One atomic per-namespace write.
///
/// Merges are applied first, then explicit evictions. When `reconcile` is
/// set, every stored id whose key falls inside that scope and is not among
/// the merged ids is evicted as part of the same write.
#[derive(Debug, Clone, Default)]
pub struct NamespaceUpdate {
    pub merges: Vec<CacheEntity>,
    pub evictions: Vec<String>,
    pub reconcile: Option<AgentScope>,
}

impl NamespaceUpdate {
    pub fn new(merges: Vec<CacheEntity>, evictions: Vec<String>) -> Self {
        Self {
            merges,
            evictions,
            reconcile: None,
        }
    }

    /// Evict stored ids in `scope` that this update does not keep.
    pub fn reconciling(mut self, scope: AgentScope) -> Self {
        self.reconcile = Some(scope);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.merges.is_empty() && self.evictions.is_empty() && self.reconcile.is_none()
    }

    /// Ids a reconciling write would remove from `stored`.
    pub(crate) fn unlisted<'a, I>(&self, stored: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let Some(scope) = &self.reconcile else {
            return Vec::new();
        };
        let kept: HashSet<&str> = self.merges.iter().map(|e| e.id.as_str()).collect();
        stored
            .into_iter()
            .filter(|id| !kept.contains(id.as_str()))
            .filter(|id| {
                CacheKey::parse(id)
                    .map(|key| scope.covers(&key))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

/// What a namespace write actually changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceWrite {
    /// Entities upserted.
    pub merged: usize,
    /// Explicit evictions that removed a stored entity.
    pub evicted: usize,
    /// Entities removed by scope reconciliation.
    pub reconciled: usize,
}

/// Namespace-partitioned entity store.
///
/// Implementations must be safe to share between agent tasks and must apply
/// each [`NamespaceUpdate`] atomically. Entities carrying a positive TTL are
/// dropped lazily by reads once expired.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get one entity.
    async fn get(&self, namespace: &str, id: &str) -> StratusResult<Option<CacheEntity>>;

    /// Get every entity in a namespace.
    async fn get_all(&self, namespace: &str) -> StratusResult<Vec<CacheEntity>>;

    /// All ids stored in a namespace.
    async fn identifiers(&self, namespace: &str) -> StratusResult<Vec<String>>;

    /// Apply one atomic per-namespace write.
    async fn write(&self, namespace: &str, update: NamespaceUpdate)
        -> StratusResult<NamespaceWrite>;

    /// Remove entities stored before `cutoff`. Returns the number removed.
    async fn evict_older_than(&self, namespace: &str, cutoff: DateTime<Utc>)
        -> StratusResult<usize>;

    /// Namespaces holding at least one entity.
    async fn namespaces(&self) -> StratusResult<Vec<String>>;

    async fn stats(&self) -> StratusResult<CacheStats>;

    /// Get several entities; missing ids are omitted.
    async fn get_many(&self, namespace: &str, ids: &[String]) -> StratusResult<Vec<CacheEntity>> {
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get(namespace, id).await? {
                found.push(entity);
            }
        }
        Ok(found)
    }

    /// The subset of `ids` currently stored.
    async fn existing_identifiers(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> StratusResult<Vec<String>> {
        let stored: HashSet<String> = self.identifiers(namespace).await?.into_iter().collect();
        Ok(ids.iter().filter(|id| stored.contains(*id)).cloned().collect())
    }

    /// Ids matching a glob where `*` matches any run and `?` one character.
    async fn filter_identifiers(&self, namespace: &str, glob: &str) -> StratusResult<Vec<String>> {
        let pattern = glob_to_regex(glob)?;
        Ok(self
            .identifiers(namespace)
            .await?
            .into_iter()
            .filter(|id| pattern.is_match(id))
            .collect())
    }

    /// Upsert entities. Returns the number merged.
    async fn merge_all(&self, namespace: &str, entities: Vec<CacheEntity>) -> StratusResult<usize> {
        Ok(self
            .write(namespace, NamespaceUpdate::new(entities, Vec::new()))
            .await?
            .merged)
    }

    /// Evict ids; unknown ids are ignored. Returns the number removed.
    async fn evict_all(&self, namespace: &str, ids: Vec<String>) -> StratusResult<usize> {
        Ok(self
            .write(namespace, NamespaceUpdate::new(Vec::new(), ids))
            .await?
            .evicted)
    }

    /// Merge then evict as one atomic unit.
    async fn apply(
        &self,
        namespace: &str,
        merges: Vec<CacheEntity>,
        evictions: Vec<String>,
    ) -> StratusResult<NamespaceWrite> {
        self.write(namespace, NamespaceUpdate::new(merges, evictions))
            .await
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently stored.
    pub entry_count: u64,
    /// Entities removed by explicit or reconciling eviction.
    pub evictions: u64,
    /// Entities dropped because their TTL passed.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Atomic hit/miss/eviction counters shared by the backends.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
}

impl StatCounters {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        if n > 0 {
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, entry_count: u64) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
pub(crate) fn glob_to_regex(glob: &str) -> StratusResult<Regex> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| {
        StratusError::from(StorageError::Unavailable {
            reason: format!("invalid identifier filter '{}': {}", glob, e),
        })
    })
}
