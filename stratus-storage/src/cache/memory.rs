//! In-memory cache store.
//!
//! A single `RwLock` over `namespace -> id -> entity`. Every namespace write
//! runs under one write guard, which is what makes it atomic. No guard is
//! ever held across an await.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratus_core::{CacheEntity, StorageError, StratusResult};

use super::traits::{CacheStats, CacheStore, NamespaceUpdate, NamespaceWrite, StatCounters};

type Namespaces = HashMap<String, HashMap<String, StoredEntity>>;

#[derive(Debug, Clone)]
struct StoredEntity {
    entity: CacheEntity,
    stored_at: DateTime<Utc>,
}

impl StoredEntity {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.entity.is_expired(self.stored_at, now)
    }
}

/// Process-local [`CacheStore`].
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    data: RwLock<Namespaces>,
    counters: StatCounters,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities in a namespace, expired ones included.
    pub fn len(&self, namespace: &str) -> usize {
        self.data
            .read()
            .map(|data| data.get(namespace).map_or(0, HashMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().map(|data| data.is_empty()).unwrap_or(true)
    }

    /// Drop everything.
    pub fn clear(&self) -> StratusResult<()> {
        self.write_guard()?.clear();
        Ok(())
    }

    fn read_guard(&self) -> StratusResult<RwLockReadGuard<'_, Namespaces>> {
        self.data
            .read()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    fn write_guard(&self) -> StratusResult<RwLockWriteGuard<'_, Namespaces>> {
        self.data
            .write()
            .map_err(|_| StorageError::LockPoisoned.into())
    }

    /// Drop expired entities of a namespace before a bulk read.
    fn expire_namespace(&self, namespace: &str, now: DateTime<Utc>) -> StratusResult<()> {
        let any_expired = self
            .read_guard()?
            .get(namespace)
            .is_some_and(|entries| entries.values().any(|s| s.is_expired(now)));
        if !any_expired {
            return Ok(());
        }

        let mut data = self.write_guard()?;
        if let Some(entries) = data.get_mut(namespace) {
            let before = entries.len();
            entries.retain(|_, stored| !stored.is_expired(now));
            StatCounters::add(&self.counters.expirations, before - entries.len());
            if entries.is_empty() {
                data.remove(namespace);
            }
        }
        Ok(())
    }

    /// Remove one entity if it is still expired.
    fn expire_one(&self, namespace: &str, id: &str, now: DateTime<Utc>) -> StratusResult<()> {
        let mut data = self.write_guard()?;
        if let Some(entries) = data.get_mut(namespace) {
            if entries.get(id).is_some_and(|s| s.is_expired(now)) {
                entries.remove(id);
                StatCounters::add(&self.counters.expirations, 1);
            }
            if entries.is_empty() {
                data.remove(namespace);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, namespace: &str, id: &str) -> StratusResult<Option<CacheEntity>> {
        let now = Utc::now();
        let found = self
            .read_guard()?
            .get(namespace)
            .and_then(|entries| entries.get(id))
            .cloned();

        match found {
            Some(stored) if stored.is_expired(now) => {
                self.expire_one(namespace, id, now)?;
                StatCounters::add(&self.counters.misses, 1);
                Ok(None)
            }
            Some(stored) => {
                StatCounters::add(&self.counters.hits, 1);
                Ok(Some(stored.entity))
            }
            None => {
                StatCounters::add(&self.counters.misses, 1);
                Ok(None)
            }
        }
    }

    async fn get_all(&self, namespace: &str) -> StratusResult<Vec<CacheEntity>> {
        self.expire_namespace(namespace, Utc::now())?;
        let data = self.read_guard()?;
        let mut entities: Vec<CacheEntity> = data
            .get(namespace)
            .map(|entries| entries.values().map(|s| s.entity.clone()).collect())
            .unwrap_or_default();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entities)
    }

    async fn identifiers(&self, namespace: &str) -> StratusResult<Vec<String>> {
        self.expire_namespace(namespace, Utc::now())?;
        let data = self.read_guard()?;
        let mut ids: Vec<String> = data
            .get(namespace)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn write(
        &self,
        namespace: &str,
        update: NamespaceUpdate,
    ) -> StratusResult<NamespaceWrite> {
        let now = Utc::now();
        let mut data = self.write_guard()?;
        let entries = data.entry(namespace.to_string()).or_default();

        let reconcile = update.unlisted(entries.keys());
        let mut write = NamespaceWrite {
            merged: update.merges.len(),
            ..NamespaceWrite::default()
        };

        for incoming in update.merges {
            let live = entries
                .get(&incoming.id)
                .is_some_and(|stored| !stored.is_expired(now));
            match entries.get_mut(&incoming.id) {
                Some(stored) if live => {
                    stored.entity.merge(incoming);
                    stored.stored_at = now;
                }
                _ => {
                    entries.insert(
                        incoming.id.clone(),
                        StoredEntity {
                            entity: incoming,
                            stored_at: now,
                        },
                    );
                }
            }
        }

        for id in &update.evictions {
            if entries.remove(id).is_some() {
                write.evicted += 1;
            }
        }

        for id in &reconcile {
            if entries.remove(id).is_some() {
                write.reconciled += 1;
            }
        }

        if entries.is_empty() {
            data.remove(namespace);
        }

        StatCounters::add(&self.counters.evictions, write.evicted + write.reconciled);
        Ok(write)
    }

    async fn evict_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> StratusResult<usize> {
        let mut data = self.write_guard()?;
        let Some(entries) = data.get_mut(namespace) else {
            return Ok(0);
        };

        let before = entries.len();
        entries.retain(|_, stored| stored.stored_at >= cutoff);
        let removed = before - entries.len();
        if entries.is_empty() {
            data.remove(namespace);
        }

        StatCounters::add(&self.counters.evictions, removed);
        Ok(removed)
    }

    async fn namespaces(&self) -> StratusResult<Vec<String>> {
        let data = self.read_guard()?;
        let mut names: Vec<String> = data
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn stats(&self) -> StratusResult<CacheStats> {
        let entry_count = self.read_guard()?.values().map(HashMap::len).sum::<usize>();
        Ok(self.counters.snapshot(entry_count as u64))
    }
}
