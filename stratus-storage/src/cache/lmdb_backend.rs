//! LMDB-backed cache store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a durable,
//! memory-mapped key-value store for cached entities.
//!
//! # Layout
//!
//! - Key: [`NamespacedKey`], `namespace \0 id`
//! - Value: `[stored_at: 8 bytes, millis LE][json CacheEntity]`
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for lookups and namespace scans
//! - One write transaction per namespace write, so merges, evictions and
//!   reconciliation of a namespace commit together or not at all
//! - Statistics are tracked with atomic counters

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use stratus_core::{CacheEntity, StratusResult};

use super::namespace_key::NamespacedKey;
use super::traits::{CacheStats, CacheStore, NamespaceUpdate, NamespaceWrite, StatCounters};

/// Width of the stored-at header in front of every value.
const HEADER_LEN: usize = 8;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Namespace contains the key separator.
    #[error("Invalid namespace: {0:?}")]
    InvalidNamespace(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbCacheError to StratusError.
impl From<LmdbCacheError> for stratus_core::StratusError {
    fn from(e: LmdbCacheError) -> Self {
        stratus_core::StratusError::Storage(stratus_core::StorageError::TransactionFailed {
            reason: e.to_string(),
        })
    }
}

fn txn_err(e: heed::Error) -> LmdbCacheError {
    LmdbCacheError::Transaction(e.to_string())
}

fn encode_value(entity: &CacheEntity, stored_at: DateTime<Utc>) -> Result<Vec<u8>, LmdbCacheError> {
    let json =
        serde_json::to_vec(entity).map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;
    let mut bytes = Vec::with_capacity(HEADER_LEN + json.len());
    bytes.extend_from_slice(&stored_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

fn decode_stored_at(bytes: &[u8]) -> Result<DateTime<Utc>, LmdbCacheError> {
    let header: [u8; HEADER_LEN] = bytes
        .get(..HEADER_LEN)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| LmdbCacheError::Deserialization("Invalid timestamp".into()))?;
    DateTime::from_timestamp_millis(i64::from_le_bytes(header))
        .ok_or_else(|| LmdbCacheError::Deserialization("Timestamp out of range".into()))
}

fn decode_value(bytes: &[u8]) -> Result<(CacheEntity, DateTime<Utc>), LmdbCacheError> {
    let stored_at = decode_stored_at(bytes)?;
    let entity = serde_json::from_slice(&bytes[HEADER_LEN..])
        .map_err(|e| LmdbCacheError::Deserialization(e.to_string()))?;
    Ok((entity, stored_at))
}

/// LMDB-backed [`CacheStore`].
///
/// # Example
///
/// ```ignore
/// use stratus_storage::{CacheStore, LmdbCacheStore};
///
/// let store = LmdbCacheStore::new("/var/lib/stratus/cache", 1024)?;
/// store.merge_all("instances", entities).await?;
/// let ids = store.identifiers("instances").await?;
/// ```
pub struct LmdbCacheStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    counters: StatCounters,
}

impl LmdbCacheStore {
    /// Open or create a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        let map_size = max_size_mb.checked_mul(1024 * 1024).ok_or_else(|| {
            LmdbCacheError::EnvOpen(format!("map size of {}MB overflows", max_size_mb))
        })?;
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        Ok(Self {
            env,
            db,
            counters: StatCounters::default(),
        })
    }

    fn check_namespace(namespace: &str) -> Result<(), LmdbCacheError> {
        if NamespacedKey::is_valid_namespace(namespace) {
            Ok(())
        } else {
            Err(LmdbCacheError::InvalidNamespace(namespace.to_string()))
        }
    }

    /// Ids of a namespace, as seen by `txn`.
    fn ids_in(&self, txn: &RoTxn, namespace: &str) -> Result<Vec<String>, LmdbCacheError> {
        let prefix = NamespacedKey::namespace_prefix(namespace);
        let mut ids = Vec::new();
        for item in self.db.prefix_iter(txn, &prefix).map_err(txn_err)? {
            let (key, _) = item.map_err(txn_err)?;
            if let Some(decoded) = NamespacedKey::decode(key) {
                ids.push(decoded.id().to_string());
            }
        }
        Ok(ids)
    }

    /// Live entities of a namespace plus the keys of expired ones.
    fn scan(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<CacheEntity>, Vec<Vec<u8>>), LmdbCacheError> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let prefix = NamespacedKey::namespace_prefix(namespace);

        let mut live = Vec::new();
        let mut expired = Vec::new();
        for item in self.db.prefix_iter(&rtxn, &prefix).map_err(txn_err)? {
            let (key, value) = item.map_err(txn_err)?;
            let (entity, stored_at) = decode_value(value)?;
            if entity.is_expired(stored_at, now) {
                expired.push(key.to_vec());
            } else {
                live.push(entity);
            }
        }
        Ok((live, expired))
    }

    /// Delete keys that are still expired at `now`.
    fn expire(&self, keys: Vec<Vec<u8>>, now: DateTime<Utc>) -> Result<(), LmdbCacheError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let mut removed = 0;
        for key in &keys {
            let still_expired = match self.db.get(&wtxn, key).map_err(txn_err)? {
                Some(bytes) => {
                    let (entity, stored_at) = decode_value(bytes)?;
                    entity.is_expired(stored_at, now)
                }
                None => false,
            };
            if still_expired && self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        StatCounters::add(&self.counters.expirations, removed);
        Ok(())
    }
}

#[async_trait]
impl CacheStore for LmdbCacheStore {
    async fn get(&self, namespace: &str, id: &str) -> StratusResult<Option<CacheEntity>> {
        let now = Utc::now();
        let key = NamespacedKey::new(namespace, id).encode();

        let found = {
            let rtxn = self.env.read_txn().map_err(txn_err)?;
            match self.db.get(&rtxn, &key).map_err(txn_err)? {
                Some(bytes) => Some(decode_value(bytes)?),
                None => None,
            }
        };

        match found {
            Some((entity, stored_at)) if entity.is_expired(stored_at, now) => {
                self.expire(vec![key], now)?;
                StatCounters::add(&self.counters.misses, 1);
                Ok(None)
            }
            Some((entity, _)) => {
                StatCounters::add(&self.counters.hits, 1);
                Ok(Some(entity))
            }
            None => {
                StatCounters::add(&self.counters.misses, 1);
                Ok(None)
            }
        }
    }

    async fn get_all(&self, namespace: &str) -> StratusResult<Vec<CacheEntity>> {
        let now = Utc::now();
        let (live, expired) = self.scan(namespace, now)?;
        self.expire(expired, now)?;
        Ok(live)
    }

    async fn identifiers(&self, namespace: &str) -> StratusResult<Vec<String>> {
        let now = Utc::now();
        let (live, expired) = self.scan(namespace, now)?;
        self.expire(expired, now)?;
        Ok(live.into_iter().map(|entity| entity.id).collect())
    }

    async fn write(
        &self,
        namespace: &str,
        update: NamespaceUpdate,
    ) -> StratusResult<NamespaceWrite> {
        Self::check_namespace(namespace)?;
        let now = Utc::now();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;

        let reconcile = if update.reconcile.is_some() {
            let stored = self.ids_in(&wtxn, namespace)?;
            update.unlisted(&stored)
        } else {
            Vec::new()
        };

        let mut write = NamespaceWrite {
            merged: update.merges.len(),
            ..NamespaceWrite::default()
        };

        for incoming in update.merges {
            let key = NamespacedKey::new(namespace, &incoming.id).encode();
            let existing = match self.db.get(&wtxn, &key).map_err(txn_err)? {
                Some(bytes) => Some(decode_value(bytes)?),
                None => None,
            };
            let merged = match existing {
                Some((mut entity, stored_at)) if !entity.is_expired(stored_at, now) => {
                    entity.merge(incoming);
                    entity
                }
                _ => incoming,
            };
            let value = encode_value(&merged, now)?;
            self.db.put(&mut wtxn, &key, &value).map_err(txn_err)?;
        }

        for id in &update.evictions {
            let key = NamespacedKey::new(namespace, id).encode();
            if self.db.delete(&mut wtxn, &key).map_err(txn_err)? {
                write.evicted += 1;
            }
        }

        for id in &reconcile {
            let key = NamespacedKey::new(namespace, id).encode();
            if self.db.delete(&mut wtxn, &key).map_err(txn_err)? {
                write.reconciled += 1;
            }
        }

        wtxn.commit().map_err(txn_err)?;

        StatCounters::add(&self.counters.evictions, write.evicted + write.reconciled);
        Ok(write)
    }

    async fn evict_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> StratusResult<usize> {
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let prefix = NamespacedKey::namespace_prefix(namespace);

        let mut stale = Vec::new();
        for item in self.db.prefix_iter(&wtxn, &prefix).map_err(txn_err)? {
            let (key, value) = item.map_err(txn_err)?;
            if decode_stored_at(value)? < cutoff {
                stale.push(key.to_vec());
            }
        }

        let mut removed = 0;
        for key in &stale {
            if self.db.delete(&mut wtxn, key).map_err(txn_err)? {
                removed += 1;
            }
        }
        wtxn.commit().map_err(txn_err)?;

        StatCounters::add(&self.counters.evictions, removed);
        Ok(removed)
    }

    async fn namespaces(&self) -> StratusResult<Vec<String>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut names = BTreeSet::new();
        for item in self.db.iter(&rtxn).map_err(txn_err)? {
            let (key, _) = item.map_err(txn_err)?;
            if let Some(decoded) = NamespacedKey::decode(key) {
                names.insert(decoded.namespace().to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    async fn stats(&self) -> StratusResult<CacheStats> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let entry_count = self.db.len(&rtxn).map_err(txn_err)?;
        Ok(self.counters.snapshot(entry_count))
    }
}
