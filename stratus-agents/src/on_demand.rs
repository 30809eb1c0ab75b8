//! On-demand refresh
//!
//! Between scheduled polls a single resource can be refreshed out of band.
//! The refresh is committed immediately and also recorded in the `onDemand`
//! namespace, keyed by the resource id, so the next scheduled run can tell
//! whether its own (older) snapshot should be shadowed by the refresh.
//!
//! Record attributes:
//!
//! - `cacheTime`: when the refresh was written (epoch millis)
//! - `processedCount`: scheduled runs that have seen the record
//! - `processedTime`: when a scheduled run last saw it (epoch millis, `-1` before)
//! - `namespace`: namespace of the refreshed resource
//! - `cacheResults`: the keep-map the refresh produced

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use stratus_core::constants::{
    ATTR_CACHE_RESULTS, ATTR_CACHE_TIME, ATTR_NAMESPACE, ATTR_PROCESSED_COUNT,
    ATTR_PROCESSED_TIME, ON_DEMAND_MAX_PROCESSED_COUNT,
};
use stratus_core::{
    AgentDataType, AgentError, AgentScope, CacheEntity, CacheKey, CacheResult,
    CacheResultBuilder, OnDemandConfig, StorageError, StratusError, StratusResult,
    ON_DEMAND_NAMESPACE,
};
use stratus_storage::{CacheStore, CommitKind, CommitRequest};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::scheduler::{shutdown_signalled, AgentScheduler};

// ============================================================================
// REQUEST / RESULT
// ============================================================================

/// Key of the namespace being refreshed in a raw request map.
pub const REQUEST_NAMESPACE_KEY: &str = "namespace";

/// Key of the eviction flag in a raw request map.
pub const REQUEST_EVICT_KEY: &str = "evict";

/// A request to refresh one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDemandRequest {
    /// Namespace of the resource; also the on-demand type agents match on.
    pub namespace: String,
    /// Provider-specific coordinates (`account`, `region`, `name`, ...).
    pub params: HashMap<String, String>,
    /// The caller already knows the resource is gone.
    pub evict: bool,
}

impl OnDemandRequest {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            params: HashMap::new(),
            evict: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn evicting(mut self) -> Self {
        self.evict = true;
        self
    }

    /// Parse a flat string map as sent by the trigger API.
    pub fn from_map(mut raw: HashMap<String, String>) -> Result<Self, AgentError> {
        let namespace = raw
            .remove(REQUEST_NAMESPACE_KEY)
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| AgentError::InvalidOnDemandRequest {
                reason: format!("missing '{}'", REQUEST_NAMESPACE_KEY),
            })?;

        let evict = match raw.remove(REQUEST_EVICT_KEY) {
            None => false,
            Some(flag) => match flag.to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(AgentError::InvalidOnDemandRequest {
                        reason: format!("'{}' must be true or false, got '{}'", REQUEST_EVICT_KEY, flag),
                    })
                }
            },
        };

        Ok(Self {
            namespace,
            params: raw,
            evict,
        })
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// What an on-demand agent produced for one request.
#[derive(Debug, Clone)]
pub struct OnDemandResult {
    pub source_agent_type: String,
    pub cache_result: CacheResult,
    /// Resources to evict from their real namespaces.
    pub evictions: BTreeMap<String, Vec<String>>,
    pub data_types: Vec<AgentDataType>,
    pub scope: AgentScope,
}

impl OnDemandResult {
    /// A refreshed resource: the agent's result plus an on-demand record
    /// carrying that result for the next scheduled run.
    pub fn refreshed(
        source_agent_type: impl Into<String>,
        data_types: Vec<AgentDataType>,
        scope: AgentScope,
        namespace: &str,
        id: &str,
        builder: &CacheResultBuilder,
    ) -> StratusResult<Self> {
        let mut cache_result = builder.build();
        let record = OnDemandRecord::build(id, namespace, Utc::now(), &cache_result.keep)?;
        cache_result
            .keep
            .entry(ON_DEMAND_NAMESPACE.to_string())
            .or_default()
            .push(record.to_entity());

        Ok(Self {
            source_agent_type: source_agent_type.into(),
            cache_result,
            evictions: BTreeMap::new(),
            data_types,
            scope,
        })
    }

    /// A resource the provider no longer has.
    pub fn evicted(
        source_agent_type: impl Into<String>,
        data_types: Vec<AgentDataType>,
        scope: AgentScope,
        namespace: &str,
        id: &str,
    ) -> Self {
        let mut cache_result = CacheResult::empty();
        cache_result
            .evict
            .insert(ON_DEMAND_NAMESPACE.to_string(), vec![id.to_string()]);

        let mut evictions = BTreeMap::new();
        evictions.insert(namespace.to_string(), vec![id.to_string()]);

        Self {
            source_agent_type: source_agent_type.into(),
            cache_result,
            evictions,
            data_types,
            scope,
        }
    }

    /// Entities kept outside the `onDemand` namespace.
    fn resource_keep_count(&self) -> usize {
        self.cache_result
            .keep
            .iter()
            .filter(|(ns, _)| ns.as_str() != ON_DEMAND_NAMESPACE)
            .map(|(_, entities)| entities.len())
            .sum()
    }

    /// Fold explicit evictions into the cache result.
    fn into_cache_result(self) -> CacheResult {
        let mut result = self.cache_result;
        for (namespace, ids) in self.evictions {
            result.evict.entry(namespace).or_default().extend(ids);
        }
        result
    }
}

/// A refresh recorded in `onDemand` that scheduled runs have not yet retired.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOnDemand {
    pub id: String,
    pub namespace: String,
    /// Key coordinates of the refreshed resource.
    pub details: BTreeMap<String, String>,
    pub cache_time: i64,
    pub processed_count: i64,
    pub processed_time: i64,
}

impl PendingOnDemand {
    fn from_record(record: &OnDemandRecord) -> Self {
        let mut details = BTreeMap::new();
        if let Ok(key) = CacheKey::parse(&record.id) {
            details.insert("provider".to_string(), key.provider().to_string());
            details.insert("account".to_string(), key.account().to_string());
            details.insert("region".to_string(), key.region().to_string());
            if !key.fields().is_empty() {
                details.insert("name".to_string(), key.fields().join(":"));
            }
        }

        Self {
            id: record.id.clone(),
            namespace: record.namespace.clone(),
            details,
            cache_time: record.cache_time,
            processed_count: record.processed_count,
            processed_time: record.processed_time,
        }
    }
}

// ============================================================================
// ON-DEMAND AGENT
// ============================================================================

/// Capability of agents that can refresh single resources.
#[async_trait]
pub trait OnDemandAgent: Send + Sync {
    fn on_demand_agent_type(&self) -> String;

    /// Whether this agent refreshes `on_demand_type` resources of `provider`.
    fn handles(&self, on_demand_type: &str, provider: &str) -> bool;

    /// Refresh one resource. `None` means the request is not for this agent.
    async fn handle(
        &self,
        store: &dyn CacheStore,
        request: &OnDemandRequest,
    ) -> StratusResult<Option<OnDemandResult>>;

    /// Refreshes in this agent's scope still waiting to be retired.
    async fn pending_on_demand_requests(
        &self,
        store: &dyn CacheStore,
    ) -> StratusResult<Vec<PendingOnDemand>>;
}

// ============================================================================
// RECORDS
// ============================================================================

/// Typed view of an `onDemand` entity.
#[derive(Debug, Clone, PartialEq)]
pub struct OnDemandRecord {
    pub id: String,
    pub namespace: String,
    pub cache_time: i64,
    pub processed_count: i64,
    pub processed_time: i64,
    cache_results: Value,
}

impl OnDemandRecord {
    /// A fresh record for a refresh written at `cache_time`.
    pub fn build(
        id: impl Into<String>,
        namespace: impl Into<String>,
        cache_time: DateTime<Utc>,
        cache_results: &BTreeMap<String, Vec<CacheEntity>>,
    ) -> StratusResult<Self> {
        let id = id.into();
        let cache_results = serde_json::to_value(cache_results).map_err(|e| {
            StratusError::from(StorageError::Serialization {
                namespace: ON_DEMAND_NAMESPACE.to_string(),
                id: id.clone(),
                reason: e.to_string(),
            })
        })?;

        Ok(Self {
            id,
            namespace: namespace.into(),
            cache_time: cache_time.timestamp_millis(),
            processed_count: 0,
            processed_time: -1,
            cache_results,
        })
    }

    /// Read a stored record. Missing counters default to zero.
    pub fn from_entity(entity: &CacheEntity) -> Self {
        let int = |key: &str, default: i64| {
            entity
                .attribute(key)
                .and_then(Value::as_i64)
                .unwrap_or(default)
        };

        Self {
            id: entity.id.clone(),
            namespace: entity
                .attribute(ATTR_NAMESPACE)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            cache_time: int(ATTR_CACHE_TIME, 0),
            processed_count: int(ATTR_PROCESSED_COUNT, 0),
            processed_time: int(ATTR_PROCESSED_TIME, -1),
            cache_results: entity
                .attribute(ATTR_CACHE_RESULTS)
                .cloned()
                .unwrap_or(Value::Null),
        }
    }

    pub fn to_entity(&self) -> CacheEntity {
        CacheEntity::new(self.id.clone())
            .with_attribute(ATTR_CACHE_TIME, self.cache_time)
            .with_attribute(ATTR_PROCESSED_COUNT, self.processed_count)
            .with_attribute(ATTR_PROCESSED_TIME, self.processed_time)
            .with_attribute(ATTR_NAMESPACE, self.namespace.clone())
            .with_attribute(ATTR_CACHE_RESULTS, self.cache_results.clone())
    }

    /// The keep-map the refresh produced. Accepts an embedded JSON string.
    pub fn cache_results(&self) -> StratusResult<BTreeMap<String, Vec<CacheEntity>>> {
        let parsed = match &self.cache_results {
            Value::Null => return Ok(BTreeMap::new()),
            Value::String(raw) => serde_json::from_str(raw),
            other => serde_json::from_value(other.clone()),
        };
        parsed.map_err(|e| {
            StratusError::from(StorageError::Serialization {
                namespace: ON_DEMAND_NAMESPACE.to_string(),
                id: self.id.clone(),
                reason: e.to_string(),
            })
        })
    }

    /// Record that a scheduled run saw this refresh.
    pub fn mark_processed(&mut self, now: DateTime<Utc>) {
        self.processed_count += 1;
        self.processed_time = now.timestamp_millis();
    }

    /// Keep while newer than the run or seen by fewer than two runs.
    ///
    /// The processed-count branch only retains records for informative
    /// namespaces. For authoritative namespaces a scheduled commit already
    /// evicts every record older than the run's start.
    pub fn should_keep(&self, run_started: DateTime<Utc>) -> bool {
        self.should_overlay(run_started) || self.processed_count < ON_DEMAND_MAX_PROCESSED_COUNT
    }

    /// The refresh is newer than the run's snapshot.
    pub fn should_overlay(&self, run_started: DateTime<Utc>) -> bool {
        self.cache_time >= run_started.timestamp_millis()
    }
}

/// What [`merge_pending_on_demand`] did to the accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingMerge {
    /// Records carried forward in `onDemand`.
    pub kept: usize,
    /// Records retired.
    pub evicted: usize,
    /// Records whose results replaced polled data.
    pub overlaid: usize,
}

/// Reconcile pending on-demand records with a scheduled run's snapshot.
///
/// Call from `load_data` after the polled entities are in `builder`. For each
/// record among `ids`: bump its processed counters, keep or retire it, and
/// when the refresh is newer than `run_started` overlay its results onto the
/// polled entities, oldest refresh first.
pub async fn merge_pending_on_demand(
    store: &dyn CacheStore,
    builder: &mut CacheResultBuilder,
    ids: &[String],
    run_started: DateTime<Utc>,
) -> StratusResult<PendingMerge> {
    let mut merge = PendingMerge::default();
    if ids.is_empty() {
        return Ok(merge);
    }

    let now = Utc::now();
    let mut retained = Vec::new();
    for entity in store.get_many(ON_DEMAND_NAMESPACE, ids).await? {
        let mut record = OnDemandRecord::from_entity(&entity);
        let keep = record.should_keep(run_started);
        record.mark_processed(now);
        if keep {
            retained.push(record);
        } else {
            builder.on_demand().evict(record.id);
            merge.evicted += 1;
        }
    }

    retained.sort_by_key(|record| record.cache_time);

    for record in &retained {
        if !record.should_overlay(run_started) {
            continue;
        }
        match record.cache_results() {
            Ok(results) => {
                info!(id = %record.id, "On-demand entry is overwriting polled data");
                for (namespace, entities) in results {
                    let target = builder.namespace(&namespace);
                    for entity in entities {
                        target.keep_entity(entity);
                    }
                }
                merge.overlaid += 1;
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Skipping unreadable on-demand results");
            }
        }
    }

    for record in retained {
        builder.on_demand().keep_entity(record.to_entity());
        merge.kept += 1;
    }

    Ok(merge)
}

/// Pending refreshes whose resource key falls inside `scope`.
pub async fn pending_in_scope(
    store: &dyn CacheStore,
    scope: &AgentScope,
) -> StratusResult<Vec<PendingOnDemand>> {
    let ids: Vec<String> = store
        .identifiers(ON_DEMAND_NAMESPACE)
        .await?
        .into_iter()
        .filter(|id| CacheKey::parse(id).is_ok_and(|key| scope.covers(&key)))
        .collect();

    Ok(store
        .get_many(ON_DEMAND_NAMESPACE, &ids)
        .await?
        .iter()
        .map(|entity| PendingOnDemand::from_record(&OnDemandRecord::from_entity(entity)))
        .collect())
}

// ============================================================================
// UPDATER
// ============================================================================

/// Result of routing one on-demand request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnDemandOutcome {
    /// The resource was refreshed.
    Updated {
        agent_type: String,
        merged: usize,
        evicted: usize,
    },
    /// The resource is gone and was evicted.
    Evicted { agent_type: String, evicted: usize },
    /// No registered agent accepted the request.
    NotHandled,
}

/// Routes on-demand requests to the scheduler's on-demand agents.
#[derive(Clone)]
pub struct OnDemandUpdater {
    scheduler: Arc<AgentScheduler>,
}

impl OnDemandUpdater {
    pub fn new(scheduler: Arc<AgentScheduler>) -> Self {
        Self { scheduler }
    }

    /// Parse a raw request map and route it.
    pub async fn handle_map(
        &self,
        provider: &str,
        raw: HashMap<String, String>,
    ) -> StratusResult<OnDemandOutcome> {
        let request = OnDemandRequest::from_map(raw)?;
        self.handle(provider, &request).await
    }

    /// Offer `request` to every matching agent and commit the first result.
    ///
    /// An agent error does not stop routing; it is returned only when no
    /// other agent handled the request.
    pub async fn handle(
        &self,
        provider: &str,
        request: &OnDemandRequest,
    ) -> StratusResult<OnDemandOutcome> {
        let committer = self.scheduler.committer();
        let store = committer.store().clone();
        let mut first_error = None;

        for agent in self.scheduler.on_demand_agents().await {
            let Some(on_demand) = agent.as_on_demand() else {
                continue;
            };
            if !on_demand.handles(&request.namespace, provider) {
                continue;
            }

            let started_at = Utc::now();
            let result = match on_demand.handle(store.as_ref(), request).await {
                Ok(Some(result)) => result,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        agent_type = %on_demand.on_demand_agent_type(),
                        namespace = %request.namespace,
                        error = %e,
                        "On-demand refresh failed"
                    );
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };

            let agent_type = result.source_agent_type.clone();
            let refreshed = result.resource_keep_count();
            let has_evictions = !result.evictions.is_empty();
            let summary = committer
                .commit(CommitRequest {
                    agent_type: agent_type.clone(),
                    scope: result.scope.clone(),
                    data_types: result.data_types.clone(),
                    result: result.into_cache_result(),
                    started_at,
                    kind: CommitKind::OnDemand,
                })
                .await?;

            info!(
                agent_type = %agent_type,
                namespace = %request.namespace,
                merged = summary.merged,
                evicted = summary.evicted,
                "On-demand refresh committed"
            );

            return Ok(if refreshed == 0 && has_evictions {
                OnDemandOutcome::Evicted {
                    agent_type,
                    evicted: summary.evicted,
                }
            } else {
                OnDemandOutcome::Updated {
                    agent_type,
                    merged: summary.merged,
                    evicted: summary.evicted,
                }
            });
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(OnDemandOutcome::NotHandled),
        }
    }

    /// Pending refreshes across every on-demand agent of `provider`.
    pub async fn pending_requests(&self, provider: &str) -> StratusResult<Vec<PendingOnDemand>> {
        let store = self.scheduler.committer().store().clone();
        let mut seen = HashSet::new();
        let mut pending = Vec::new();

        for agent in self.scheduler.on_demand_agents().await {
            if agent.provider_name() != provider {
                continue;
            }
            let Some(on_demand) = agent.as_on_demand() else {
                continue;
            };
            for request in on_demand.pending_on_demand_requests(store.as_ref()).await? {
                if seen.insert(request.id.clone()) {
                    pending.push(request);
                }
            }
        }

        Ok(pending)
    }
}

// ============================================================================
// CLEANUP TASK
// ============================================================================

/// Counters for the on-demand cleanup task.
#[derive(Debug, Default)]
pub struct OnDemandCleanupMetrics {
    pub cleanup_cycles: AtomicU64,
    pub records_evicted: AtomicU64,
    pub cleanup_errors: AtomicU64,
}

impl OnDemandCleanupMetrics {
    pub fn snapshot(&self) -> OnDemandCleanupSnapshot {
        OnDemandCleanupSnapshot {
            cleanup_cycles: self.cleanup_cycles.load(Ordering::Relaxed),
            records_evicted: self.records_evicted.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OnDemandCleanupSnapshot {
    pub cleanup_cycles: u64,
    pub records_evicted: u64,
    pub cleanup_errors: u64,
}

/// Periodically evict on-demand records older than `config.max_age`.
///
/// Runs until `shutdown_rx` carries `true` or its sender is dropped.
pub async fn on_demand_cleanup_task(
    store: Arc<dyn CacheStore>,
    config: OnDemandConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<OnDemandCleanupMetrics> {
    let metrics = Arc::new(OnDemandCleanupMetrics::default());

    let mut cleanup_interval = interval(config.cleanup_interval);
    cleanup_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        cleanup_interval_secs = config.cleanup_interval.as_secs(),
        max_age_secs = config.max_age.as_secs(),
        "On-demand cleanup task started"
    );

    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown_rx) => {
                info!("On-demand cleanup task shutting down");
                break;
            }
            _ = cleanup_interval.tick() => {
                cleanup_on_demand(store.as_ref(), &config, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    info!(
        cleanup_cycles = snapshot.cleanup_cycles,
        records_evicted = snapshot.records_evicted,
        cleanup_errors = snapshot.cleanup_errors,
        "On-demand cleanup task completed"
    );

    metrics
}

/// One cleanup cycle. Returns the number of records evicted.
async fn cleanup_on_demand(
    store: &dyn CacheStore,
    config: &OnDemandConfig,
    metrics: &OnDemandCleanupMetrics,
) -> usize {
    metrics.cleanup_cycles.fetch_add(1, Ordering::Relaxed);

    let cutoff = ChronoDuration::from_std(config.max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age));
    let Some(cutoff) = cutoff else {
        debug!("On-demand max age out of range, skipping cleanup");
        return 0;
    };

    match store.evict_older_than(ON_DEMAND_NAMESPACE, cutoff).await {
        Ok(0) => {
            trace!("On-demand cleanup cycle found nothing to evict");
            0
        }
        Ok(evicted) => {
            metrics
                .records_evicted
                .fetch_add(evicted as u64, Ordering::Relaxed);
            info!(evicted, "Evicted expired on-demand records");
            evicted
        }
        Err(e) => {
            warn!(error = %e, "On-demand cleanup failed");
            metrics.cleanup_errors.fetch_add(1, Ordering::Relaxed);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use stratus_storage::InMemoryCacheStore;

    const ID: &str = "aws:instances:prod:us-east-1:i-1";

    fn millis(t: DateTime<Utc>) -> i64 {
        t.timestamp_millis()
    }

    fn record_at(cache_time: DateTime<Utc>, processed_count: i64) -> OnDemandRecord {
        let mut keep = BTreeMap::new();
        keep.insert(
            "instances".to_string(),
            vec![CacheEntity::new(ID).with_attribute("state", "stopped")],
        );
        let mut record = OnDemandRecord::build(ID, "instances", cache_time, &keep).unwrap();
        record.processed_count = processed_count;
        record
    }

    #[test]
    fn test_request_from_map() {
        let mut raw = HashMap::new();
        raw.insert("namespace".to_string(), "instances".to_string());
        raw.insert("evict".to_string(), "TRUE".to_string());
        raw.insert("account".to_string(), "prod".to_string());

        let request = OnDemandRequest::from_map(raw).unwrap();
        assert_eq!(request.namespace, "instances");
        assert!(request.evict);
        assert_eq!(request.param("account"), Some("prod"));
        assert!(request.param("namespace").is_none());
    }

    #[test]
    fn test_request_from_map_rejects_bad_input() {
        assert!(matches!(
            OnDemandRequest::from_map(HashMap::new()),
            Err(AgentError::InvalidOnDemandRequest { .. })
        ));

        let mut raw = HashMap::new();
        raw.insert("namespace".to_string(), "instances".to_string());
        raw.insert("evict".to_string(), "maybe".to_string());
        assert!(matches!(
            OnDemandRequest::from_map(raw),
            Err(AgentError::InvalidOnDemandRequest { .. })
        ));
    }

    #[test]
    fn test_record_entity_roundtrip() {
        let now = Utc::now();
        let record = record_at(now, 1);
        let restored = OnDemandRecord::from_entity(&record.to_entity());
        assert_eq!(restored, record);
        assert_eq!(restored.cache_time, millis(now));
        assert_eq!(restored.processed_time, -1);

        let results = restored.cache_results().unwrap();
        assert_eq!(results["instances"][0].id, ID);
    }

    #[test]
    fn test_record_accepts_embedded_json_string() {
        let keep = serde_json::json!({ "instances": [CacheEntity::new(ID)] });
        let entity = CacheEntity::new(ID)
            .with_attribute(ATTR_CACHE_RESULTS, keep.to_string())
            .with_attribute(ATTR_NAMESPACE, "instances");
        let record = OnDemandRecord::from_entity(&entity);
        assert_eq!(record.cache_time, 0);
        assert_eq!(record.cache_results().unwrap()["instances"].len(), 1);

        let broken = CacheEntity::new(ID).with_attribute(ATTR_CACHE_RESULTS, "{not json");
        assert!(OnDemandRecord::from_entity(&broken).cache_results().is_err());
    }

    #[test]
    fn test_should_keep_and_overlay() {
        let run_started = Utc::now();
        let before = run_started - ChronoDuration::seconds(30);
        let after = run_started + ChronoDuration::seconds(1);

        assert!(record_at(after, 5).should_keep(run_started));
        assert!(record_at(after, 5).should_overlay(run_started));

        assert!(record_at(before, 1).should_keep(run_started));
        assert!(!record_at(before, 1).should_overlay(run_started));

        assert!(!record_at(before, 2).should_keep(run_started));
    }

    #[test]
    fn test_mark_processed() {
        let now = Utc::now();
        let mut record = record_at(now, 0);
        record.mark_processed(now);
        assert_eq!(record.processed_count, 1);
        assert_eq!(record.processed_time, millis(now));
    }

    #[tokio::test]
    async fn test_merge_pending_overlays_newer_refresh() {
        let store = InMemoryCacheStore::new();
        let run_started = Utc::now() - ChronoDuration::seconds(5);
        store
            .merge_all(ON_DEMAND_NAMESPACE, vec![record_at(Utc::now(), 0).to_entity()])
            .await
            .unwrap();

        let mut builder = CacheResultBuilder::new();
        builder
            .namespace("instances")
            .keep(ID)
            .attribute("state", "running")
            .attribute("type", "m5.large");

        let merge = merge_pending_on_demand(&store, &mut builder, &[ID.to_string()], run_started)
            .await
            .unwrap();
        assert_eq!(
            merge,
            PendingMerge {
                kept: 1,
                evicted: 0,
                overlaid: 1
            }
        );

        let result = builder.build();
        let instance = &result.kept("instances").unwrap()[0];
        assert_eq!(instance.attribute("state"), Some(&Value::from("stopped")));
        assert_eq!(instance.attribute("type"), Some(&Value::from("m5.large")));

        let record = OnDemandRecord::from_entity(&result.kept(ON_DEMAND_NAMESPACE).unwrap()[0]);
        assert_eq!(record.processed_count, 1);
        assert!(record.processed_time > 0);
    }

    #[tokio::test]
    async fn test_merge_pending_retires_processed_records() {
        let store = InMemoryCacheStore::new();
        let run_started = Utc::now();
        let old = run_started - ChronoDuration::minutes(5);
        store
            .merge_all(ON_DEMAND_NAMESPACE, vec![record_at(old, 2).to_entity()])
            .await
            .unwrap();

        let mut builder = CacheResultBuilder::new();
        builder.namespace("instances").keep(ID).attribute("state", "running");

        let merge = merge_pending_on_demand(
            &store,
            &mut builder,
            &[ID.to_string(), "aws:instances:prod:us-east-1:i-9".to_string()],
            run_started,
        )
        .await
        .unwrap();
        assert_eq!(merge.evicted, 1);
        assert_eq!(merge.overlaid, 0);

        let result = builder.build();
        assert_eq!(result.evicted(ON_DEMAND_NAMESPACE).unwrap(), &[ID.to_string()]);
        assert_eq!(
            result.kept("instances").unwrap()[0].attribute("state"),
            Some(&Value::from("running"))
        );
    }

    #[tokio::test]
    async fn test_pending_in_scope() {
        let store = InMemoryCacheStore::new();
        let now = Utc::now();
        let other = "aws:instances:test:us-east-1:i-2";
        store
            .merge_all(
                ON_DEMAND_NAMESPACE,
                vec![
                    record_at(now, 0).to_entity(),
                    OnDemandRecord::build(other, "instances", now, &BTreeMap::new())
                        .unwrap()
                        .to_entity(),
                ],
            )
            .await
            .unwrap();

        let pending = pending_in_scope(&store, &AgentScope::account_wide("aws", "prod"))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ID);
        assert_eq!(pending[0].details["account"], "prod");
        assert_eq!(pending[0].details["name"], "i-1");
    }

    #[test]
    fn test_result_constructors() {
        let scope = AgentScope::regional("aws", "prod", "us-east-1");
        let data_types = vec![AgentDataType::authoritative("instances")];

        let mut builder = CacheResultBuilder::new();
        builder.namespace("instances").keep(ID).attribute("state", "running");
        let refreshed =
            OnDemandResult::refreshed("agent", data_types.clone(), scope.clone(), "instances", ID, &builder)
                .unwrap();
        assert_eq!(refreshed.resource_keep_count(), 1);
        let record = OnDemandRecord::from_entity(
            &refreshed.cache_result.kept(ON_DEMAND_NAMESPACE).unwrap()[0],
        );
        assert_eq!(record.namespace, "instances");
        assert_eq!(record.processed_count, 0);

        let evicted = OnDemandResult::evicted("agent", data_types, scope, "instances", ID);
        assert_eq!(evicted.resource_keep_count(), 0);
        let result = evicted.into_cache_result();
        assert_eq!(result.evicted("instances").unwrap(), &[ID.to_string()]);
        assert_eq!(result.evicted(ON_DEMAND_NAMESPACE).unwrap(), &[ID.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_evicts_and_stops() {
        let store: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        store
            .merge_all(ON_DEMAND_NAMESPACE, vec![record_at(Utc::now(), 0).to_entity()])
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));

        let config = OnDemandConfig {
            max_age: Duration::ZERO,
            cleanup_interval: Duration::from_secs(60),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(on_demand_cleanup_task(store.clone(), config, shutdown_rx));

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown_tx.send(true).unwrap();
        let metrics = handle.await.unwrap().snapshot();

        assert!(metrics.cleanup_cycles >= 1);
        assert_eq!(metrics.records_evicted, 1);
        assert!(store.identifiers(ON_DEMAND_NAMESPACE).await.unwrap().is_empty());
    }
}
