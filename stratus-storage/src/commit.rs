//! Commit and reconciliation of agent results.
//!
//! A [`Committer`] turns one agent's [`CacheResult`] into store writes:
//!
//! 1. every namespace in `keep` is merged and every namespace in `evict` is
//!    evicted, as one atomic write per namespace;
//! 2. for a scheduled run, each AUTHORITATIVE namespace present in `keep` is
//!    reconciled: stored ids inside the agent's scope that the run did not
//!    keep are evicted in that same write;
//! 3. INFORMATIVE namespaces are never reconciled;
//! 4. after a scheduled run, on-demand records for ids it kept in an
//!    authoritative namespace are dropped when they predate the run.
//!
//! A namespace absent from the result is left untouched. A namespace present
//! in `keep` with no entities asserts that the scope is now empty.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stratus_core::constants::{ATTR_CACHE_TIME, ATTR_NAMESPACE, ON_DEMAND_NAMESPACE};
use stratus_core::{AgentDataType, AgentScope, CacheEntity, CacheResult, StratusResult};
use tracing::debug;

use crate::cache::{CacheStore, NamespaceUpdate};

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// A periodic `load_data` run. Authoritative namespaces are reconciled.
    Scheduled,
    /// A single-resource refresh. Never reconciles.
    OnDemand,
}

/// Everything needed to commit one agent result.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub agent_type: String,
    pub scope: AgentScope,
    pub data_types: Vec<AgentDataType>,
    pub result: CacheResult,
    /// When the run began; on-demand records older than this are stale.
    pub started_at: DateTime<Utc>,
    pub kind: CommitKind,
}

/// Totals across every namespace a commit touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub merged: usize,
    pub evicted: usize,
    pub reconciled: usize,
    pub on_demand_evicted: usize,
    pub namespaces: Vec<String>,
}

/// Applies agent results to a [`CacheStore`].
#[derive(Clone)]
pub struct Committer {
    store: Arc<dyn CacheStore>,
}

impl Committer {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Commit a result.
    ///
    /// On error, namespaces already written stay written; the failing
    /// namespace is not partially applied.
    pub async fn commit(&self, request: CommitRequest) -> StratusResult<CommitSummary> {
        let CommitRequest {
            agent_type,
            scope,
            data_types,
            result,
            started_at,
            kind,
        } = request;

        let authoritative: HashSet<&str> = data_types
            .iter()
            .filter(|dt| dt.is_authoritative())
            .map(|dt| dt.namespace.as_str())
            .collect();

        let namespaces: Vec<String> = result.namespaces().into_iter().map(str::to_string).collect();
        let CacheResult {
            mut keep,
            mut evict,
            ..
        } = result;

        let mut summary = CommitSummary {
            namespaces: namespaces.clone(),
            ..CommitSummary::default()
        };
        let mut stale_candidates: Vec<(String, Vec<String>)> = Vec::new();

        for namespace in &namespaces {
            let kept = keep.remove(namespace);
            let reconcile = kind == CommitKind::Scheduled
                && kept.is_some()
                && authoritative.contains(namespace.as_str());

            let merges = kept.unwrap_or_default();
            if reconcile && namespace != ON_DEMAND_NAMESPACE {
                stale_candidates.push((
                    namespace.clone(),
                    merges.iter().map(|e| e.id.clone()).collect(),
                ));
            }

            let mut update =
                NamespaceUpdate::new(merges, evict.remove(namespace).unwrap_or_default());
            if reconcile {
                update = update.reconciling(scope.clone());
            }

            let write = self.store.write(namespace, update).await?;
            summary.merged += write.merged;
            summary.evicted += write.evicted;
            summary.reconciled += write.reconciled;
        }

        for (namespace, ids) in stale_candidates {
            summary.on_demand_evicted += self
                .evict_stale_on_demand(&namespace, &ids, started_at)
                .await?;
        }

        debug!(
            agent_type = %agent_type,
            scope = %scope,
            kind = ?kind,
            merged = summary.merged,
            evicted = summary.evicted,
            reconciled = summary.reconciled,
            on_demand_evicted = summary.on_demand_evicted,
            "Committed agent result"
        );

        Ok(summary)
    }

    /// Drop on-demand records for `ids` in `namespace` written before `started_at`.
    async fn evict_stale_on_demand(
        &self,
        namespace: &str,
        ids: &[String],
        started_at: DateTime<Utc>,
    ) -> StratusResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let cutoff = started_at.timestamp_millis();
        let stale: Vec<String> = self
            .store
            .get_many(ON_DEMAND_NAMESPACE, ids)
            .await?
            .into_iter()
            .filter(|record| is_stale_record(record, namespace, cutoff))
            .map(|record| record.id)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }
        self.store.evict_all(ON_DEMAND_NAMESPACE, stale).await
    }
}

fn is_stale_record(record: &CacheEntity, namespace: &str, cutoff_millis: i64) -> bool {
    let same_namespace = record.attribute(ATTR_NAMESPACE).and_then(Value::as_str) == Some(namespace);
    let cache_time = record.attribute(ATTR_CACHE_TIME).and_then(Value::as_i64);
    same_namespace && cache_time.is_some_and(|t| t < cutoff_millis)
}
