//! Stratus Test Utilities
//!
//! Centralized test infrastructure for the Stratus workspace:
//! - A scripted fake provider for agents under test
//! - A store wrapper with write failure injection
//! - Proptest generators for keys and entities
//! - Test fixtures for common scenarios
//! - Custom assertions for Stratus-specific validation

// Re-export core types for convenience
pub use stratus_core::{
    AgentDataType, AgentError, AgentScope, CacheEntity, CacheKey, CacheResult,
    CacheResultBuilder, KeyCodec, StorageError, StratusError, StratusResult,
};
pub use stratus_storage::{CacheStore, InMemoryCacheStore};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratus_storage::{CacheStats, NamespaceUpdate, NamespaceWrite};

// ============================================================================
// FAKE PROVIDER
// ============================================================================

/// Stand-in for a cloud provider API.
///
/// Each `describe` call consumes the next scripted snapshot; once the script
/// runs out the last snapshot is repeated. Failures can be injected for a
/// number of upcoming calls and every call is counted.
#[derive(Debug, Default)]
pub struct FakeProvider {
    script: Mutex<VecDeque<Vec<CacheEntity>>>,
    current: Mutex<Vec<CacheEntity>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider that always reports `entities`.
    pub fn with_snapshot(entities: Vec<CacheEntity>) -> Self {
        let provider = Self::new();
        provider.set_snapshot(entities);
        provider
    }

    /// Replace the steady-state snapshot.
    pub fn set_snapshot(&self, entities: Vec<CacheEntity>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = entities;
    }

    /// Queue a snapshot for a future call.
    pub fn push_snapshot(&self, entities: Vec<CacheEntity>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(entities);
    }

    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make every call wait `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Calls made so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// List every resource of `account`.
    ///
    /// The snapshot is taken when the call starts; any configured delay is
    /// spent afterwards, like a slow response carrying already-stale data.
    pub async fn describe(&self, account: &str) -> StratusResult<Vec<CacheEntity>> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let snapshot = if injected {
            None
        } else {
            let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(next) = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front()
            {
                *current = next;
            }
            Some(current.clone())
        };

        let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        snapshot.ok_or_else(|| {
            AgentError::ProviderFailed {
                account: account.to_string(),
                reason: "injected failure".to_string(),
            }
            .into()
        })
    }

    /// Look up one resource in the current snapshot without consuming the script.
    pub fn find(&self, id: &str) -> Option<CacheEntity> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entity| entity.id == id)
            .cloned()
    }
}

// ============================================================================
// FAILING STORE
// ============================================================================

/// Wraps a store and fails upcoming namespace writes on request.
///
/// Reads and successful writes go straight to the inner store. A failed
/// write leaves the inner store untouched.
pub struct FailingStore {
    inner: Arc<dyn CacheStore>,
    failures: AtomicUsize,
    only_namespace: Mutex<Option<String>>,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            failures: AtomicUsize::new(0),
            only_namespace: Mutex::new(None),
        }
    }

    /// Fail the next `n` writes to any namespace.
    pub fn fail_next_writes(&self, n: usize) {
        *self.only_namespace.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` writes to `namespace`; other namespaces succeed.
    pub fn fail_writes_to(&self, namespace: &str, n: usize) {
        *self.only_namespace.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(namespace.to_string());
        self.failures.store(n, Ordering::SeqCst);
    }

    fn should_fail(&self, namespace: &str) -> bool {
        let targeted = self
            .only_namespace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_deref()
            .map_or(true, |only| only == namespace);
        targeted
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
    }
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, namespace: &str, id: &str) -> StratusResult<Option<CacheEntity>> {
        self.inner.get(namespace, id).await
    }

    async fn get_all(&self, namespace: &str) -> StratusResult<Vec<CacheEntity>> {
        self.inner.get_all(namespace).await
    }

    async fn identifiers(&self, namespace: &str) -> StratusResult<Vec<String>> {
        self.inner.identifiers(namespace).await
    }

    async fn write(
        &self,
        namespace: &str,
        update: NamespaceUpdate,
    ) -> StratusResult<NamespaceWrite> {
        if self.should_fail(namespace) {
            return Err(StorageError::Unavailable {
                reason: format!("injected write failure for {}", namespace),
            }
            .into());
        }
        self.inner.write(namespace, update).await
    }

    async fn evict_older_than(
        &self,
        namespace: &str,
        cutoff: DateTime<Utc>,
    ) -> StratusResult<usize> {
        self.inner.evict_older_than(namespace, cutoff).await
    }

    async fn namespaces(&self) -> StratusResult<Vec<String>> {
        self.inner.namespaces().await
    }

    async fn stats(&self) -> StratusResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating Stratus types.

    use super::*;
    use proptest::prelude::*;
    use serde_json::Value;

    /// A key segment, including the characters the codec must escape.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9:%_./-]{1,16}"
    }

    /// Generate a CacheKey with up to three trailing fields.
    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        (
            arb_segment(),
            arb_segment(),
            arb_segment(),
            arb_segment(),
            prop::collection::vec(arb_segment(), 0..3),
        )
            .prop_map(|(provider, namespace, account, region, fields)| {
                CacheKey::new(provider, namespace, account, region, fields)
            })
    }

    /// Generate a JSON attribute value.
    pub fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z0-9 ]{0,12}".prop_map(Value::from),
        ]
    }

    /// Generate an entity keyed inside `scope` in `namespace`.
    pub fn arb_entity(scope: AgentScope, namespace: &'static str) -> impl Strategy<Value = CacheEntity> {
        (
            "i-[0-9a-f]{1,8}",
            prop::collection::btree_map("[a-z]{1,8}", arb_value(), 0..5),
            prop::collection::btree_set("sg-[0-9]{1,4}", 0..4),
        )
            .prop_map(move |(id, attributes, groups)| {
                let region = scope.region.clone().unwrap_or_else(|| "global".to_string());
                let key = CacheKey::new(
                    scope.provider.clone(),
                    namespace,
                    scope.account.clone(),
                    region,
                    vec![id],
                );
                let mut entity = CacheEntity::new(key.encode());
                entity.attributes = attributes;
                for group in groups {
                    entity = entity.with_relationship("securityGroups", group);
                }
                entity
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;
    use std::sync::Arc;

    pub const PROVIDER: &str = "aws";
    pub const ACCOUNT: &str = "prod";
    pub const REGION: &str = "us-east-1";
    pub const INSTANCES: &str = "instances";

    /// Codec for the fixture provider's instance keys.
    pub fn codec() -> KeyCodec {
        KeyCodec::new(PROVIDER)
            .with_namespace(INSTANCES, &["id"])
            .with_namespace("securityGroups", &["id"])
    }

    /// Encoded instance key in `account`/`region`.
    pub fn instance_key(account: &str, region: &str, id: &str) -> String {
        CacheKey::new(PROVIDER, INSTANCES, account, region, vec![id.to_string()]).encode()
    }

    /// A running instance in the fixture account and region.
    pub fn instance(id: &str) -> CacheEntity {
        instance_in(ACCOUNT, REGION, id)
    }

    pub fn instance_in(account: &str, region: &str, id: &str) -> CacheEntity {
        CacheEntity::new(instance_key(account, region, id))
            .with_attribute("name", id)
            .with_attribute("state", "running")
    }

    pub fn regional_scope() -> AgentScope {
        AgentScope::regional(PROVIDER, ACCOUNT, REGION)
    }

    /// A result keeping `entities` in `namespace`, present even when empty.
    pub fn keep_result(namespace: &str, entities: Vec<CacheEntity>) -> CacheResult {
        let mut builder = CacheResultBuilder::new();
        let ns = builder.namespace(namespace);
        ns.mark_complete();
        for entity in entities {
            ns.keep_entity(entity);
        }
        builder.build()
    }

    /// An in-memory store pre-loaded with `entities` in `namespace`.
    pub async fn seeded_store(
        namespace: &str,
        entities: Vec<CacheEntity>,
    ) -> StratusResult<Arc<InMemoryCacheStore>> {
        let store = Arc::new(InMemoryCacheStore::new());
        store.merge_all(namespace, entities).await?;
        Ok(store)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for Stratus-specific validation.

    use super::*;

    /// Assert that a namespace holds exactly `expected` ids.
    pub async fn assert_ids(store: &dyn CacheStore, namespace: &str, expected: &[String]) {
        let mut actual = store
            .identifiers(namespace)
            .await
            .unwrap_or_else(|e| panic!("identifiers({}) failed: {}", namespace, e));
        actual.sort();
        let mut expected = expected.to_vec();
        expected.sort();
        assert_eq!(actual, expected, "unexpected ids in namespace {}", namespace);
    }

    /// Assert that a StratusResult is an Agent error.
    #[track_caller]
    pub fn assert_agent_error<T: std::fmt::Debug>(result: &StratusResult<T>) {
        match result {
            Err(StratusError::Agent(_)) => {}
            other => panic!("Expected Agent error, got: {:?}", other),
        }
    }

    /// Assert that a StratusResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &StratusResult<T>) {
        match result {
            Err(StratusError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_fake_provider_script_and_failures() {
        let provider = FakeProvider::with_snapshot(vec![fixtures::instance("i-1")]);
        provider.push_snapshot(vec![fixtures::instance("i-2")]);
        provider.fail_next(1);

        assertions::assert_agent_error(&provider.describe("prod").await);
        assert_eq!(provider.describe("prod").await.unwrap()[0].id, fixtures::instance("i-2").id);
        assert_eq!(provider.describe("prod").await.unwrap()[0].id, fixtures::instance("i-2").id);
        assert_eq!(provider.calls(), 3);
        assert!(provider.find(&fixtures::instance_key("prod", "us-east-1", "i-2")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_provider_delay() {
        let provider = FakeProvider::new();
        provider.set_delay(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        assert!(provider.describe("prod").await.unwrap().is_empty());
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_failing_store_targets_one_namespace() {
        let inner: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new());
        let store = FailingStore::new(inner.clone());
        store.fail_writes_to("onDemand", 1);

        store
            .merge_all(fixtures::INSTANCES, vec![fixtures::instance("i-1")])
            .await
            .unwrap();
        let failed = store
            .merge_all("onDemand", vec![CacheEntity::new("x")])
            .await;
        assertions::assert_storage_error(&failed);
        assert!(inner.identifiers("onDemand").await.unwrap().is_empty());

        store.merge_all("onDemand", vec![CacheEntity::new("x")]).await.unwrap();
        assert_eq!(inner.identifiers("onDemand").await.unwrap(), vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_seeded_store() {
        let store = fixtures::seeded_store(
            fixtures::INSTANCES,
            vec![fixtures::instance("i-1"), fixtures::instance("i-2")],
        )
        .await
        .unwrap();
        assertions::assert_ids(
            store.as_ref(),
            fixtures::INSTANCES,
            &[
                fixtures::instance_key("prod", "us-east-1", "i-2"),
                fixtures::instance_key("prod", "us-east-1", "i-1"),
            ],
        )
        .await;
    }

    #[test]
    fn test_fixture_keys_parse_with_codec() {
        let key = fixtures::codec()
            .parse(&fixtures::instance("i-1").id)
            .unwrap();
        assert!(fixtures::regional_scope().covers(&key));
        assert_eq!(fixtures::codec().field(&key, "id"), Some("i-1"));
    }

    #[test]
    fn test_keep_result_marks_namespace_present() {
        let result = fixtures::keep_result(fixtures::INSTANCES, Vec::new());
        assert_eq!(result.kept(fixtures::INSTANCES).map(<[CacheEntity]>::len), Some(0));
    }

    proptest! {
        #[test]
        fn prop_generated_keys_roundtrip(key in generators::arb_cache_key()) {
            prop_assert_eq!(CacheKey::parse(&key.encode()).unwrap(), key);
        }

        #[test]
        fn prop_generated_entities_in_scope(
            entity in generators::arb_entity(fixtures::regional_scope(), fixtures::INSTANCES)
        ) {
            let key = CacheKey::parse(&entity.id).unwrap();
            prop_assert!(fixtures::regional_scope().covers(&key));
            prop_assert_eq!(key.namespace(), fixtures::INSTANCES);
        }
    }
}
