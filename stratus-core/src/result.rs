//! Result accumulator.
//!
//! Agents build a [`CacheResult`] incrementally while walking provider
//! responses: the same entity may be touched from several responses (an
//! instance first seen in a server group listing, later enriched from a
//! health check), so entity builders are memoized per id.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::constants::ON_DEMAND_NAMESPACE;
use crate::entities::{Attributes, CacheEntity, CacheResult, Relationships};
use crate::NO_EXPIRY;

/// Accumulates keep/evict entries for every namespace touched by one run.
#[derive(Debug, Clone)]
pub struct CacheResultBuilder {
    start_time: DateTime<Utc>,
    namespaces: BTreeMap<String, NamespaceBuilder>,
    introspection: BTreeMap<String, Value>,
}

impl Default for CacheResultBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheResultBuilder {
    /// Create a builder stamped with the current time.
    pub fn new() -> Self {
        Self {
            start_time: Utc::now(),
            namespaces: BTreeMap::new(),
            introspection: BTreeMap::new(),
        }
    }

    /// Override the run start time (used for on-demand staleness checks).
    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// Get or create the builder for a namespace.
    pub fn namespace(&mut self, name: &str) -> &mut NamespaceBuilder {
        self.namespaces.entry(name.to_string()).or_default()
    }

    /// Shortcut for the reserved on-demand namespace.
    pub fn on_demand(&mut self) -> &mut NamespaceBuilder {
        self.namespace(ON_DEMAND_NAMESPACE)
    }

    /// Record a free-form run detail for logging.
    pub fn introspection(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.introspection.insert(key.into(), value.into());
        self
    }

    /// Whether any namespace has been touched.
    pub fn has_namespace(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    /// Snapshot the accumulated state as a [`CacheResult`].
    ///
    /// Namespaces with nothing to keep or evict are omitted unless marked
    /// complete. The builder stays usable afterwards.
    pub fn build(&self) -> CacheResult {
        let mut result = CacheResult {
            introspection: self.introspection.clone(),
            ..CacheResult::default()
        };

        for (name, ns) in &self.namespaces {
            let kept: Vec<CacheEntity> = ns.keep.values().map(CacheEntityBuilder::build).collect();
            let evicted: Vec<String> = ns
                .evict
                .iter()
                .filter(|id| !ns.keep.contains_key(*id))
                .cloned()
                .collect();

            if !kept.is_empty() || ns.complete {
                result.keep.insert(name.clone(), kept);
            }
            if !evicted.is_empty() {
                result.evict.insert(name.clone(), evicted);
            }
        }

        result
    }
}

/// Accumulates keep/evict entries for a single namespace.
#[derive(Debug, Clone, Default)]
pub struct NamespaceBuilder {
    keep: BTreeMap<String, CacheEntityBuilder>,
    evict: BTreeSet<String>,
    complete: bool,
}

impl NamespaceBuilder {
    /// Get or create the entity builder for `id`.
    pub fn keep(&mut self, id: &str) -> &mut CacheEntityBuilder {
        self.keep
            .entry(id.to_string())
            .or_insert_with(|| CacheEntityBuilder::new(id))
    }

    /// Merge a prebuilt entity into this namespace.
    ///
    /// Attributes are overwritten key by key and relationships unioned with
    /// anything already accumulated for the id.
    pub fn keep_entity(&mut self, entity: CacheEntity) -> &mut Self {
        let builder = self.keep(&entity.id);
        builder.attributes.extend(entity.attributes);
        for (namespace, ids) in entity.relationships {
            builder.relationships.entry(namespace).or_default().extend(ids);
        }
        builder.ttl_seconds = entity.ttl_seconds;
        self
    }

    /// Request eviction of `id`. A keep of the same id takes precedence.
    pub fn evict(&mut self, id: impl Into<String>) -> &mut Self {
        self.evict.insert(id.into());
        self
    }

    /// Keep this namespace in the result even with nothing to keep, asserting
    /// that the agent's scope now holds zero entities here.
    pub fn mark_complete(&mut self) -> &mut Self {
        self.complete = true;
        self
    }

    pub fn is_kept(&self, id: &str) -> bool {
        self.keep.contains_key(id)
    }

    /// Peek at an accumulated entity without creating it.
    pub fn get(&self, id: &str) -> Option<&CacheEntityBuilder> {
        self.keep.get(id)
    }

    pub fn keep_count(&self) -> usize {
        self.keep.len()
    }

    pub fn evict_count(&self) -> usize {
        self.evict.iter().filter(|id| !self.keep.contains_key(*id)).count()
    }
}

/// Incrementally built [`CacheEntity`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntityBuilder {
    id: String,
    attributes: Attributes,
    relationships: Relationships,
    ttl_seconds: i64,
}

impl CacheEntityBuilder {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            attributes: Attributes::new(),
            relationships: Relationships::new(),
            ttl_seconds: NO_EXPIRY,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attributes(&mut self, attributes: Attributes) -> &mut Self {
        self.attributes.extend(attributes);
        self
    }

    pub fn relationship(&mut self, namespace: impl Into<String>, id: impl Into<String>) -> &mut Self {
        self.relationships
            .entry(namespace.into())
            .or_default()
            .insert(id.into());
        self
    }

    pub fn relationships<I, S>(&mut self, namespace: impl Into<String>, ids: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relationships
            .entry(namespace.into())
            .or_default()
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn ttl_seconds(&mut self, ttl_seconds: i64) -> &mut Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn get_attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn build(&self) -> CacheEntity {
        CacheEntity {
            id: self.id.clone(),
            attributes: self.attributes.clone(),
            relationships: self.relationships.clone(),
            ttl_seconds: self.ttl_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keep_is_memoized_per_id() {
        let mut builder = CacheResultBuilder::new();
        builder
            .namespace("instances")
            .keep("i-1")
            .attribute("state", "running");
        builder
            .namespace("instances")
            .keep("i-1")
            .attribute("zone", "us-east-1a")
            .relationship("serverGroups", "sg-1");

        let result = builder.build();
        let kept = result.kept("instances").unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].attribute("state"), Some(&json!("running")));
        assert_eq!(kept[0].attribute("zone"), Some(&json!("us-east-1a")));
        assert_eq!(kept[0].related("serverGroups").count(), 1);
    }

    #[test]
    fn test_empty_namespace_omitted_unless_complete() {
        let mut builder = CacheResultBuilder::new();
        builder.namespace("instances");
        builder.namespace("images").mark_complete();

        let result = builder.build();
        assert!(result.kept("instances").is_none());
        assert_eq!(result.kept("images").map(<[_]>::len), Some(0));
        assert!(result.evicted("images").is_none());
    }

    #[test]
    fn test_keep_wins_over_evict() {
        let mut builder = CacheResultBuilder::new();
        let ns = builder.namespace("instances");
        ns.evict("i-1").evict("i-2");
        ns.keep("i-1");

        assert_eq!(ns.keep_count(), 1);
        assert_eq!(ns.evict_count(), 1);

        let result = builder.build();
        assert_eq!(result.kept("instances").unwrap()[0].id, "i-1");
        assert_eq!(result.evicted("instances").unwrap(), &["i-2".to_string()]);
    }

    #[test]
    fn test_keep_entity_merges_into_existing() {
        let mut builder = CacheResultBuilder::new();
        builder
            .namespace("instances")
            .keep("i-1")
            .attribute("state", "running")
            .attribute("zone", "a")
            .relationship("serverGroups", "sg-1");

        builder.namespace("instances").keep_entity(
            CacheEntity::new("i-1")
                .with_attribute("state", "stopped")
                .with_relationship("serverGroups", "sg-2")
                .with_ttl(30),
        );

        let entity = &builder.build().keep["instances"][0];
        assert_eq!(entity.attribute("state"), Some(&json!("stopped")));
        assert_eq!(entity.attribute("zone"), Some(&json!("a")));
        assert_eq!(entity.related("serverGroups").count(), 2);
        assert_eq!(entity.ttl_seconds, 30);
    }

    #[test]
    fn test_build_is_a_snapshot() {
        let mut builder = CacheResultBuilder::new();
        builder.namespace("instances").keep("i-1");
        let first = builder.build();

        builder.namespace("instances").keep("i-2");
        let second = builder.build();

        assert_eq!(first.keep_count(), 1);
        assert_eq!(second.keep_count(), 2);
    }

    #[test]
    fn test_relationships_and_ttl() {
        let mut builder = CacheResultBuilder::new();
        builder
            .namespace("loadBalancers")
            .keep("lb-1")
            .relationships("instances", ["i-1", "i-2", "i-1"])
            .ttl_seconds(120);

        let entity = &builder.build().keep["loadBalancers"][0];
        assert_eq!(entity.related("instances").collect::<Vec<_>>(), vec!["i-1", "i-2"]);
        assert_eq!(entity.ttl_seconds, 120);
    }

    #[test]
    fn test_on_demand_and_introspection() {
        let start = Utc::now() - chrono::Duration::seconds(10);
        let mut builder = CacheResultBuilder::new().with_start_time(start);
        builder.on_demand().evict("i-1");
        builder.introspection("elapsed_ms", 42);

        assert_eq!(builder.start_time(), start);
        assert!(builder.has_namespace(ON_DEMAND_NAMESPACE));

        let result = builder.build();
        assert_eq!(result.evicted(ON_DEMAND_NAMESPACE).map(<[_]>::len), Some(1));
        assert_eq!(result.introspection["elapsed_ms"], json!(42));
    }
}
