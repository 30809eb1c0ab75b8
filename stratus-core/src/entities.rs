//! Cache entity types
//!
//! The unit of storage is [`CacheEntity`]; one agent run produces a
//! [`CacheResult`]. Agents declare what they own through [`AgentDataType`]
//! and the [`AgentScope`] they were built for.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::CacheKey;
use crate::NO_EXPIRY;

/// Arbitrary JSON-like data describing a resource at last observation.
pub type Attributes = BTreeMap<String, Value>;

/// Namespace name to the set of related entity ids.
pub type Relationships = BTreeMap<String, BTreeSet<String>>;

fn default_ttl() -> i64 {
    NO_EXPIRY
}

// ============================================================================
// CACHE ENTITY
// ============================================================================

/// A single cached resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntity {
    /// Unique within its namespace, produced by the key codec.
    pub id: String,
    /// Replaced wholesale on every merge.
    #[serde(default)]
    pub attributes: Attributes,
    /// Unioned on every merge.
    #[serde(default)]
    pub relationships: Relationships,
    /// Seconds until the entry may be lazily evicted; `-1` never expires.
    #[serde(default = "default_ttl")]
    pub ttl_seconds: i64,
}

impl CacheEntity {
    /// Create an entity with no attributes, relationships or expiry.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: Attributes::new(),
            relationships: Relationships::new(),
            ttl_seconds: NO_EXPIRY,
        }
    }

    /// Set a single attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Add one relationship to an entity in another namespace.
    pub fn with_relationship(mut self, namespace: impl Into<String>, id: impl Into<String>) -> Self {
        self.relationships
            .entry(namespace.into())
            .or_default()
            .insert(id.into());
        self
    }

    /// Set the time-to-live in seconds.
    pub fn with_ttl(mut self, ttl_seconds: i64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Get an attribute by name.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Get the related ids for a namespace (empty if none).
    pub fn related(&self, namespace: &str) -> impl Iterator<Item = &str> {
        self.relationships
            .get(namespace)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    /// Whether this entity carries a positive TTL.
    pub fn has_ttl(&self) -> bool {
        self.ttl_seconds > 0
    }

    /// When this entity expires, given the time it was stored.
    pub fn expires_at(&self, stored_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.has_ttl() {
            Some(stored_at + ChronoDuration::seconds(self.ttl_seconds))
        } else {
            None
        }
    }

    /// Check whether the entity is expired at `now`.
    pub fn is_expired(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(stored_at).is_some_and(|at| at <= now)
    }

    /// Merge an incoming observation of the same id into this entity.
    ///
    /// Attributes and TTL are replaced wholesale; relationships are unioned.
    pub fn merge(&mut self, incoming: CacheEntity) {
        debug_assert_eq!(self.id, incoming.id);
        self.attributes = incoming.attributes;
        self.ttl_seconds = incoming.ttl_seconds;
        for (namespace, ids) in incoming.relationships {
            self.relationships.entry(namespace).or_default().extend(ids);
        }
    }
}

// ============================================================================
// CACHE RESULT
// ============================================================================

/// The atomic output of one agent run.
///
/// A namespace absent from both maps means the agent has no opinion about
/// it this run. A namespace present in `keep` with an empty list is an
/// assertion that the agent's scope now holds zero entities there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheResult {
    /// Entities to merge, by namespace.
    #[serde(default)]
    pub keep: BTreeMap<String, Vec<CacheEntity>>,
    /// Ids to evict, by namespace.
    #[serde(default)]
    pub evict: BTreeMap<String, Vec<String>>,
    /// Free-form run details (timings, counts) for logging only.
    #[serde(default)]
    pub introspection: BTreeMap<String, Value>,
}

impl CacheResult {
    /// An empty result with no opinion about any namespace.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the result carries no keep or evict entries at all.
    pub fn is_empty(&self) -> bool {
        self.keep.is_empty() && self.evict.is_empty()
    }

    /// All namespaces mentioned by the result, sorted.
    pub fn namespaces(&self) -> BTreeSet<&str> {
        self.keep
            .keys()
            .chain(self.evict.keys())
            .map(String::as_str)
            .collect()
    }

    /// Entities kept for a namespace, if the namespace is present.
    pub fn kept(&self, namespace: &str) -> Option<&[CacheEntity]> {
        self.keep.get(namespace).map(Vec::as_slice)
    }

    /// Ids evicted for a namespace, if the namespace is present.
    pub fn evicted(&self, namespace: &str) -> Option<&[String]> {
        self.evict.get(namespace).map(Vec::as_slice)
    }

    /// Total number of kept entities across namespaces.
    pub fn keep_count(&self) -> usize {
        self.keep.values().map(Vec::len).sum()
    }

    /// Total number of evicted ids across namespaces.
    pub fn evict_count(&self) -> usize {
        self.evict.values().map(Vec::len).sum()
    }
}

// ============================================================================
// AGENT DATA TYPES AND SCOPE
// ============================================================================

/// How much of a namespace an agent owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Authority {
    /// Single source of truth for the namespace within the agent's scope.
    Authoritative,
    /// Contributes entities without owning the full enumeration.
    Informative,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authority::Authoritative => write!(f, "AUTHORITATIVE"),
            Authority::Informative => write!(f, "INFORMATIVE"),
        }
    }
}

/// Declares an agent's authority over one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentDataType {
    pub namespace: String,
    pub authority: Authority,
}

impl AgentDataType {
    pub fn authoritative(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            authority: Authority::Authoritative,
        }
    }

    pub fn informative(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            authority: Authority::Informative,
        }
    }

    pub fn is_authoritative(&self) -> bool {
        self.authority == Authority::Authoritative
    }
}

/// The (provider, account, region) slice of a namespace an agent answers for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentScope {
    pub provider: String,
    pub account: String,
    /// `None` covers every region of the account.
    pub region: Option<String>,
}

impl AgentScope {
    /// Scope covering one region of an account.
    pub fn regional(
        provider: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            account: account.into(),
            region: Some(region.into()),
        }
    }

    /// Scope covering every region of an account.
    pub fn account_wide(provider: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            account: account.into(),
            region: None,
        }
    }

    /// Whether a parsed key falls inside this scope.
    pub fn covers(&self, key: &CacheKey) -> bool {
        key.provider() == self.provider
            && key.account() == self.account
            && self.region.as_deref().is_none_or(|r| r == key.region())
    }
}

impl fmt::Display for AgentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.region {
            Some(region) => write!(f, "{}/{}/{}", self.provider, self.account, region),
            None => write!(f, "{}/{}/*", self.provider, self.account),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_replaces_attributes_and_unions_relationships() {
        let mut existing = CacheEntity::new("i-1")
            .with_attribute("state", "running")
            .with_attribute("zone", "a")
            .with_relationship("serverGroups", "sg-1");
        let incoming = CacheEntity::new("i-1")
            .with_attribute("state", "stopped")
            .with_relationship("serverGroups", "sg-2")
            .with_relationship("loadBalancers", "lb-1");

        existing.merge(incoming);

        assert_eq!(existing.attribute("state"), Some(&json!("stopped")));
        assert_eq!(existing.attribute("zone"), None);
        assert_eq!(
            existing.related("serverGroups").collect::<Vec<_>>(),
            vec!["sg-1", "sg-2"]
        );
        assert_eq!(existing.related("loadBalancers").count(), 1);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let entity = CacheEntity::new("i-1")
            .with_attribute("state", "running")
            .with_relationship("serverGroups", "sg-1");

        let mut once = entity.clone();
        once.merge(entity.clone());
        let mut twice = once.clone();
        twice.merge(entity.clone());

        assert_eq!(once, entity);
        assert_eq!(twice, entity);
    }

    #[test]
    fn test_ttl_expiry() {
        let stored_at = Utc::now();
        let no_ttl = CacheEntity::new("a");
        assert!(!no_ttl.has_ttl());
        assert!(no_ttl.expires_at(stored_at).is_none());
        assert!(!no_ttl.is_expired(stored_at, stored_at + ChronoDuration::days(365)));

        let ttl = CacheEntity::new("b").with_ttl(60);
        assert!(!ttl.is_expired(stored_at, stored_at + ChronoDuration::seconds(59)));
        assert!(ttl.is_expired(stored_at, stored_at + ChronoDuration::seconds(60)));
    }

    #[test]
    fn test_entity_deserializes_with_defaults() {
        let entity: CacheEntity = serde_json::from_value(json!({ "id": "x" })).unwrap();
        assert_eq!(entity.ttl_seconds, NO_EXPIRY);
        assert!(entity.attributes.is_empty());
        assert!(entity.relationships.is_empty());
    }

    #[test]
    fn test_cache_result_namespaces_and_counts() {
        let mut result = CacheResult::empty();
        assert!(result.is_empty());

        result
            .keep
            .insert("instances".into(), vec![CacheEntity::new("a"), CacheEntity::new("b")]);
        result.evict.insert("images".into(), vec!["c".into()]);

        assert_eq!(
            result.namespaces().into_iter().collect::<Vec<_>>(),
            vec!["images", "instances"]
        );
        assert_eq!(result.keep_count(), 2);
        assert_eq!(result.evict_count(), 1);
        assert!(result.kept("images").is_none());
        assert_eq!(result.evicted("images").map(|ids| ids.len()), Some(1));
    }

    #[test]
    fn test_scope_covers() {
        let key = CacheKey::new("aws", "instances", "prod", "us-east-1", vec!["i-1".into()]);

        assert!(AgentScope::regional("aws", "prod", "us-east-1").covers(&key));
        assert!(AgentScope::account_wide("aws", "prod").covers(&key));
        assert!(!AgentScope::regional("aws", "prod", "eu-west-1").covers(&key));
        assert!(!AgentScope::regional("aws", "test", "us-east-1").covers(&key));
        assert!(!AgentScope::account_wide("gce", "prod").covers(&key));
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(
            AgentScope::regional("aws", "prod", "us-east-1").to_string(),
            "aws/prod/us-east-1"
        );
        assert_eq!(AgentScope::account_wide("aws", "prod").to_string(), "aws/prod/*");
    }
}
