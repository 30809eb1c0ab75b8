//! Cache key codec.
//!
//! Every cached entity id is a [`CacheKey`] rendered to a single string:
//!
//! ```text
//! {provider}:{namespace}:{account}:{region}[:{field}]*
//! ```
//!
//! Segments are escaped (`%` as `%25`, `:` as `%3A`) so any string content
//! round-trips and no two distinct keys share an encoding. Which trailing
//! fields a namespace carries is described by a provider's [`KeyCodec`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::KeyError;

/// Segment delimiter.
const DELIMITER: char = ':';

/// Number of segments every key carries before namespace-specific fields.
const FIXED_SEGMENTS: usize = 4;

/// A structured cache key.
///
/// Fields are private so a key can only be produced by [`CacheKey::new`] or
/// a successful parse, never half-filled.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    provider: String,
    namespace: String,
    account: String,
    region: String,
    fields: Vec<String>,
}

impl CacheKey {
    /// Create a new key from its parts.
    pub fn new(
        provider: impl Into<String>,
        namespace: impl Into<String>,
        account: impl Into<String>,
        region: impl Into<String>,
        fields: Vec<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            namespace: namespace.into(),
            account: account.into(),
            region: region.into(),
            fields,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Namespace-specific trailing fields, in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Encode this key to its string form.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        let segments = [
            &self.provider,
            &self.namespace,
            &self.account,
            &self.region,
        ]
        .into_iter()
        .chain(self.fields.iter());

        for (i, segment) in segments.enumerate() {
            if i > 0 {
                out.push(DELIMITER);
            }
            escape_into(segment, &mut out);
        }
        out
    }

    /// Decode a key without any namespace schema.
    ///
    /// Fails if the key is empty, has fewer than four segments, or contains
    /// an escape sequence `encode` would never produce.
    pub fn parse(key: &str) -> Result<Self, KeyError> {
        if key.is_empty() {
            return Err(KeyError::Empty);
        }

        let raw: Vec<&str> = key.split(DELIMITER).collect();
        if raw.len() < FIXED_SEGMENTS {
            return Err(KeyError::TooFewSegments {
                key: key.to_string(),
                expected: FIXED_SEGMENTS,
                found: raw.len(),
            });
        }

        let mut segments = raw
            .into_iter()
            .map(unescape)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();

        // Length checked above.
        let provider = segments.next().unwrap_or_default();
        let namespace = segments.next().unwrap_or_default();
        let account = segments.next().unwrap_or_default();
        let region = segments.next().unwrap_or_default();

        Ok(Self {
            provider,
            namespace,
            account,
            region,
            fields: segments.collect(),
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn escape_into(segment: &str, out: &mut String) {
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
}

fn unescape(segment: &str) -> Result<String, KeyError> {
    if !segment.contains('%') {
        return Ok(segment.to_string());
    }

    let invalid = || KeyError::InvalidEscape {
        segment: segment.to_string(),
    };

    let mut out = String::with_capacity(segment.len());
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match (chars.next(), chars.next()) {
            (Some('2'), Some('5')) => out.push('%'),
            (Some('3'), Some('A')) => out.push(':'),
            _ => return Err(invalid()),
        }
    }
    Ok(out)
}

// ============================================================================
// PROVIDER CODEC
// ============================================================================

/// Provider-specific key schema.
///
/// Each namespace declares the names of the trailing fields its keys carry.
/// `build` and `parse` reject keys that do not match the declared schema.
///
/// ```
/// use stratus_core::KeyCodec;
///
/// let codec = KeyCodec::new("aws")
///     .with_namespace("instances", &["instanceId"])
///     .with_namespace("serverGroups", &["cluster", "serverGroup"]);
///
/// let key = codec.build("instances", "prod", "us-east-1", &["i-0abc"]).unwrap();
/// assert_eq!(key, "aws:instances:prod:us-east-1:i-0abc");
///
/// let parsed = codec.parse(&key).unwrap();
/// assert_eq!(codec.field(&parsed, "instanceId"), Some("i-0abc"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    provider: String,
    schemas: BTreeMap<String, Vec<String>>,
}

impl KeyCodec {
    /// Create a codec with no namespaces registered.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            schemas: BTreeMap::new(),
        }
    }

    /// Register a namespace and the names of its trailing fields.
    pub fn with_namespace(mut self, namespace: impl Into<String>, fields: &[&str]) -> Self {
        self.schemas.insert(
            namespace.into(),
            fields.iter().map(|f| (*f).to_string()).collect(),
        );
        self
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Registered namespaces, sorted.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Build an encoded key for a registered namespace.
    pub fn build(
        &self,
        namespace: &str,
        account: &str,
        region: &str,
        fields: &[&str],
    ) -> Result<String, KeyError> {
        self.check_arity(namespace, fields.len())?;
        Ok(CacheKey::new(
            self.provider.as_str(),
            namespace,
            account,
            region,
            fields.iter().map(|f| (*f).to_string()).collect(),
        )
        .encode())
    }

    /// Parse a key and validate it against this provider's schema.
    pub fn parse(&self, key: &str) -> Result<CacheKey, KeyError> {
        let parsed = CacheKey::parse(key)?;
        if parsed.provider != self.provider {
            return Err(KeyError::ProviderMismatch {
                expected: self.provider.clone(),
                found: parsed.provider,
            });
        }
        self.check_arity(&parsed.namespace, parsed.fields.len())?;
        Ok(parsed)
    }

    /// Look up a named trailing field of a parsed key.
    pub fn field<'a>(&self, key: &'a CacheKey, name: &str) -> Option<&'a str> {
        let schema = self.schemas.get(key.namespace())?;
        let index = schema.iter().position(|f| f == name)?;
        key.fields.get(index).map(String::as_str)
    }

    fn check_arity(&self, namespace: &str, found: usize) -> Result<(), KeyError> {
        let schema = self
            .schemas
            .get(namespace)
            .ok_or_else(|| KeyError::UnknownNamespace {
                provider: self.provider.clone(),
                namespace: namespace.to_string(),
            })?;
        if schema.len() != found {
            return Err(KeyError::FieldCount {
                namespace: namespace.to_string(),
                expected: schema.len(),
                found,
            });
        }
        Ok(())
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    /// Segments drawn to hit the escape paths often.
    fn segment_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9-]{0,12}",
            "[a-z:%]{0,8}",
            any::<String>(),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: parse(encode(key)) == key for every field tuple.
        #[test]
        fn prop_encode_parse_roundtrip(
            provider in segment_strategy(),
            namespace in segment_strategy(),
            account in segment_strategy(),
            region in segment_strategy(),
            fields in prop::collection::vec(segment_strategy(), 0..4),
        ) {
            let key = CacheKey::new(provider, namespace, account, region, fields);
            let parsed = CacheKey::parse(&key.encode());
            prop_assert_eq!(parsed, Ok(key));
        }

        /// Property: distinct keys never share an encoding.
        #[test]
        fn prop_encoding_is_injective(
            a in prop::collection::vec(segment_strategy(), 4..6),
            b in prop::collection::vec(segment_strategy(), 4..6),
        ) {
            let key_a = CacheKey::new(&*a[0], &*a[1], &*a[2], &*a[3], a[4..].to_vec());
            let key_b = CacheKey::new(&*b[0], &*b[1], &*b[2], &*b[3], b[4..].to_vec());
            if key_a != key_b {
                prop_assert_ne!(key_a.encode(), key_b.encode());
            }
        }

        /// Property: parsing arbitrary input never panics.
        #[test]
        fn prop_parse_never_panics(input in any::<String>()) {
            let _ = CacheKey::parse(&input);
        }

        /// Property: codec build/parse recovers the exact fields.
        #[test]
        fn prop_codec_roundtrip(
            account in segment_strategy(),
            region in segment_strategy(),
            cluster in segment_strategy(),
            server_group in segment_strategy(),
        ) {
            let codec = KeyCodec::new("aws")
                .with_namespace("serverGroups", &["cluster", "serverGroup"]);
            let key = codec
                .build("serverGroups", &account, &region, &[&cluster, &server_group])
                .unwrap();
            let parsed = codec.parse(&key).unwrap();
            prop_assert_eq!(parsed.account(), account.as_str());
            prop_assert_eq!(parsed.region(), region.as_str());
            prop_assert_eq!(codec.field(&parsed, "cluster"), Some(cluster.as_str()));
            prop_assert_eq!(codec.field(&parsed, "serverGroup"), Some(server_group.as_str()));
        }
    }
}
