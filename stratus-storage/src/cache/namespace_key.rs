//! Namespace-scoped storage keys for the LMDB backend.
//!
//! Every entity lives under `namespace \0 id`, so all entities of a
//! namespace sit in one contiguous key range and a namespace can be scanned
//! with a single prefix iteration.

/// Separator byte between namespace and id.
const SEPARATOR: u8 = 0x00;

/// A storage key scoped to one namespace.
///
/// The namespace may not contain the separator byte; the id may contain
/// anything, since decoding splits on the first separator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey<'a> {
    namespace: &'a str,
    id: &'a str,
}

impl<'a> NamespacedKey<'a> {
    pub fn new(namespace: &'a str, id: &'a str) -> Self {
        Self { namespace, id }
    }

    pub fn namespace(&self) -> &'a str {
        self.namespace
    }

    pub fn id(&self) -> &'a str {
        self.id
    }

    /// Whether `namespace` can be stored without breaking the key layout.
    pub fn is_valid_namespace(namespace: &str) -> bool {
        !namespace.as_bytes().contains(&SEPARATOR)
    }

    /// Encode to `[namespace][0x00][id]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.namespace.len() + 1 + self.id.len());
        bytes.extend_from_slice(self.namespace.as_bytes());
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(self.id.as_bytes());
        bytes
    }

    /// Decode a stored key.
    ///
    /// Returns `None` if the separator is missing or either half is not UTF-8.
    pub fn decode(bytes: &'a [u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let namespace = std::str::from_utf8(&bytes[..split]).ok()?;
        let id = std::str::from_utf8(&bytes[split + 1..]).ok()?;
        Some(Self { namespace, id })
    }

    /// Prefix shared by every key of a namespace.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }
}
