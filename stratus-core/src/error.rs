//! Error types for Stratus operations

use thiserror::Error;

/// Cache key codec errors.
///
/// Parse failures are never fatal: callers resolving relationships or
/// reconciling a namespace treat an unparseable key as "not mine, skip".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Cache key is empty")]
    Empty,

    #[error("Cache key '{key}' has {found} segments, at least {expected} required")]
    TooFewSegments {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("Invalid escape sequence in cache key segment '{segment}'")]
    InvalidEscape { segment: String },

    #[error("Cache key belongs to provider '{found}', expected '{expected}'")]
    ProviderMismatch { expected: String, found: String },

    #[error("Unknown namespace '{namespace}' for provider '{provider}'")]
    UnknownNamespace { provider: String, namespace: String },

    #[error("Namespace '{namespace}' expects {expected} fields, got {found}")]
    FieldCount {
        namespace: String,
        expected: usize,
        found: usize,
    },
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Serialization failed for {namespace}/{id}: {reason}")]
    Serialization {
        namespace: String,
        id: String,
        reason: String,
    },

    #[error("Storage backend unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Caching agent errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("Agent {agent_type} failed to load data: {reason}")]
    LoadFailed { agent_type: String, reason: String },

    #[error("Agent {agent_type} timed out after {timeout_ms}ms")]
    TimedOut { agent_type: String, timeout_ms: u64 },

    #[error("Agent not registered: {agent_type}")]
    NotRegistered { agent_type: String },

    #[error("Invalid on-demand request: {reason}")]
    InvalidOnDemandRequest { reason: String },

    #[error("Provider call failed for {account}: {reason}")]
    ProviderFailed { account: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Stratus errors.
#[derive(Debug, Clone, Error)]
pub enum StratusError {
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Stratus operations.
pub type StratusResult<T> = Result<T, StratusError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_error_display_field_count() {
        let err = KeyError::FieldCount {
            namespace: "instances".to_string(),
            expected: 1,
            found: 3,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("instances"));
        assert!(msg.contains("expects 1"));
        assert!(msg.contains("got 3"));
    }

    #[test]
    fn test_storage_error_display_lock_poisoned() {
        let err = StorageError::LockPoisoned;
        assert_eq!(format!("{}", err), "Storage lock poisoned");
    }

    #[test]
    fn test_agent_error_display_timed_out() {
        let err = AgentError::TimedOut {
            agent_type: "aws/InstanceCachingAgent/prod/us-east-1".to_string(),
            timeout_ms: 1500,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("timed out"));
        assert!(msg.contains("1500ms"));
        assert!(msg.contains("InstanceCachingAgent"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "poll_interval".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("poll_interval"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_stratus_error_from_variants() {
        let key = StratusError::from(KeyError::Empty);
        assert!(matches!(key, StratusError::Key(_)));

        let storage = StratusError::from(StorageError::LockPoisoned);
        assert!(matches!(storage, StratusError::Storage(_)));

        let agent = StratusError::from(AgentError::NotRegistered {
            agent_type: "x".to_string(),
        });
        assert!(matches!(agent, StratusError::Agent(_)));

        let config = StratusError::from(ConfigError::MissingRequired {
            field: "lmdb_path".to_string(),
        });
        assert!(matches!(config, StratusError::Config(_)));
    }
}
