//! Configuration types
//!
//! Each section reads `STRATUS_*` environment variables, falling back to the
//! defaults in [`crate::constants`]. Call `validate` before use.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ConfigError, StratusResult};

/// Parse a variable, falling back to `default` when unset or malformed.
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn positive(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: format!("{} must be positive", field),
        });
    }
    Ok(())
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Agent scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval for agents that do not declare their own.
    pub default_poll_interval: Duration,
    /// Timeout for agents that do not declare their own.
    pub default_timeout: Duration,
    /// Maximum agents running at once; `0` means unlimited.
    pub max_concurrent_agents: usize,
    /// Log failed loads at `warn`; otherwise at `debug`.
    pub log_failures: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            default_timeout: Duration::from_secs(DEFAULT_AGENT_TIMEOUT_SECS),
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            log_failures: true,
        }
    }
}

impl SchedulerConfig {
    /// Create SchedulerConfig from environment variables.
    ///
    /// Environment variables:
    /// - `STRATUS_SCHEDULER_POLL_INTERVAL_SECS` (default: 60)
    /// - `STRATUS_SCHEDULER_TIMEOUT_SECS` (default: 300)
    /// - `STRATUS_SCHEDULER_MAX_CONCURRENT` (default: 100, 0 = unlimited)
    /// - `STRATUS_SCHEDULER_LOG_FAILURES`: "true" or "false" (default: true)
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            default_poll_interval: Duration::from_secs(parse_or(
                &lookup,
                "STRATUS_SCHEDULER_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )),
            default_timeout: Duration::from_secs(parse_or(
                &lookup,
                "STRATUS_SCHEDULER_TIMEOUT_SECS",
                DEFAULT_AGENT_TIMEOUT_SECS,
            )),
            max_concurrent_agents: parse_or(
                &lookup,
                "STRATUS_SCHEDULER_MAX_CONCURRENT",
                DEFAULT_MAX_CONCURRENT_AGENTS,
            ),
            log_failures: lookup("STRATUS_SCHEDULER_LOG_FAILURES")
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }

    /// Short intervals for local runs and tests.
    pub fn development() -> Self {
        Self {
            default_poll_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(30),
            max_concurrent_agents: 0,
            log_failures: true,
        }
    }

    /// Whether a concurrency cap is configured.
    pub fn is_limited(&self) -> bool {
        self.max_concurrent_agents > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("default_poll_interval", self.default_poll_interval)?;
        positive("default_timeout", self.default_timeout)?;
        if self.max_concurrent_agents > MAX_CONCURRENT_AGENTS_LIMIT {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrent_agents".to_string(),
                value: self.max_concurrent_agents.to_string(),
                reason: format!("must be at most {}", MAX_CONCURRENT_AGENTS_LIMIT),
            });
        }
        Ok(())
    }
}

// ============================================================================
// ON-DEMAND
// ============================================================================

/// On-demand record retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnDemandConfig {
    /// Records older than this are removed by the cleanup task.
    pub max_age: Duration,
    pub cleanup_interval: Duration,
}

impl Default for OnDemandConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(DEFAULT_ON_DEMAND_MAX_AGE_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_ON_DEMAND_CLEANUP_INTERVAL_SECS),
        }
    }
}

impl OnDemandConfig {
    /// Environment variables:
    /// - `STRATUS_ON_DEMAND_MAX_AGE_SECS` (default: 600)
    /// - `STRATUS_ON_DEMAND_CLEANUP_INTERVAL_SECS` (default: 60)
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            max_age: Duration::from_secs(parse_or(
                &lookup,
                "STRATUS_ON_DEMAND_MAX_AGE_SECS",
                DEFAULT_ON_DEMAND_MAX_AGE_SECS,
            )),
            cleanup_interval: Duration::from_secs(parse_or(
                &lookup,
                "STRATUS_ON_DEMAND_CLEANUP_INTERVAL_SECS",
                DEFAULT_ON_DEMAND_CLEANUP_INTERVAL_SECS,
            )),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("max_age", self.max_age)?;
        positive("cleanup_interval", self.cleanup_interval)?;
        Ok(())
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Which cache store backend to open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Lmdb { path: PathBuf, max_size_mb: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
        }
    }
}

impl StoreConfig {
    /// Environment variables:
    /// - `STRATUS_STORE_BACKEND`: "memory" or "lmdb" (default: memory)
    /// - `STRATUS_LMDB_PATH`: required when the backend is lmdb
    /// - `STRATUS_LMDB_MAX_SIZE_MB` (default: 1024)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend = lookup("STRATUS_STORE_BACKEND")
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_else(|| "memory".to_string());

        let backend = match backend.as_str() {
            "memory" => StoreBackend::Memory,
            "lmdb" => {
                let path = lookup("STRATUS_LMDB_PATH")
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| ConfigError::MissingRequired {
                        field: "STRATUS_LMDB_PATH".to_string(),
                    })?;
                StoreBackend::Lmdb {
                    path: PathBuf::from(path),
                    max_size_mb: parse_or(
                        &lookup,
                        "STRATUS_LMDB_MAX_SIZE_MB",
                        DEFAULT_LMDB_MAX_SIZE_MB,
                    ),
                }
            }
            other => {
                return Err(ConfigError::InvalidValue {
                    field: "STRATUS_STORE_BACKEND".to_string(),
                    value: other.to_string(),
                    reason: "expected 'memory' or 'lmdb'".to_string(),
                })
            }
        };

        Ok(Self { backend })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let StoreBackend::Lmdb { max_size_mb, .. } = &self.backend {
            if *max_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "max_size_mb".to_string(),
                    value: "0".to_string(),
                    reason: "max_size_mb must be greater than 0".to_string(),
                });
            }
            if *max_size_mb > MAX_LMDB_SIZE_MB {
                return Err(ConfigError::InvalidValue {
                    field: "max_size_mb".to_string(),
                    value: max_size_mb.to_string(),
                    reason: format!("max_size_mb must be at most {}", MAX_LMDB_SIZE_MB),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratusConfig {
    pub scheduler: SchedulerConfig,
    pub on_demand: OnDemandConfig,
    pub store: StoreConfig,
}

impl StratusConfig {
    /// Load every section from the environment and validate the result.
    pub fn from_env() -> StratusResult<Self> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> StratusResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self {
            scheduler: SchedulerConfig::from_lookup(&lookup),
            on_demand: OnDemandConfig::from_lookup(&lookup),
            store: StoreConfig::from_lookup(&lookup)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> StratusResult<()> {
        self.scheduler.validate()?;
        self.on_demand.validate()?;
        self.store.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StratusError;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = StratusConfig::default();
        assert_eq!(config.scheduler.default_poll_interval, Duration::from_secs(60));
        assert_eq!(config.scheduler.default_timeout, Duration::from_secs(300));
        assert!(config.scheduler.is_limited());
        assert_eq!(config.on_demand.max_age, Duration::from_secs(600));
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_scheduler_from_lookup() {
        let config = SchedulerConfig::from_lookup(vars(&[
            ("STRATUS_SCHEDULER_POLL_INTERVAL_SECS", "15"),
            ("STRATUS_SCHEDULER_MAX_CONCURRENT", "0"),
            ("STRATUS_SCHEDULER_LOG_FAILURES", "FALSE"),
            ("STRATUS_SCHEDULER_TIMEOUT_SECS", "not-a-number"),
        ]));
        assert_eq!(config.default_poll_interval, Duration::from_secs(15));
        assert_eq!(config.default_timeout, Duration::from_secs(300));
        assert!(!config.is_limited());
        assert!(!config.log_failures);
    }

    #[test]
    fn test_scheduler_validate_rejects_zero_interval() {
        let config = SchedulerConfig {
            default_poll_interval: Duration::ZERO,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "default_poll_interval"
        ));
        assert!(SchedulerConfig::development().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_limits() {
        let config = SchedulerConfig::from_lookup(vars(&[(
            "STRATUS_SCHEDULER_MAX_CONCURRENT",
            "18446744073709551615",
        )]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_concurrent_agents"
        ));

        let store = StoreConfig {
            backend: StoreBackend::Lmdb {
                path: PathBuf::from("/tmp/x"),
                max_size_mb: usize::MAX,
            },
        };
        assert!(matches!(
            store.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_size_mb"
        ));
    }

    #[test]
    fn test_store_lmdb_requires_path() {
        let err = StoreConfig::from_lookup(vars(&[("STRATUS_STORE_BACKEND", "lmdb")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired { .. }));

        let config = StoreConfig::from_lookup(vars(&[
            ("STRATUS_STORE_BACKEND", "LMDB"),
            ("STRATUS_LMDB_PATH", "/var/lib/stratus"),
        ]))
        .unwrap();
        assert_eq!(
            config.backend,
            StoreBackend::Lmdb {
                path: PathBuf::from("/var/lib/stratus"),
                max_size_mb: DEFAULT_LMDB_MAX_SIZE_MB,
            }
        );
    }

    #[test]
    fn test_store_unknown_backend() {
        let err = StoreConfig::from_lookup(vars(&[("STRATUS_STORE_BACKEND", "redis")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_master_config_validates() {
        let err = StratusConfig::from_lookup(vars(&[
            ("STRATUS_STORE_BACKEND", "lmdb"),
            ("STRATUS_LMDB_PATH", "/tmp/x"),
            ("STRATUS_LMDB_MAX_SIZE_MB", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, StratusError::Config(_)));

        let config = StratusConfig::from_lookup(vars(&[("STRATUS_ON_DEMAND_MAX_AGE_SECS", "30")]))
            .unwrap();
        assert_eq!(config.on_demand.max_age, Duration::from_secs(30));
    }
}
