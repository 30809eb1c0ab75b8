//! Stratus Core - Cache Data Model
//!
//! Entities, results, the cache key codec and the result accumulator that
//! every other crate builds on. No I/O lives here.

pub mod config;
pub mod constants;
pub mod entities;
pub mod error;
pub mod key;
pub mod result;

pub use config::{OnDemandConfig, SchedulerConfig, StoreBackend, StoreConfig, StratusConfig};
pub use constants::{NO_EXPIRY, ON_DEMAND_NAMESPACE};
pub use entities::{
    AgentDataType, AgentScope, Attributes, Authority, CacheEntity, CacheResult, Relationships,
};
pub use error::{AgentError, ConfigError, KeyError, StorageError, StratusError, StratusResult};
pub use key::{CacheKey, KeyCodec};
pub use result::{CacheEntityBuilder, CacheResultBuilder, NamespaceBuilder};

/// Timestamp type using UTC timezone.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

