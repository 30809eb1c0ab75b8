//! Constants for Stratus
//!
//! Reserved names, on-demand record attribute keys and configuration
//! defaults live here so every crate agrees on them.

// ============================================================================
// RESERVED NAMES
// ============================================================================

/// TTL value meaning "never expires".
pub const NO_EXPIRY: i64 = -1;

/// Reserved namespace holding on-demand refresh records.
pub const ON_DEMAND_NAMESPACE: &str = "onDemand";

// ============================================================================
// ON-DEMAND RECORD ATTRIBUTES
// ============================================================================

/// Epoch millis at which the on-demand refresh was written.
pub const ATTR_CACHE_TIME: &str = "cacheTime";

/// Number of scheduled runs that have seen the record.
pub const ATTR_PROCESSED_COUNT: &str = "processedCount";

/// Epoch millis of the last scheduled run that saw the record, `-1` until then.
pub const ATTR_PROCESSED_TIME: &str = "processedTime";

/// The real namespace the refreshed resource lives in.
pub const ATTR_NAMESPACE: &str = "namespace";

/// Serialized keep-map produced by the on-demand refresh.
pub const ATTR_CACHE_RESULTS: &str = "cacheResults";

/// A record seen by this many scheduled runs is dropped unless newer than the run.
pub const ON_DEMAND_MAX_PROCESSED_COUNT: i64 = 2;

// ============================================================================
// SCHEDULER DEFAULTS
// ============================================================================

/// Default agent poll interval in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default per-run timeout in seconds.
pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 300;

/// Default cap on agents running at once. `0` disables the cap.
pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 100;

/// Largest accepted concurrency cap.
pub const MAX_CONCURRENT_AGENTS_LIMIT: usize = 100_000;

// ============================================================================
// ON-DEMAND DEFAULTS
// ============================================================================

/// On-demand records older than this are removed by the cleanup task.
pub const DEFAULT_ON_DEMAND_MAX_AGE_SECS: u64 = 600;

/// How often the cleanup task runs.
pub const DEFAULT_ON_DEMAND_CLEANUP_INTERVAL_SECS: u64 = 60;

// ============================================================================
// STORE DEFAULTS
// ============================================================================

/// Default LMDB map size in megabytes.
pub const DEFAULT_LMDB_MAX_SIZE_MB: usize = 1024;

/// Largest accepted LMDB map size in megabytes (1 TiB).
pub const MAX_LMDB_SIZE_MB: usize = 1024 * 1024;
