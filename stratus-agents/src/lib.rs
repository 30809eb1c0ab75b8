//! Stratus Agents - Caching Agents and Scheduling
//!
//! Provides the moving parts that keep the cache current:
//! - Caching agent traits and their optional capabilities
//! - The per-agent poll scheduler with timeouts and a concurrency cap
//! - On-demand single-resource refresh and its cleanup task
//! - Account lifecycle wiring driven by credential events
//! - Tracing initialisation

pub mod agent;
pub mod lifecycle;
pub mod on_demand;
pub mod scheduler;
pub mod telemetry;

pub use agent::{AgentRunState, CachingAgent, CustomScheduledAgent};
pub use lifecycle::{
    spawn_lifecycle_listener, AccountCredentials, AccountEvent, AccountLifecycle, AgentFactory,
};
pub use on_demand::{
    merge_pending_on_demand, on_demand_cleanup_task, pending_in_scope, OnDemandAgent,
    OnDemandCleanupMetrics, OnDemandCleanupSnapshot, OnDemandOutcome, OnDemandRecord,
    OnDemandRequest, OnDemandResult, OnDemandUpdater, PendingMerge, PendingOnDemand,
};
pub use scheduler::{
    AgentScheduler, AgentStatusSnapshot, SchedulerMetrics, SchedulerMetricsSnapshot,
};
pub use telemetry::init_tracing;
