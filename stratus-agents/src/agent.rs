//! Caching agent traits
//!
//! A [`CachingAgent`] owns a set of namespaces inside one [`AgentScope`] and
//! periodically reports what it observes as a [`CacheResult`]. Optional
//! capabilities are exposed through accessor methods rather than downcasts.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_core::{AgentDataType, AgentScope, CacheResult, StratusResult};
use stratus_storage::CacheStore;

use crate::on_demand::OnDemandAgent;

// ============================================================================
// RUN STATE
// ============================================================================

/// Where an agent is in its poll cycle.
///
/// `Idle` only before the first run. Afterwards an agent alternates between
/// `Running` and one of the terminal outcomes of its last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRunState {
    /// Never run yet
    #[default]
    Idle,
    /// `load_data` or the commit is in progress
    Running,
    /// Last run committed its result
    Succeeded,
    /// Last run returned an error or failed to commit
    Failed,
    /// Last run exceeded its timeout and was discarded
    TimedOut,
}

impl AgentRunState {
    /// Whether the last completed run produced no commit.
    pub fn is_failure(&self) -> bool {
        matches!(self, AgentRunState::Failed | AgentRunState::TimedOut)
    }
}

// ============================================================================
// AGENT TRAITS
// ============================================================================

/// A unit of work that polls one provider scope into the cache.
#[async_trait]
pub trait CachingAgent: Send + Sync {
    /// Unique name, e.g. `aws/InstanceCachingAgent/prod/us-east-1`.
    fn agent_type(&self) -> String;

    fn provider_name(&self) -> String;

    /// The provider, account and region this agent owns.
    fn scope(&self) -> AgentScope;

    /// Namespaces this agent writes and whether it owns them.
    fn provided_data_types(&self) -> Vec<AgentDataType>;

    /// Observe the provider and describe what should be cached.
    ///
    /// The store is passed for reads only (pending on-demand records,
    /// previously cached relationships). Writes happen when the scheduler
    /// commits the returned result.
    async fn load_data(&self, store: &dyn CacheStore) -> StratusResult<CacheResult>;

    /// Present when this agent can refresh single resources out of band.
    fn as_on_demand(&self) -> Option<&dyn OnDemandAgent> {
        None
    }

    /// Present when this agent overrides the scheduler's interval or timeout.
    fn as_custom_scheduled(&self) -> Option<&dyn CustomScheduledAgent> {
        None
    }
}

/// Agents that poll on their own cadence.
pub trait CustomScheduledAgent: Send + Sync {
    fn poll_interval(&self) -> Duration;

    fn timeout(&self) -> Duration;
}

/// Resolve the interval and timeout for an agent, falling back to defaults.
pub(crate) fn schedule_for(
    agent: &dyn CachingAgent,
    default_interval: Duration,
    default_timeout: Duration,
) -> (Duration, Duration) {
    match agent.as_custom_scheduled() {
        Some(custom) => (custom.poll_interval(), custom.timeout()),
        None => (default_interval, default_timeout),
    }
}
