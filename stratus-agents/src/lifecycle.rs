//! Account lifecycle
//!
//! The credentials component reports accounts appearing, changing and
//! disappearing. Each event rebuilds or removes that account's agent set.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::agent::CachingAgent;
use crate::scheduler::{shutdown_signalled, AgentScheduler};

/// What the scheduler needs to know about one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCredentials {
    pub name: String,
    pub provider: String,
    pub regions: Vec<String>,
    /// Provider-specific settings (role ARNs, project ids, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl AccountCredentials {
    pub fn new(name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: provider.into(),
            regions: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.regions.push(region.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    Added(AccountCredentials),
    Updated(AccountCredentials),
    /// Account name.
    Deleted(String),
}

/// Builds the agents for one account. Factories return nothing for
/// providers they do not serve.
pub trait AgentFactory: Send + Sync {
    fn build_agents(&self, credentials: &AccountCredentials) -> Vec<Arc<dyn CachingAgent>>;
}

/// Applies account events to an [`AgentScheduler`].
pub struct AccountLifecycle {
    scheduler: Arc<AgentScheduler>,
    factories: Vec<Arc<dyn AgentFactory>>,
}

impl AccountLifecycle {
    pub fn new(scheduler: Arc<AgentScheduler>) -> Self {
        Self {
            scheduler,
            factories: Vec::new(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    pub fn scheduler(&self) -> &Arc<AgentScheduler> {
        &self.scheduler
    }

    /// Apply one event. Returns how many agents the account now has.
    pub async fn apply(&self, event: AccountEvent) -> usize {
        match event {
            AccountEvent::Added(credentials) | AccountEvent::Updated(credentials) => {
                let agents: Vec<Arc<dyn CachingAgent>> = self
                    .factories
                    .iter()
                    .flat_map(|factory| factory.build_agents(&credentials))
                    .collect();
                info!(
                    account = %credentials.name,
                    provider = %credentials.provider,
                    agents = agents.len(),
                    "Account agents rebuilt"
                );
                self.scheduler
                    .schedule_account(&credentials.name, agents)
                    .await
            }
            AccountEvent::Deleted(name) => {
                let removed = self.scheduler.unschedule_account(&name).await;
                info!(account = %name, removed, "Account removed");
                0
            }
        }
    }
}

/// Consume account events until the channel closes or shutdown is signalled.
pub fn spawn_lifecycle_listener(
    lifecycle: Arc<AccountLifecycle>,
    mut events: mpsc::Receiver<AccountEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_signalled(&mut shutdown_rx) => {
                    debug!("Account lifecycle listener shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        lifecycle.apply(event).await;
                    }
                    None => {
                        debug!("Account event channel closed");
                        break;
                    }
                },
            }
        }
    })
}
