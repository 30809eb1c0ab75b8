//! Shared agents for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use stratus_agents::{
    merge_pending_on_demand, pending_in_scope, CachingAgent, CustomScheduledAgent,
    OnDemandAgent, OnDemandRequest, OnDemandResult, PendingOnDemand,
};
use stratus_core::{
    AgentDataType, AgentScope, Authority, CacheResult, CacheResultBuilder, StratusResult,
};
use stratus_storage::CacheStore;
use stratus_test_utils::{fixtures, FakeProvider};

/// Polls instances of one account and region from a [`FakeProvider`].
pub struct InstanceAgent {
    pub provider: Arc<FakeProvider>,
    pub account: String,
    pub region: String,
    pub authority: Authority,
    pub on_demand: bool,
    pub timeout: Option<Duration>,
}

impl InstanceAgent {
    pub fn authoritative(provider: Arc<FakeProvider>) -> Self {
        Self {
            provider,
            account: fixtures::ACCOUNT.to_string(),
            region: fixtures::REGION.to_string(),
            authority: Authority::Authoritative,
            on_demand: false,
            timeout: None,
        }
    }

    pub fn informative(provider: Arc<FakeProvider>) -> Self {
        Self {
            authority: Authority::Informative,
            ..Self::authoritative(provider)
        }
    }

    pub fn with_on_demand(mut self) -> Self {
        self.on_demand = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn into_agent(self) -> Arc<dyn CachingAgent> {
        Arc::new(self)
    }
}

#[async_trait]
impl CachingAgent for InstanceAgent {
    fn agent_type(&self) -> String {
        format!("aws/InstanceCachingAgent/{}/{}", self.account, self.region)
    }

    fn provider_name(&self) -> String {
        fixtures::PROVIDER.to_string()
    }

    fn scope(&self) -> AgentScope {
        AgentScope::regional(fixtures::PROVIDER, self.account.clone(), self.region.clone())
    }

    fn provided_data_types(&self) -> Vec<AgentDataType> {
        let instances = AgentDataType {
            namespace: fixtures::INSTANCES.to_string(),
            authority: self.authority,
        };
        vec![
            instances,
            AgentDataType::informative(stratus_core::ON_DEMAND_NAMESPACE),
        ]
    }

    async fn load_data(&self, store: &dyn CacheStore) -> StratusResult<CacheResult> {
        let run_started = Utc::now();
        let entities = self.provider.describe(&self.account).await?;

        let mut builder = CacheResultBuilder::new().with_start_time(run_started);
        let ids: Vec<String> = entities.iter().map(|e| e.id.clone()).collect();
        let instances = builder.namespace(fixtures::INSTANCES);
        instances.mark_complete();
        for entity in entities {
            instances.keep_entity(entity);
        }

        if self.on_demand {
            merge_pending_on_demand(store, &mut builder, &ids, run_started).await?;
        }
        Ok(builder.build())
    }

    fn as_on_demand(&self) -> Option<&dyn OnDemandAgent> {
        self.on_demand.then_some(self as &dyn OnDemandAgent)
    }

    fn as_custom_scheduled(&self) -> Option<&dyn CustomScheduledAgent> {
        self.timeout.map(|_| self as &dyn CustomScheduledAgent)
    }
}

impl CustomScheduledAgent for InstanceAgent {
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::from_secs(300))
    }
}

#[async_trait]
impl OnDemandAgent for InstanceAgent {
    fn on_demand_agent_type(&self) -> String {
        format!("{}-OnDemand", self.agent_type())
    }

    fn handles(&self, on_demand_type: &str, provider: &str) -> bool {
        on_demand_type == fixtures::INSTANCES && provider == fixtures::PROVIDER
    }

    async fn handle(
        &self,
        _store: &dyn CacheStore,
        request: &OnDemandRequest,
    ) -> StratusResult<Option<OnDemandResult>> {
        let Some(name) = request.param("id") else {
            return Ok(None);
        };
        if request.param("account").is_some_and(|account| account != self.account) {
            return Ok(None);
        }

        let id = fixtures::instance_key(&self.account, &self.region, name);
        let found = if request.evict {
            None
        } else {
            self.provider.find(&id)
        };

        let result = match found {
            None => OnDemandResult::evicted(
                self.on_demand_agent_type(),
                self.provided_data_types(),
                self.scope(),
                fixtures::INSTANCES,
                &id,
            ),
            Some(entity) => {
                let mut builder = CacheResultBuilder::new();
                builder.namespace(fixtures::INSTANCES).keep_entity(entity);
                OnDemandResult::refreshed(
                    self.on_demand_agent_type(),
                    self.provided_data_types(),
                    self.scope(),
                    fixtures::INSTANCES,
                    &id,
                    &builder,
                )?
            }
        };
        Ok(Some(result))
    }

    async fn pending_on_demand_requests(
        &self,
        store: &dyn CacheStore,
    ) -> StratusResult<Vec<PendingOnDemand>> {
        pending_in_scope(store, &self.scope()).await
    }
}
