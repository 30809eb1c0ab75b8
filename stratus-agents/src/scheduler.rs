//! Agent scheduler
//!
//! Every registered agent gets its own tokio task that polls on a fixed
//! interval. A run loads data under a timeout and, on success, commits the
//! result through the shared [`Committer`]. Failures and timeouts are local
//! to the agent: nothing is committed and the next tick retries.
//!
//! Agents are grouped by account so the credentials lifecycle can replace or
//! remove an account's whole set at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratus_core::{AgentError, SchedulerConfig, StratusError, StratusResult};
use stratus_storage::{CacheStore, CommitKind, CommitRequest, CommitSummary, Committer};
use tokio::sync::{watch, Mutex, RwLock as TokioRwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::agent::{schedule_for, AgentRunState, CachingAgent};

/// Shortest tick a poll loop will use.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

// ============================================================================
// METRICS
// ============================================================================

/// Scheduler-wide counters.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub runs_started: AtomicU64,
    pub runs_succeeded: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_timed_out: AtomicU64,
    /// Runs whose result could not be written.
    pub commit_failures: AtomicU64,
    pub entities_merged: AtomicU64,
    /// Explicit, reconciled and stale on-demand evictions.
    pub entities_evicted: AtomicU64,
}

impl SchedulerMetrics {
    pub fn snapshot(&self) -> SchedulerMetricsSnapshot {
        SchedulerMetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_timed_out: self.runs_timed_out.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            entities_merged: self.entities_merged.load(Ordering::Relaxed),
            entities_evicted: self.entities_evicted.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`SchedulerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerMetricsSnapshot {
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub runs_timed_out: u64,
    pub commit_failures: u64,
    pub entities_merged: u64,
    pub entities_evicted: u64,
}

// ============================================================================
// STATUS
// ============================================================================

/// Observable state of one scheduled agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusSnapshot {
    pub agent_type: String,
    pub account: String,
    pub state: AgentRunState,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Runs started since registration.
    pub runs: u64,
    pub consecutive_failures: u32,
    pub last_started: Option<DateTime<Utc>>,
    pub last_finished: Option<DateTime<Utc>>,
    pub last_elapsed_ms: Option<u64>,
    pub last_error: Option<String>,
}

// ============================================================================
// RUNNER
// ============================================================================

enum RunFailure {
    TimedOut,
    Load(StratusError),
    Commit(StratusError),
}

/// One agent plus everything a run needs.
struct AgentRunner {
    agent: Arc<dyn CachingAgent>,
    agent_type: String,
    account: String,
    poll_interval: Duration,
    timeout: Duration,
    committer: Committer,
    permits: Option<Arc<Semaphore>>,
    metrics: Arc<SchedulerMetrics>,
    log_failures: bool,
    status: RwLock<AgentStatusSnapshot>,
    /// Serializes scheduled and manual runs of the same agent.
    run_lock: Mutex<()>,
}

impl AgentRunner {
    fn status(&self) -> Option<AgentStatusSnapshot> {
        self.status.read().ok().map(|guard| guard.clone())
    }

    fn update_status(&self, apply: impl FnOnce(&mut AgentStatusSnapshot)) {
        if let Ok(mut guard) = self.status.write() {
            apply(&mut guard);
        }
    }

    /// Run one load-and-commit cycle.
    async fn run_cycle(&self) -> StratusResult<CommitSummary> {
        let _serial = self.run_lock.lock().await;
        let _permit = match &self.permits {
            Some(permits) => Some(permits.acquire().await.map_err(|_| {
                AgentError::LoadFailed {
                    agent_type: self.agent_type.clone(),
                    reason: "scheduler is shut down".to_string(),
                }
            })?),
            None => None,
        };

        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let clock = Instant::now();
        self.metrics.runs_started.fetch_add(1, Ordering::Relaxed);
        self.update_status(|status| {
            status.state = AgentRunState::Running;
            status.runs += 1;
            status.last_started = Some(started_at);
        });

        let outcome = self.load_and_commit(started_at).await;
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        let (state, result) = match outcome {
            Ok(summary) => {
                self.metrics.runs_succeeded.fetch_add(1, Ordering::Relaxed);
                SchedulerMetrics::bump(&self.metrics.entities_merged, summary.merged);
                SchedulerMetrics::bump(
                    &self.metrics.entities_evicted,
                    summary.evicted + summary.reconciled + summary.on_demand_evicted,
                );
                if summary.namespaces.is_empty() {
                    trace!(agent_type = %self.agent_type, %run_id, "Agent run produced no data");
                } else {
                    debug!(
                        agent_type = %self.agent_type,
                        account = %self.account,
                        %run_id,
                        merged = summary.merged,
                        evicted = summary.evicted,
                        reconciled = summary.reconciled,
                        elapsed_ms,
                        "Agent run committed"
                    );
                }
                (AgentRunState::Succeeded, Ok(summary))
            }
            Err(RunFailure::TimedOut) => {
                self.metrics.runs_timed_out.fetch_add(1, Ordering::Relaxed);
                let timeout_ms = self.timeout.as_millis() as u64;
                warn!(
                    agent_type = %self.agent_type,
                    account = %self.account,
                    %run_id,
                    timeout_ms,
                    "Agent run timed out, result discarded"
                );
                let error = AgentError::TimedOut {
                    agent_type: self.agent_type.clone(),
                    timeout_ms,
                };
                (AgentRunState::TimedOut, Err(StratusError::from(error)))
            }
            Err(RunFailure::Load(e)) => {
                self.metrics.runs_failed.fetch_add(1, Ordering::Relaxed);
                if self.log_failures {
                    warn!(
                        agent_type = %self.agent_type,
                        account = %self.account,
                        %run_id,
                        elapsed_ms,
                        error = %e,
                        "Agent failed to load data"
                    );
                } else {
                    debug!(
                        agent_type = %self.agent_type,
                        %run_id,
                        error = %e,
                        "Agent failed to load data"
                    );
                }
                (AgentRunState::Failed, Err(e))
            }
            Err(RunFailure::Commit(e)) => {
                self.metrics.runs_failed.fetch_add(1, Ordering::Relaxed);
                self.metrics.commit_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    agent_type = %self.agent_type,
                    account = %self.account,
                    %run_id,
                    error = %e,
                    "Failed to commit agent result"
                );
                (AgentRunState::Failed, Err(e))
            }
        };

        let finished = Utc::now();
        let error = result.as_ref().err().map(ToString::to_string);
        self.update_status(|status| {
            status.state = state;
            status.last_finished = Some(finished);
            status.last_elapsed_ms = Some(elapsed_ms);
            if state.is_failure() {
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            } else {
                status.consecutive_failures = 0;
            }
            status.last_error = error;
        });

        result
    }

    async fn load_and_commit(&self, started_at: DateTime<Utc>) -> Result<CommitSummary, RunFailure> {
        let store: &dyn CacheStore = self.committer.store().as_ref();
        let result = match timeout(self.timeout, self.agent.load_data(store)).await {
            Err(_) => return Err(RunFailure::TimedOut),
            Ok(Err(e)) => return Err(RunFailure::Load(e)),
            Ok(Ok(result)) => result,
        };

        self.committer
            .commit(CommitRequest {
                agent_type: self.agent_type.clone(),
                scope: self.agent.scope(),
                data_types: self.agent.provided_data_types(),
                result,
                started_at,
                kind: CommitKind::Scheduled,
            })
            .await
            .map_err(RunFailure::Commit)
    }
}

/// Resolve once `shutdown` carries `true` or its sender is dropped.
///
/// The borrowed value is released before returning, so the future stays
/// `Send` inside `select!`.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Poll until shutdown is signalled or the scheduler is dropped.
async fn poll_loop(runner: Arc<AgentRunner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(runner.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = shutdown_signalled(&mut shutdown) => break,
            _ = runner.run_cycle() => {}
        }
    }

    debug!(agent_type = %runner.agent_type, "Agent poll loop stopped");
}

struct ScheduledAgent {
    runner: Arc<AgentRunner>,
    task: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl ScheduledAgent {
    async fn stop(self) {
        let Some((shutdown, handle)) = self.task else {
            return;
        };
        let _ = shutdown.send(true);
        if let Err(e) = handle.await {
            warn!(agent_type = %self.runner.agent_type, error = %e, "Agent task ended abnormally");
        }
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Runs caching agents and commits their results.
pub struct AgentScheduler {
    committer: Committer,
    config: SchedulerConfig,
    permits: Option<Arc<Semaphore>>,
    metrics: Arc<SchedulerMetrics>,
    accounts: TokioRwLock<HashMap<String, Vec<ScheduledAgent>>>,
}

impl AgentScheduler {
    pub fn new(store: Arc<dyn CacheStore>, config: SchedulerConfig) -> Self {
        let permits = config
            .is_limited()
            .then(|| {
                let permits = config.max_concurrent_agents.min(Semaphore::MAX_PERMITS);
                Arc::new(Semaphore::new(permits))
            });
        Self {
            committer: Committer::new(store),
            config,
            permits,
            metrics: Arc::new(SchedulerMetrics::default()),
            accounts: TokioRwLock::new(HashMap::new()),
        }
    }

    pub fn committer(&self) -> &Committer {
        &self.committer
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        self.committer.store()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Start polling `agents` for `account`, replacing any previous set.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn schedule_account(
        &self,
        account: &str,
        agents: Vec<Arc<dyn CachingAgent>>,
    ) -> usize {
        self.install(account, agents, true).await
    }

    /// Register `agents` for `account` without starting their poll loops.
    ///
    /// The agents only run through [`AgentScheduler::run_once`].
    pub async fn register_account(
        &self,
        account: &str,
        agents: Vec<Arc<dyn CachingAgent>>,
    ) -> usize {
        self.install(account, agents, false).await
    }

    async fn install(&self, account: &str, agents: Vec<Arc<dyn CachingAgent>>, spawn: bool) -> usize {
        let previous = self.accounts.write().await.remove(account);
        if let Some(previous) = previous {
            for scheduled in previous {
                scheduled.stop().await;
            }
        }

        let scheduled: Vec<ScheduledAgent> = agents
            .into_iter()
            .map(|agent| {
                let runner = Arc::new(self.runner_for(account, agent));
                let task = spawn.then(|| {
                    let (shutdown_tx, shutdown_rx) = watch::channel(false);
                    let handle = tokio::spawn(poll_loop(runner.clone(), shutdown_rx));
                    (shutdown_tx, handle)
                });
                ScheduledAgent { runner, task }
            })
            .collect();

        let count = scheduled.len();
        self.accounts
            .write()
            .await
            .insert(account.to_string(), scheduled);

        info!(account = %account, agents = count, polling = spawn, "Scheduled account agents");
        count
    }

    fn runner_for(&self, account: &str, agent: Arc<dyn CachingAgent>) -> AgentRunner {
        let (poll_interval, timeout) = schedule_for(
            agent.as_ref(),
            self.config.default_poll_interval,
            self.config.default_timeout,
        );
        let agent_type = agent.agent_type();
        let status = AgentStatusSnapshot {
            agent_type: agent_type.clone(),
            account: account.to_string(),
            state: AgentRunState::Idle,
            poll_interval_ms: poll_interval.as_millis() as u64,
            timeout_ms: timeout.as_millis() as u64,
            runs: 0,
            consecutive_failures: 0,
            last_started: None,
            last_finished: None,
            last_elapsed_ms: None,
            last_error: None,
        };

        AgentRunner {
            agent,
            agent_type,
            account: account.to_string(),
            poll_interval,
            timeout,
            committer: self.committer.clone(),
            permits: self.permits.clone(),
            metrics: self.metrics.clone(),
            log_failures: self.config.log_failures,
            status: RwLock::new(status),
            run_lock: Mutex::new(()),
        }
    }

    /// Stop and forget every agent of `account`. Returns how many were removed.
    pub async fn unschedule_account(&self, account: &str) -> usize {
        let removed = self.accounts.write().await.remove(account).unwrap_or_default();
        let count = removed.len();
        for scheduled in removed {
            scheduled.stop().await;
        }
        if count > 0 {
            info!(account = %account, agents = count, "Unscheduled account agents");
        }
        count
    }

    pub async fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self.accounts.read().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    pub async fn agent_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .accounts
            .read()
            .await
            .values()
            .flatten()
            .map(|scheduled| scheduled.runner.agent_type.clone())
            .collect();
        types.sort();
        types
    }

    pub async fn status(&self) -> Vec<AgentStatusSnapshot> {
        let mut status: Vec<AgentStatusSnapshot> = self
            .accounts
            .read()
            .await
            .values()
            .flatten()
            .filter_map(|scheduled| scheduled.runner.status())
            .collect();
        status.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        status
    }

    pub fn metrics(&self) -> SchedulerMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run one cycle of `agent_type` now and wait for it.
    pub async fn run_once(&self, agent_type: &str) -> StratusResult<CommitSummary> {
        let runner = self
            .accounts
            .read()
            .await
            .values()
            .flatten()
            .find(|scheduled| scheduled.runner.agent_type == agent_type)
            .map(|scheduled| scheduled.runner.clone())
            .ok_or_else(|| AgentError::NotRegistered {
                agent_type: agent_type.to_string(),
            })?;
        runner.run_cycle().await
    }

    /// Registered agents that can refresh single resources.
    pub async fn on_demand_agents(&self) -> Vec<Arc<dyn CachingAgent>> {
        self.accounts
            .read()
            .await
            .values()
            .flatten()
            .filter(|scheduled| scheduled.runner.agent.as_on_demand().is_some())
            .map(|scheduled| scheduled.runner.agent.clone())
            .collect()
    }

    /// Stop every agent and clear the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<ScheduledAgent> = self
            .accounts
            .write()
            .await
            .drain()
            .flat_map(|(_, agents)| agents)
            .collect();
        let count = drained.len();
        for scheduled in drained {
            scheduled.stop().await;
        }
        info!(agents = count, "Agent scheduler shut down");
    }
}
