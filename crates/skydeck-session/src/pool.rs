use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use skydeck_core::{AccountId, ClockFn};
use skydeck_protocol::IdentityClient;
use skydeck_store::CredentialStore;

use crate::agent::{Agent, AgentParams};
use crate::config::AgentPoolConfig;
use crate::error::SessionError;
use crate::events::{DiagnosticEmitter, DiagnosticEvent, EvictionReason};
use crate::health::HealthStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
/// Result of one eviction sweep.
pub struct EvictionReport {
    pub evicted: Vec<(AccountId, EvictionReason)>,
    /// Agents that qualified for eviction but were pinned by a refresh.
    pub deferred: Vec<AccountId>,
    pub remaining: usize,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub account_id: AccountId,
    pub created_at_ms: u64,
    pub last_used_at_ms: u64,
    pub access_count: u64,
    pub memory_estimate_mb: f64,
    pub health: HealthStatus,
}

/// Bounded set of live agents keyed by account.
///
/// The agent map sits behind a std mutex that is never held across an
/// await; creation for a single account is serialized by a per-account
/// async gate so concurrent callers share one handshake.
pub struct AgentPool {
    config: AgentPoolConfig,
    client: Arc<dyn IdentityClient>,
    store: Arc<dyn CredentialStore>,
    clock: ClockFn,
    events: DiagnosticEmitter,
    agents: Mutex<HashMap<AccountId, Arc<Agent>>>,
    creation_gates: Mutex<HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AgentPool {
    pub fn new(
        config: AgentPoolConfig,
        client: Arc<dyn IdentityClient>,
        store: Arc<dyn CredentialStore>,
        clock: ClockFn,
        events: DiagnosticEmitter,
    ) -> Self {
        Self {
            config,
            client,
            store,
            clock,
            events,
            agents: Mutex::new(HashMap::new()),
            creation_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AgentPoolConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn IdentityClient> {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn clock(&self) -> &ClockFn {
        &self.clock
    }

    pub(crate) fn events(&self) -> &DiagnosticEmitter {
        &self.events
    }

    /// Returns the live agent for `account_id`, creating it on first use.
    pub async fn get_or_create(&self, account_id: &AccountId) -> Result<Arc<Agent>, SessionError> {
        self.obtain(account_id, true).await
    }

    /// Live agent without creating one or counting it as a use.
    pub fn get(&self, account_id: &AccountId) -> Option<Arc<Agent>> {
        self.lock_agents().get(account_id).cloned()
    }

    /// Marks the agent as just used. Returns false when no agent is live.
    pub fn touch(&self, account_id: &AccountId) -> bool {
        match self.get(account_id) {
            Some(agent) => {
                agent.touch();
                true
            }
            None => false,
        }
    }

    /// Removes and disposes the agent. Holders of the `Arc` keep a usable
    /// handle for operations already in flight.
    pub fn evict(&self, account_id: &AccountId, reason: EvictionReason) -> bool {
        let removed = self.lock_agents().remove(account_id);
        let Some(agent) = removed else {
            return false;
        };
        agent.dispose();
        tracing::debug!(account_id = %account_id, ?reason, "agent evicted");
        self.events.emit(DiagnosticEvent::AgentEvicted {
            account_id: account_id.clone(),
            reason,
        });
        true
    }

    /// Evicts the agent and runs `finalize` (typically the store write that
    /// retires the account) while holding the account's creation gate, so no
    /// concurrent `get_or_create` or `health_check` can put an agent back
    /// from the record being retired.
    pub(crate) async fn retire_with<F, T>(
        &self,
        account_id: &AccountId,
        reason: EvictionReason,
        finalize: F,
    ) -> T
    where
        F: Future<Output = T>,
    {
        let gate = self.creation_gate(account_id);
        let _creation = gate.lock().await;
        self.evict(account_id, reason);
        let result = finalize.await;
        if reason == EvictionReason::AccountRemoved {
            self.lock_gates().remove(account_id);
        }
        result
    }

    /// Evicts inactive agents, then the least healthy (oldest on ties) until
    /// the pool is within its agent and memory limits. `is_pinned` agents are
    /// never evicted and are reported as deferred.
    pub fn run_eviction_sweep(&self, is_pinned: impl Fn(&AccountId) -> bool) -> EvictionReport {
        let now = (self.clock)();
        let mut report = EvictionReport {
            evicted: Vec::new(),
            deferred: Vec::new(),
            remaining: 0,
            memory_mb: 0.0,
        };

        let mut candidates = Vec::new();
        for agent in self.live_agents() {
            let idle_ms = now.saturating_sub(agent.last_used_at_ms());
            if idle_ms <= self.config.inactive_timeout_ms {
                candidates.push(agent);
                continue;
            }
            if is_pinned(agent.account_id()) {
                report.deferred.push(agent.account_id().clone());
                candidates.push(agent);
                continue;
            }
            if self.evict(agent.account_id(), EvictionReason::Inactive) {
                report
                    .evicted
                    .push((agent.account_id().clone(), EvictionReason::Inactive));
            }
        }

        let mut live_count = candidates.len();
        let mut memory_mb: f64 = candidates.iter().map(|agent| agent.memory_estimate_mb()).sum();
        let mut ranked = candidates
            .into_iter()
            .map(|agent| {
                let score = agent.health_status().score;
                (score, agent)
            })
            .collect::<Vec<_>>();
        ranked.sort_by(|(left_score, left), (right_score, right)| {
            match left_score.cmp(right_score) {
                CmpOrdering::Equal => left.last_used_at_ms().cmp(&right.last_used_at_ms()),
                other => other,
            }
        });

        for (_, agent) in ranked {
            let over_capacity = live_count > self.config.max_agents;
            let over_memory = memory_mb > self.config.memory_threshold_mb;
            if !over_capacity && !over_memory {
                break;
            }
            let idle_ms = now.saturating_sub(agent.last_used_at_ms());
            if idle_ms < self.config.recent_use_grace_ms {
                continue;
            }
            if is_pinned(agent.account_id()) {
                if !report.deferred.contains(agent.account_id()) {
                    report.deferred.push(agent.account_id().clone());
                }
                continue;
            }
            let reason = if over_capacity {
                EvictionReason::Capacity
            } else {
                EvictionReason::MemoryPressure
            };
            if self.evict(agent.account_id(), reason) {
                live_count -= 1;
                memory_mb -= agent.memory_estimate_mb();
                report.evicted.push((agent.account_id().clone(), reason));
            }
        }

        report.remaining = self.len();
        report.memory_mb = self.aggregate_memory_mb();
        if !report.evicted.is_empty() || !report.deferred.is_empty() {
            tracing::info!(
                evicted = report.evicted.len(),
                deferred = report.deferred.len(),
                remaining = report.remaining,
                memory_mb = report.memory_mb,
                "agent eviction sweep"
            );
        }
        report
    }

    /// Lightweight round-trip for one account. Never fails; unreachable or
    /// unknown accounts come back as an offline status.
    pub async fn health_check(&self, account_id: &AccountId) -> HealthStatus {
        let agent = match self.obtain(account_id, false).await {
            Ok(agent) => agent,
            Err(error) => {
                self.events.emit(DiagnosticEvent::HealthCheckFailed {
                    account_id: account_id.clone(),
                    reason: error.to_string(),
                });
                return HealthStatus::unreachable((self.clock)());
            }
        };
        self.probe_agent(&agent).await
    }

    /// Health-checks every live agent concurrently.
    pub async fn health_check_all(&self) -> Vec<(AccountId, HealthStatus)> {
        let agents = self.live_agents();
        let probes = agents.iter().map(|agent| async move {
            (agent.account_id().clone(), self.probe_agent(agent).await)
        });
        futures_util::future::join_all(probes).await
    }

    /// Last known health, without a round-trip.
    pub fn agent_health(&self, account_id: &AccountId) -> Option<HealthStatus> {
        self.get(account_id).map(|agent| agent.health_status())
    }

    pub fn mark_session_valid(&self, account_id: &AccountId, valid: bool) {
        if let Some(agent) = self.get(account_id) {
            agent.set_session_valid(valid);
        }
    }

    pub fn len(&self) -> usize {
        self.lock_agents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn aggregate_memory_mb(&self) -> f64 {
        self.live_agents()
            .iter()
            .map(|agent| agent.memory_estimate_mb())
            .sum()
    }

    pub fn account_ids(&self) -> Vec<AccountId> {
        let mut ids = self.lock_agents().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn snapshots(&self) -> Vec<AgentSnapshot> {
        let mut snapshots = self
            .live_agents()
            .into_iter()
            .map(|agent| AgentSnapshot {
                account_id: agent.account_id().clone(),
                created_at_ms: agent.created_at_ms(),
                last_used_at_ms: agent.last_used_at_ms(),
                access_count: agent.access_count(),
                memory_estimate_mb: agent.memory_estimate_mb(),
                health: agent.health_status(),
            })
            .collect::<Vec<_>>();
        snapshots.sort_by(|left, right| left.account_id.cmp(&right.account_id));
        snapshots
    }

    async fn obtain(&self, account_id: &AccountId, touch: bool) -> Result<Arc<Agent>, SessionError> {
        if let Some(agent) = self.get(account_id) {
            if touch {
                agent.touch();
            }
            return Ok(agent);
        }

        let gate = self.creation_gate(account_id);
        let _creation = gate.lock().await;
        if let Some(agent) = self.get(account_id) {
            if touch {
                agent.touch();
            }
            return Ok(agent);
        }

        let record = self
            .store
            .get(account_id)
            .await?
            .ok_or_else(|| SessionError::AccountNotFound(account_id.clone()))?;
        if !record.is_active {
            return Err(SessionError::AccountInactive(account_id.clone()));
        }
        let agent = Arc::new(Agent::new(AgentParams {
            account_id: account_id.clone(),
            did: record.identity.did.clone(),
            service_endpoint: record.service_endpoint.clone(),
            client: Arc::clone(&self.client),
            clock: Arc::clone(&self.clock),
            operation_timeout: Duration::from_millis(self.config.operation_timeout_ms.max(1)),
            base_memory_mb: self.config.agent_base_memory_mb,
            health_smoothing: self.config.health_smoothing,
        }));
        let session_valid = agent.handshake(&record.session.access_jwt).await?;
        if touch {
            agent.touch();
        }
        tracing::debug!(
            account_id = %account_id,
            session_valid,
            token = %record.token_fingerprint(),
            "agent created"
        );
        self.lock_agents()
            .insert(account_id.clone(), Arc::clone(&agent));
        Ok(agent)
    }

    async fn probe_agent(&self, agent: &Agent) -> HealthStatus {
        let (status, failure) = agent.probe().await;
        match failure {
            Some(reason) => self.events.emit(DiagnosticEvent::HealthCheckFailed {
                account_id: agent.account_id().clone(),
                reason,
            }),
            None => self.events.emit(DiagnosticEvent::HealthCheckCompleted {
                account_id: agent.account_id().clone(),
                level: status.level,
                score: status.score,
                response_time_ms: status.average_response_time_ms.round() as u64,
            }),
        }
        status
    }

    fn creation_gate(&self, account_id: &AccountId) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.lock_gates();
        Arc::clone(
            gates
                .entry(account_id.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    fn live_agents(&self) -> Vec<Arc<Agent>> {
        self.lock_agents().values().cloned().collect()
    }

    fn lock_agents(&self) -> MutexGuard<'_, HashMap<AccountId, Arc<Agent>>> {
        self.agents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_gates(&self) -> MutexGuard<'_, HashMap<AccountId, Arc<tokio::sync::Mutex<()>>>> {
        self.creation_gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("config", &self.config)
            .field("agents", &self.account_ids())
            .finish()
    }
}
