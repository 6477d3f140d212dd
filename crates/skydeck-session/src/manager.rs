use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use skydeck_core::{is_due_unix_ms, AccountId};
use skydeck_protocol::retry::next_backoff_ms;
use skydeck_protocol::{decode_jwt_claims, JwtClaims, ProtocolError, DEFAULT_SERVICE_URL};
use skydeck_store::{AccountIdentity, AccountRecord, AuthType, SessionTokens};
use tokio::sync::watch;

use crate::config::SessionManagerConfig;
use crate::error::{SessionError, SessionErrorKind};
use crate::events::{DiagnosticEmitter, DiagnosticEvent, EvictionReason};
use crate::health::{HealthLevel, HealthStatus};
use crate::pool::{AgentPool, EvictionReport};
use crate::state::{
    ConcurrentSessionState, InvalidReason, RefreshOutcome, SessionHealth, SessionPhase,
    SessionState, SessionStatus, ValidationResult,
};

type OutcomeReceiver = watch::Receiver<Option<RefreshOutcome>>;
type OutcomeSender = watch::Sender<Option<RefreshOutcome>>;

struct SessionEntry {
    state: SessionState,
    handle: Option<String>,
    phase_before_refresh: SessionPhase,
    inflight: Option<OutcomeReceiver>,
}

impl SessionEntry {
    fn new(account_id: &AccountId) -> Self {
        Self {
            state: SessionState::unvalidated(account_id.clone()),
            handle: None,
            phase_before_refresh: SessionPhase::Unvalidated,
            inflight: None,
        }
    }
}

struct RefreshSuccess {
    handle: String,
    next_due_at_ms: u64,
}

enum RefreshTicket {
    Joined(OutcomeReceiver),
    Started(OutcomeReceiver, RefreshFlight),
    Rejected(RefreshOutcome),
}

struct ManagerInner {
    config: SessionManagerConfig,
    pool: Arc<AgentPool>,
    sessions: Mutex<HashMap<AccountId, SessionEntry>>,
    refresh_executions: AtomicU64,
}

/// Owns per-account session state and drives validation and refresh.
///
/// Refreshes are single-flight per account: the first caller spawns the
/// refresh task and every concurrent caller awaits the same outcome. The
/// task runs to completion even if all callers go away.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, pool: Arc<AgentPool>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                pool,
                sessions: Mutex::new(HashMap::new()),
                refresh_executions: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.inner.pool
    }

    pub fn events(&self) -> &DiagnosticEmitter {
        self.inner.pool.events()
    }

    /// Number of refresh round-trips started, after coalescing.
    pub fn refresh_executions(&self) -> u64 {
        self.inner.refresh_executions.load(Ordering::SeqCst)
    }

    pub fn get_session_state(&self, account_id: &AccountId) -> Option<SessionState> {
        self.inner
            .lock_sessions()
            .get(account_id)
            .map(|entry| entry.state.clone())
    }

    pub fn session_states(&self) -> Vec<SessionState> {
        let mut states = self
            .inner
            .lock_sessions()
            .values()
            .map(|entry| entry.state.clone())
            .collect::<Vec<_>>();
        states.sort_by(|left, right| left.account_id.cmp(&right.account_id));
        states
    }

    pub fn is_refresh_in_progress(&self, account_id: &AccountId) -> bool {
        self.inner
            .lock_sessions()
            .get(account_id)
            .is_some_and(|entry| entry.state.refresh_in_progress)
    }

    /// Marks the account's agent as used.
    pub fn touch(&self, account_id: &AccountId) -> bool {
        self.inner.pool.touch(account_id)
    }

    pub fn get_agent_health(&self, account_id: &AccountId) -> Option<HealthStatus> {
        self.inner.pool.agent_health(account_id)
    }

    pub async fn run_health_checks(&self) -> Vec<(AccountId, HealthStatus)> {
        self.inner.pool.health_check_all().await
    }

    /// Eviction sweep that never touches an account with a refresh in flight.
    pub fn run_eviction_sweep(&self) -> EvictionReport {
        self.inner
            .pool
            .run_eviction_sweep(|account_id| self.is_refresh_in_progress(account_id))
    }

    /// Refreshes the account's session, joining a refresh already in flight.
    /// Failures are reported in the outcome, never raised.
    pub async fn proactive_refresh(&self, account_id: &AccountId) -> RefreshOutcome {
        match self.begin_refresh(account_id) {
            RefreshTicket::Rejected(outcome) => outcome,
            RefreshTicket::Joined(receiver) => await_outcome(account_id, receiver).await,
            RefreshTicket::Started(receiver, flight) => {
                let inner = Arc::clone(&self.inner);
                let target = account_id.clone();
                tokio::spawn(async move {
                    let result = inner.execute_refresh(&target).await;
                    flight.complete(result);
                });
                await_outcome(account_id, receiver).await
            }
        }
    }

    /// Validates every stored account. Accounts are refreshed concurrently
    /// and independently; one account failing never affects another.
    pub async fn validate_all(&self) -> Vec<ValidationResult> {
        let records = match self.inner.pool.store().list_all().await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(error = %error, "credential store unavailable during validation");
                let error = SessionError::from(error);
                return self
                    .session_states()
                    .into_iter()
                    .filter(|state| state.phase != SessionPhase::Removed)
                    .map(|state| ValidationResult {
                        account_id: state.account_id,
                        handle: None,
                        is_valid: state.is_valid,
                        refreshed: false,
                        phase: state.phase,
                        error: Some(error.clone()),
                    })
                    .collect();
            }
        };

        let now = self.inner.now_ms();
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        {
            let mut sessions = self.inner.lock_sessions();
            for record in records.iter().filter(|record| record.is_active) {
                let entry = sessions
                    .entry(record.account_id.clone())
                    .or_insert_with(|| SessionEntry::new(&record.account_id));
                entry.handle = Some(record.identity.handle.clone());
                if self.inner.needs_refresh(entry, record, now) {
                    pending.push(record.account_id.clone());
                } else {
                    results.insert(
                        record.account_id.clone(),
                        validation_result(entry, false, None),
                    );
                }
            }
        }

        let refreshes = pending.iter().map(|account_id| self.proactive_refresh(account_id));
        let outcomes = futures_util::future::join_all(refreshes).await;
        {
            let sessions = self.inner.lock_sessions();
            for outcome in &outcomes {
                let result = match sessions.get(&outcome.account_id) {
                    Some(entry) => validation_result(entry, true, outcome.error.clone()),
                    None => ValidationResult {
                        account_id: outcome.account_id.clone(),
                        handle: None,
                        is_valid: false,
                        refreshed: true,
                        phase: SessionPhase::Removed,
                        error: outcome.error.clone(),
                    },
                };
                results.insert(outcome.account_id.clone(), result);
            }
        }
        self.inner.detect_failure_pattern(&outcomes);

        let results = results.into_values().collect::<Vec<_>>();
        tracing::debug!(
            accounts = results.len(),
            refreshed = outcomes.len(),
            valid = results.iter().filter(|result| result.is_valid).count(),
            "session validation pass"
        );
        results
    }

    /// Creates a session with an identifier and app password, persists the
    /// account and returns its fresh state.
    pub async fn sign_in(
        &self,
        identifier: &str,
        password: &str,
        service_url: Option<&str>,
    ) -> Result<SessionState, SessionError> {
        let service_url = service_url
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_SERVICE_URL)
            .trim_end_matches('/')
            .to_string();
        let pool = &self.inner.pool;
        let created = match tokio::time::timeout(
            self.inner.operation_timeout(),
            pool.client().create_session(&service_url, identifier, password),
        )
        .await
        {
            Ok(Ok(created)) => created,
            Ok(Err(ProtocolError::AuthenticationFailed(reason))) => {
                return Err(SessionError::AuthenticationFailed(reason));
            }
            Ok(Err(error)) => {
                return Err(SessionError::from_protocol(&AccountId::new(identifier), error));
            }
            Err(_) => {
                return Err(SessionError::NetworkError(format!(
                    "sign-in timed out after {}ms",
                    self.inner.config.operation_timeout_ms
                )));
            }
        };

        let account_id = AccountId::new(created.did.clone());
        let claims = decode_access_claims(&account_id, &created.access_jwt)?;
        // Refreshes requested while the new tokens are stored join this claim
        // instead of overwriting them with a rotated pair.
        let flight = self.claim_account(&account_id).await;
        let now = self.inner.now_ms();
        let lifetime_ms = access_lifetime_ms(&claims, now);
        let persisted = async {
            let existing = pool.store().get(&account_id).await?;
            let profile = match tokio::time::timeout(
                self.inner.operation_timeout(),
                pool.client()
                    .get_profile(&service_url, &created.access_jwt, &created.did),
            )
            .await
            {
                Ok(Ok(profile)) => Some(profile),
                Ok(Err(error)) => {
                    tracing::debug!(account_id = %account_id, error = %error, "profile lookup skipped");
                    None
                }
                Err(_) => None,
            };

            let previous_identity = existing.as_ref().map(|record| &record.identity);
            let record = AccountRecord {
                account_id: account_id.clone(),
                identity: AccountIdentity {
                    handle: created.handle.clone(),
                    did: created.did.clone(),
                    display_name: profile
                        .as_ref()
                        .and_then(|profile| profile.display_name.clone())
                        .or_else(|| {
                            previous_identity.and_then(|identity| identity.display_name.clone())
                        }),
                    avatar_url: profile
                        .as_ref()
                        .and_then(|profile| profile.avatar.clone())
                        .or_else(|| {
                            previous_identity.and_then(|identity| identity.avatar_url.clone())
                        }),
                },
                session: SessionTokens {
                    access_jwt: created.access_jwt.clone(),
                    refresh_jwt: created.refresh_jwt.clone(),
                    access_expires_unix_ms: Some(now.saturating_add(lifetime_ms)),
                },
                service_endpoint: service_url.clone(),
                auth_type: AuthType::AppPassword,
                is_active: true,
                created_unix_ms: existing
                    .as_ref()
                    .map(|record| record.created_unix_ms)
                    .unwrap_or(now),
                updated_unix_ms: now,
            };
            pool.store().put(&record).await?;
            Ok::<AccountRecord, SessionError>(record)
        }
        .await;
        let record = match persisted {
            Ok(record) => record,
            Err(error) => {
                flight.settle(|_| Some(error.clone()));
                return Err(error);
            }
        };

        if let Some(agent) = pool.get(&account_id) {
            if agent.service_endpoint() != record.service_endpoint {
                pool.evict(&account_id, EvictionReason::Replaced);
            } else {
                agent.set_session_valid(true);
            }
        }

        let next_due_at_ms = self.inner.next_due_after(now, lifetime_ms);
        let mut recovered = false;
        let mut signed_in = None;
        flight.settle(|entry| {
            if entry.state.phase == SessionPhase::Removed {
                *entry = SessionEntry::new(&account_id);
            }
            recovered = entry.state.reauth_required;
            entry.handle = Some(record.identity.handle.clone());
            let state = &mut entry.state;
            state.phase = SessionPhase::Valid;
            state.is_valid = true;
            state.last_validated_at_ms = Some(now);
            state.refresh_failure_count = 0;
            state.next_refresh_due_at_ms = Some(next_due_at_ms);
            state.reauth_required = false;
            state.invalid_reason = None;
            state.last_error = None;
            signed_in = Some(state.clone());
            None
        });
        let state = signed_in.ok_or_else(|| SessionError::AccountNotFound(account_id.clone()))?;
        if recovered {
            self.events().emit(DiagnosticEvent::SessionRecovered {
                account_id: account_id.clone(),
            });
        }
        tracing::info!(
            account_id = %account_id,
            handle = %record.identity.handle,
            token = %record.token_fingerprint(),
            "account signed in"
        );
        Ok(state)
    }

    /// Signs the account out: waits for any refresh in flight, drops its
    /// agent and deletes its record. The account stays `Removed`.
    pub async fn remove_account(&self, account_id: &AccountId) -> Result<(), SessionError> {
        let known = self.inner.lock_sessions().contains_key(account_id);
        if !known && self.inner.pool.store().get(account_id).await?.is_none() {
            return Err(SessionError::AccountNotFound(account_id.clone()));
        }

        {
            let mut sessions = self.inner.lock_sessions();
            let entry = sessions
                .entry(account_id.clone())
                .or_insert_with(|| SessionEntry::new(account_id));
            if entry.state.phase == SessionPhase::Removed {
                return Err(SessionError::AccountRemoved(account_id.clone()));
            }
            mark_removed(&mut entry.state);
        }

        let flight = self.claim_account(account_id).await;
        // A sign-in that held the account before us may have revived it.
        if let Some(entry) = self.inner.lock_sessions().get_mut(account_id) {
            mark_removed(&mut entry.state);
        }
        let pool = &self.inner.pool;
        let deleted = pool
            .retire_with(
                account_id,
                EvictionReason::AccountRemoved,
                pool.store().delete(account_id),
            )
            .await;
        flight.settle(|_| Some(SessionError::AccountRemoved(account_id.clone())));
        deleted?;
        tracing::info!(account_id = %account_id, "account removed");
        Ok(())
    }

    /// Takes the account out of rotation without signing it out. The agent
    /// is dropped and the record is kept with `is_active = false`; validation
    /// and refresh skip it until the account signs in again.
    pub async fn deactivate_account(&self, account_id: &AccountId) -> Result<(), SessionError> {
        if self.inner.is_removed(account_id) {
            return Err(SessionError::AccountRemoved(account_id.clone()));
        }
        let store = self.inner.pool.store();
        if store.get(account_id).await?.is_none() {
            return Err(SessionError::AccountNotFound(account_id.clone()));
        }

        let flight = self.claim_account(account_id).await;
        let retired = if self.inner.is_removed(account_id) {
            Err(SessionError::AccountRemoved(account_id.clone()))
        } else {
            async {
                let record = store
                    .get(account_id)
                    .await?
                    .ok_or_else(|| SessionError::AccountNotFound(account_id.clone()))?
                    .deactivated(self.inner.now_ms());
                self.inner
                    .pool
                    .retire_with(account_id, EvictionReason::Deactivated, store.put(&record))
                    .await?;
                Ok::<AccountRecord, SessionError>(record)
            }
            .await
        };
        let record = match retired {
            Ok(record) => record,
            Err(error) => {
                flight.settle(|_| Some(error.clone()));
                return Err(error);
            }
        };
        flight.settle(|entry| {
            let state = &mut entry.state;
            state.phase = SessionPhase::Unvalidated;
            state.is_valid = false;
            state.refresh_failure_count = 0;
            state.next_refresh_due_at_ms = None;
            state.reauth_required = false;
            state.invalid_reason = None;
            state.last_error = None;
            Some(SessionError::AccountInactive(account_id.clone()))
        });
        tracing::info!(
            account_id = %account_id,
            token = %record.token_fingerprint(),
            "account deactivated"
        );
        Ok(())
    }

    /// Per-account summary of every stored account.
    pub async fn session_statuses(&self) -> Result<Vec<SessionStatus>, SessionError> {
        let records = self.inner.pool.store().list_all().await?;
        let sessions = self.inner.lock_sessions();
        let statuses = records
            .into_iter()
            .filter_map(|record| {
                let state = sessions.get(&record.account_id).map(|entry| &entry.state);
                if state.is_some_and(|state| state.phase == SessionPhase::Removed) {
                    return None;
                }
                let agent_health = self.inner.pool.agent_health(&record.account_id);
                let last_used = self
                    .inner
                    .pool
                    .get(&record.account_id)
                    .map(|agent| agent.last_used_at_ms());
                let is_valid = state.is_some_and(|state| state.is_valid);
                Some(SessionStatus {
                    is_connected: is_valid
                        && agent_health.as_ref().is_some_and(|health| health.is_online),
                    health: classify_session_health(state, agent_health.as_ref()),
                    last_activity_ms: last_used
                        .or_else(|| state.and_then(|state| state.last_validated_at_ms)),
                    handle: record.identity.handle,
                    is_active: record.is_active,
                    account_id: record.account_id,
                })
            })
            .collect();
        Ok(statuses)
    }

    /// Handles of active accounts whose sessions are currently valid.
    pub async fn active_handles(&self) -> Result<Vec<String>, SessionError> {
        let records = self.inner.pool.store().list_all().await?;
        let sessions = self.inner.lock_sessions();
        let mut handles = records
            .into_iter()
            .filter(|record| record.is_active)
            .filter(|record| {
                sessions
                    .get(&record.account_id)
                    .is_some_and(|entry| entry.state.is_valid)
            })
            .map(|record| record.identity.handle)
            .collect::<Vec<_>>();
        handles.sort();
        Ok(handles)
    }

    pub async fn concurrent_session_state(&self) -> Result<ConcurrentSessionState, SessionError> {
        let records = self.inner.pool.store().list_all().await?;
        let mut active_accounts = records
            .iter()
            .filter(|record| record.is_active)
            .map(|record| record.account_id.clone())
            .collect::<Vec<_>>();
        active_accounts.sort();
        Ok(ConcurrentSessionState {
            all_accounts_active: !records.is_empty() && active_accounts.len() == records.len(),
            total_accounts: records.len(),
            active_accounts,
        })
    }

    fn begin_refresh(&self, account_id: &AccountId) -> RefreshTicket {
        let mut sessions = self.inner.lock_sessions();
        let entry = sessions
            .entry(account_id.clone())
            .or_insert_with(|| SessionEntry::new(account_id));
        if entry.state.phase == SessionPhase::Removed {
            return RefreshTicket::Rejected(RefreshOutcome::rejected(
                account_id,
                SessionError::AccountRemoved(account_id.clone()),
            ));
        }
        if let Some(receiver) = &entry.inflight {
            return RefreshTicket::Joined(receiver.clone());
        }

        entry.phase_before_refresh = entry.state.phase;
        entry.state.phase = SessionPhase::RefreshPending;
        self.inner.refresh_executions.fetch_add(1, Ordering::SeqCst);
        let (receiver, flight) = self.install_flight(entry, account_id, FlightKind::Refresh);
        RefreshTicket::Started(receiver, flight)
    }

    /// Holds the account for a write outside a refresh. Waits out a refresh
    /// already in flight; refreshes requested while the claim is held join it.
    async fn claim_account(&self, account_id: &AccountId) -> RefreshFlight {
        loop {
            let inflight = {
                let mut sessions = self.inner.lock_sessions();
                let entry = sessions
                    .entry(account_id.clone())
                    .or_insert_with(|| SessionEntry::new(account_id));
                match entry.inflight.clone() {
                    Some(receiver) => receiver,
                    None => {
                        return self
                            .install_flight(entry, account_id, FlightKind::Exclusive)
                            .1;
                    }
                }
            };
            await_outcome(account_id, inflight).await;
        }
    }

    fn install_flight(
        &self,
        entry: &mut SessionEntry,
        account_id: &AccountId,
        kind: FlightKind,
    ) -> (OutcomeReceiver, RefreshFlight) {
        let (sender, receiver) = watch::channel(None);
        entry.state.refresh_in_progress = true;
        entry.inflight = Some(receiver.clone());
        (
            receiver,
            RefreshFlight {
                inner: Arc::clone(&self.inner),
                account_id: account_id.clone(),
                kind,
                sender: Some(sender),
            },
        )
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.inner.config)
            .field("pool", &self.inner.pool)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Refresh,
    /// Sign-in, deactivation or removal holding the account.
    Exclusive,
}

/// Completes the in-flight marker on every exit path. If the owning task
/// is dropped before finishing (panic, runtime shutdown, abandoned caller),
/// waiters still receive a failure and the account is released.
struct RefreshFlight {
    inner: Arc<ManagerInner>,
    account_id: AccountId,
    kind: FlightKind,
    sender: Option<OutcomeSender>,
}

impl RefreshFlight {
    fn complete(mut self, result: Result<RefreshSuccess, SessionError>) {
        let outcome = self.inner.finish_refresh(&self.account_id, result);
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome));
        }
    }

    /// Releases an exclusive claim. `update` runs under the sessions lock and
    /// returns the error reported to callers that joined the claim.
    fn settle(mut self, update: impl FnOnce(&mut SessionEntry) -> Option<SessionError>) {
        let outcome = self.inner.release_claim(&self.account_id, update);
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for RefreshFlight {
    fn drop(&mut self) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let outcome = match self.kind {
            FlightKind::Refresh => self.inner.finish_refresh(
                &self.account_id,
                Err(SessionError::NetworkError(
                    "refresh task ended before completing".to_string(),
                )),
            ),
            FlightKind::Exclusive => self.inner.release_claim(&self.account_id, |_| {
                Some(SessionError::NetworkError(
                    "account update ended before completing".to_string(),
                ))
            }),
        };
        sender.send_replace(Some(outcome));
    }
}

impl ManagerInner {
    fn now_ms(&self) -> u64 {
        (self.pool.clock())()
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.operation_timeout_ms.max(1))
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<AccountId, SessionEntry>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_removed(&self, account_id: &AccountId) -> bool {
        self.lock_sessions()
            .get(account_id)
            .is_some_and(|entry| entry.state.phase == SessionPhase::Removed)
    }

    /// Refresh lands `min(margin, lifetime / 2)` before the access token
    /// expires, measured on the local clock from the issued lifetime.
    fn next_due_after(&self, now_ms: u64, lifetime_ms: u64) -> u64 {
        let margin = self.config.refresh_safety_margin_ms.min(lifetime_ms / 2);
        now_ms.saturating_add(
            lifetime_ms
                .saturating_sub(margin)
                .max(self.config.backoff_base_ms),
        )
    }

    fn needs_refresh(&self, entry: &mut SessionEntry, record: &AccountRecord, now: u64) -> bool {
        let state = &mut entry.state;
        match state.phase {
            SessionPhase::Removed => false,
            SessionPhase::RefreshPending => true,
            SessionPhase::Invalid => {
                state.invalid_reason == Some(InvalidReason::RetryBudgetExhausted)
                    && is_due_unix_ms(state.next_refresh_due_at_ms, now)
            }
            SessionPhase::Unvalidated if state.refresh_failure_count == 0 => {
                let expires_at = decode_jwt_claims(&record.session.access_jwt)
                    .ok()
                    .and_then(|claims| {
                        record
                            .session
                            .access_expires_unix_ms
                            .or_else(|| claims.expires_unix_ms())
                    });
                match expires_at {
                    Some(expires_at)
                        if expires_at > now.saturating_add(self.config.refresh_safety_margin_ms) =>
                    {
                        state.phase = SessionPhase::Valid;
                        state.is_valid = true;
                        state.last_validated_at_ms = Some(now);
                        state.next_refresh_due_at_ms =
                            Some(expires_at - self.config.refresh_safety_margin_ms);
                        false
                    }
                    _ => true,
                }
            }
            SessionPhase::Unvalidated => is_due_unix_ms(state.next_refresh_due_at_ms, now),
            SessionPhase::Valid => {
                let stale = state.last_validated_at_ms.map_or(true, |validated| {
                    now.saturating_sub(validated) >= self.config.session_stale_after_ms
                });
                stale || is_due_unix_ms(state.next_refresh_due_at_ms, now)
            }
        }
    }

    async fn execute_refresh(&self, account_id: &AccountId) -> Result<RefreshSuccess, SessionError> {
        let store = self.pool.store();
        let record = store
            .get(account_id)
            .await?
            .ok_or_else(|| SessionError::AccountNotFound(account_id.clone()))?;
        if !record.is_active {
            return Err(SessionError::AccountInactive(account_id.clone()));
        }
        decode_jwt_claims(&record.session.refresh_jwt).map_err(|error| {
            SessionError::TokenCorrupted {
                account_id: account_id.clone(),
                reason: format!("stored refresh token: {error}"),
            }
        })?;

        let mut attempt = 0_u32;
        let created = loop {
            let result = match self.pool.get_or_create(account_id).await {
                Ok(agent) => agent.refresh_session(&record.session.refresh_jwt).await,
                Err(error) => Err(error),
            };
            match result {
                Ok(created) => break created,
                Err(error)
                    if error.is_retryable() && attempt < self.config.max_transient_retries =>
                {
                    let delay_ms = next_backoff_ms(
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        attempt,
                    );
                    tracing::debug!(
                        account_id = %account_id,
                        attempt,
                        delay_ms,
                        error = %error,
                        "retrying session refresh"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        };

        if created.did != record.identity.did {
            return Err(SessionError::SessionInvalid {
                account_id: account_id.clone(),
                reason: format!("refreshed session belongs to '{}'", created.did),
            });
        }
        let claims = decode_access_claims(account_id, &created.access_jwt)?;
        let now = self.now_ms();
        let lifetime_ms = access_lifetime_ms(&claims, now);
        let updated = record.with_refreshed_session(
            SessionTokens {
                access_jwt: created.access_jwt,
                refresh_jwt: created.refresh_jwt,
                access_expires_unix_ms: Some(now.saturating_add(lifetime_ms)),
            },
            Some(&created.handle),
            now,
        );
        if self.is_removed(account_id) {
            return Err(SessionError::AccountRemoved(account_id.clone()));
        }
        store.put(&updated).await?;
        self.pool.mark_session_valid(account_id, true);

        let next_due_at_ms = self.next_due_after(now, lifetime_ms);
        tracing::info!(
            account_id = %account_id,
            token = %updated.token_fingerprint(),
            next_due_at_ms,
            "session refreshed"
        );
        Ok(RefreshSuccess {
            handle: updated.identity.handle,
            next_due_at_ms,
        })
    }

    fn finish_refresh(
        &self,
        account_id: &AccountId,
        result: Result<RefreshSuccess, SessionError>,
    ) -> RefreshOutcome {
        let now = self.now_ms();
        let mut events = Vec::new();
        let outcome = {
            let mut sessions = self.lock_sessions();
            let removed = sessions
                .get(account_id)
                .is_some_and(|entry| entry.state.phase == SessionPhase::Removed);
            if !removed && matches!(result, Err(SessionError::AccountNotFound(_))) {
                sessions.remove(account_id);
                RefreshOutcome::rejected(
                    account_id,
                    SessionError::AccountNotFound(account_id.clone()),
                )
            } else {
                match sessions.get_mut(account_id) {
                    None => RefreshOutcome::rejected(
                        account_id,
                        result
                            .err()
                            .unwrap_or_else(|| SessionError::AccountNotFound(account_id.clone())),
                    ),
                    Some(entry) => {
                        entry.state.refresh_in_progress = false;
                        entry.inflight = None;
                        if removed {
                            RefreshOutcome::rejected(
                                account_id,
                                SessionError::AccountRemoved(account_id.clone()),
                            )
                        } else {
                            self.apply_refresh_result(entry, result, now, &mut events)
                        }
                    }
                }
            }
        };
        if outcome.reauth_required {
            self.pool.mark_session_valid(account_id, false);
        }
        for event in events {
            self.pool.events().emit(event);
        }
        outcome
    }

    fn apply_refresh_result(
        &self,
        entry: &mut SessionEntry,
        result: Result<RefreshSuccess, SessionError>,
        now: u64,
        events: &mut Vec<DiagnosticEvent>,
    ) -> RefreshOutcome {
        let state = &mut entry.state;
        let mut reauth_signalled = false;
        let error = match result {
            Ok(success) => {
                if state.reauth_required {
                    events.push(DiagnosticEvent::SessionRecovered {
                        account_id: state.account_id.clone(),
                    });
                }
                entry.handle = Some(success.handle);
                state.phase = SessionPhase::Valid;
                state.is_valid = true;
                state.last_validated_at_ms = Some(now);
                state.refresh_failure_count = 0;
                state.next_refresh_due_at_ms = Some(success.next_due_at_ms);
                state.reauth_required = false;
                state.invalid_reason = None;
                state.last_error = None;
                None
            }
            Err(error @ (SessionError::StoreIo(_) | SessionError::AccountInactive(_))) => {
                state.phase = entry.phase_before_refresh;
                state.last_error = Some(error.to_string());
                Some(error)
            }
            Err(error) => {
                state.refresh_failure_count = state.refresh_failure_count.saturating_add(1);
                state.last_error = Some(error.to_string());
                let exhausted = state.refresh_failure_count >= self.config.refresh_failure_threshold;
                if error.requires_reauthentication() || exhausted {
                    let reason = if error.requires_reauthentication() {
                        InvalidReason::TokenCorrupted
                    } else {
                        InvalidReason::RetryBudgetExhausted
                    };
                    reauth_signalled = !state.reauth_required;
                    state.phase = SessionPhase::Invalid;
                    state.is_valid = false;
                    state.reauth_required = true;
                    state.invalid_reason = Some(reason);
                    state.next_refresh_due_at_ms = match reason {
                        InvalidReason::RetryBudgetExhausted => {
                            Some(now.saturating_add(self.config.backoff_max_ms))
                        }
                        InvalidReason::TokenCorrupted => None,
                    };
                    if reauth_signalled {
                        events.push(DiagnosticEvent::ReauthenticationRequired {
                            account_id: state.account_id.clone(),
                            reason: error.to_string(),
                        });
                    }
                } else {
                    state.phase = entry.phase_before_refresh;
                    state.next_refresh_due_at_ms = Some(now.saturating_add(next_backoff_ms(
                        self.config.backoff_base_ms,
                        self.config.backoff_max_ms,
                        state.refresh_failure_count - 1,
                    )));
                }
                Some(error)
            }
        };
        RefreshOutcome {
            reauth_signalled,
            ..settled_outcome(state, error)
        }
    }

    fn release_claim(
        &self,
        account_id: &AccountId,
        update: impl FnOnce(&mut SessionEntry) -> Option<SessionError>,
    ) -> RefreshOutcome {
        let mut sessions = self.lock_sessions();
        let Some(entry) = sessions.get_mut(account_id) else {
            return RefreshOutcome::rejected(
                account_id,
                SessionError::AccountNotFound(account_id.clone()),
            );
        };
        entry.state.refresh_in_progress = false;
        entry.inflight = None;
        let error = update(entry);
        settled_outcome(&entry.state, error)
    }

    /// Flags a dominant failure kind across one validation pass.
    fn detect_failure_pattern(&self, outcomes: &[RefreshOutcome]) {
        let attempted = outcomes.len();
        let mut failures: BTreeMap<SessionErrorKind, usize> = BTreeMap::new();
        for error in outcomes.iter().filter_map(|outcome| outcome.error.as_ref()) {
            *failures.entry(error.kind()).or_default() += 1;
        }
        let dominant = failures
            .into_iter()
            .max_by(|(_, left), (_, right)| left.cmp(right));
        if let Some((error_kind, failed)) = dominant {
            if failed >= self.config.failure_pattern_min_failures && failed * 2 >= attempted {
                self.pool
                    .events()
                    .emit(DiagnosticEvent::RefreshFailedPatternDetected {
                        error_kind,
                        failed,
                        attempted,
                    });
            }
        }
    }
}

async fn await_outcome(account_id: &AccountId, mut receiver: OutcomeReceiver) -> RefreshOutcome {
    let settled = match receiver.wait_for(Option::is_some).await {
        Ok(value) => (*value).clone(),
        Err(_) => None,
    };
    settled.unwrap_or_else(|| {
        RefreshOutcome::rejected(
            account_id,
            SessionError::NetworkError("refresh ended without an outcome".to_string()),
        )
    })
}

fn settled_outcome(state: &SessionState, error: Option<SessionError>) -> RefreshOutcome {
    RefreshOutcome {
        account_id: state.account_id.clone(),
        error,
        refresh_failure_count: state.refresh_failure_count,
        next_refresh_due_at_ms: state.next_refresh_due_at_ms,
        reauth_required: state.reauth_required,
        reauth_signalled: false,
    }
}

fn mark_removed(state: &mut SessionState) {
    state.phase = SessionPhase::Removed;
    state.is_valid = false;
    state.next_refresh_due_at_ms = None;
}

fn validation_result(
    entry: &SessionEntry,
    refreshed: bool,
    error: Option<SessionError>,
) -> ValidationResult {
    ValidationResult {
        account_id: entry.state.account_id.clone(),
        handle: entry.handle.clone(),
        is_valid: entry.state.is_valid,
        refreshed,
        phase: entry.state.phase,
        error,
    }
}

fn decode_access_claims(account_id: &AccountId, access_jwt: &str) -> Result<JwtClaims, SessionError> {
    decode_jwt_claims(access_jwt).map_err(|error| SessionError::TokenCorrupted {
        account_id: account_id.clone(),
        reason: format!("access token: {error}"),
    })
}

/// Prefers the issued lifetime so a skewed local clock cannot shorten or
/// stretch the schedule.
fn access_lifetime_ms(claims: &JwtClaims, now_ms: u64) -> u64 {
    claims
        .issued_lifetime_ms()
        .or_else(|| {
            claims
                .expires_unix_ms()
                .map(|expires| expires.saturating_sub(now_ms))
        })
        .unwrap_or(0)
}

fn classify_session_health(
    state: Option<&SessionState>,
    agent_health: Option<&HealthStatus>,
) -> SessionHealth {
    if let Some(state) = state {
        if state.reauth_required || state.phase == SessionPhase::Invalid {
            return SessionHealth::Error;
        }
    }
    match agent_health.map(|health| health.level) {
        Some(HealthLevel::Online) => SessionHealth::Healthy,
        Some(HealthLevel::Degraded) => SessionHealth::Warning,
        Some(HealthLevel::Offline) | None => SessionHealth::Disconnected,
    }
}
