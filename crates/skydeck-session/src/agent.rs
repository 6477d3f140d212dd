use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use skydeck_core::{AccountId, ClockFn};
use skydeck_protocol::{CreatedSession, IdentityClient, ProfileView, ProtocolError};

use crate::error::SessionError;
use crate::health::{HealthStatus, HealthTracker};

const MEMORY_PER_ACCESS_MB: f64 = 0.01;
const MAX_TRACKED_ACCESSES: u64 = 1_000;

/// Per-account client handle owned by the pool.
///
/// Callers hold an `Arc<Agent>`; eviction only removes the pool's reference
/// and flips `disposed`, so operations already running finish normally while
/// new ones fail with `AgentDisposed`.
pub struct Agent {
    account_id: AccountId,
    did: String,
    service_endpoint: String,
    client: Arc<dyn IdentityClient>,
    clock: ClockFn,
    operation_timeout: Duration,
    base_memory_mb: f64,
    created_at_ms: u64,
    last_used_at_ms: AtomicU64,
    access_count: AtomicU64,
    memory_override_bits: AtomicU64,
    disposed: AtomicBool,
    health: Mutex<HealthTracker>,
}

pub(crate) struct AgentParams {
    pub(crate) account_id: AccountId,
    pub(crate) did: String,
    pub(crate) service_endpoint: String,
    pub(crate) client: Arc<dyn IdentityClient>,
    pub(crate) clock: ClockFn,
    pub(crate) operation_timeout: Duration,
    pub(crate) base_memory_mb: f64,
    pub(crate) health_smoothing: f64,
}

impl Agent {
    pub(crate) fn new(params: AgentParams) -> Self {
        let now = (params.clock)();
        Self {
            account_id: params.account_id,
            did: params.did,
            service_endpoint: params.service_endpoint,
            client: params.client,
            clock: params.clock,
            operation_timeout: params.operation_timeout,
            base_memory_mb: params.base_memory_mb,
            created_at_ms: now,
            last_used_at_ms: AtomicU64::new(now),
            access_count: AtomicU64::new(0),
            memory_override_bits: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            health: Mutex::new(HealthTracker::new(params.health_smoothing, true)),
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn service_endpoint(&self) -> &str {
        &self.service_endpoint
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    pub fn last_used_at_ms(&self) -> u64 {
        self.last_used_at_ms.load(Ordering::SeqCst)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Estimated resident size: a fixed base plus cached-response growth,
    /// unless the host has reported a measured value.
    pub fn memory_estimate_mb(&self) -> f64 {
        let measured = f64::from_bits(self.memory_override_bits.load(Ordering::SeqCst));
        if measured > 0.0 {
            return measured;
        }
        let accesses = self.access_count().min(MAX_TRACKED_ACCESSES) as f64;
        self.base_memory_mb + accesses * MEMORY_PER_ACCESS_MB
    }

    pub fn record_memory_estimate_mb(&self, measured_mb: f64) {
        let value = if measured_mb.is_finite() && measured_mb > 0.0 {
            measured_mb
        } else {
            0.0
        };
        self.memory_override_bits
            .store(value.to_bits(), Ordering::SeqCst);
    }

    pub fn health_status(&self) -> HealthStatus {
        self.lock_health().snapshot()
    }

    pub(crate) fn touch(&self) {
        self.last_used_at_ms.store((self.clock)(), Ordering::SeqCst);
        self.access_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_session_valid(&self, valid: bool) {
        self.lock_health().set_session_valid(valid);
    }

    /// Resumes the stored session. `Ok(false)` means the service is reachable
    /// but the access token is no longer accepted.
    pub(crate) async fn handshake(&self, access_jwt: &str) -> Result<bool, SessionError> {
        let result = self
            .timed(self.client.get_session(&self.service_endpoint, access_jwt))
            .await;
        let session_valid = match result {
            Ok(info) if info.did != self.did => {
                return Err(SessionError::AgentCreationFailed {
                    account_id: self.account_id.clone(),
                    reason: format!(
                        "service resumed session for '{}' instead of '{}'",
                        info.did, self.did
                    ),
                    retryable: false,
                });
            }
            Ok(info) => info.active,
            Err(error) if error.is_token_rejection() => false,
            Err(error) => {
                return Err(SessionError::AgentCreationFailed {
                    account_id: self.account_id.clone(),
                    retryable: error.is_transient(),
                    reason: error.to_string(),
                });
            }
        };
        self.set_session_valid(session_valid);
        Ok(session_valid)
    }

    /// Exchanges the refresh token once. Retries belong to the caller.
    pub async fn refresh_session(&self, refresh_jwt: &str) -> Result<CreatedSession, SessionError> {
        self.ensure_live()?;
        self.timed(self.client.refresh_session(&self.service_endpoint, refresh_jwt))
            .await
            .map_err(|error| SessionError::from_protocol(&self.account_id, error))
    }

    pub async fn fetch_profile(&self, access_jwt: &str) -> Result<ProfileView, SessionError> {
        self.ensure_live()?;
        self.touch();
        self.timed(
            self.client
                .get_profile(&self.service_endpoint, access_jwt, &self.did),
        )
        .await
        .map_err(|error| SessionError::from_protocol(&self.account_id, error))
    }

    /// Unauthenticated round-trip against the account's service. Never fails;
    /// the outcome is folded into the returned status.
    pub(crate) async fn probe(&self) -> (HealthStatus, Option<String>) {
        let result = self
            .timed(self.client.describe_server(&self.service_endpoint))
            .await;
        let failure = result.err().map(|error| error.to_string());
        (self.health_status(), failure)
    }

    async fn timed<T, F>(&self, operation: F) -> Result<T, ProtocolError>
    where
        F: Future<Output = Result<T, ProtocolError>>,
    {
        let started = tokio::time::Instant::now();
        let result = match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Timeout {
                after_ms: self.operation_timeout.as_millis() as u64,
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let now = (self.clock)();
        {
            let mut health = self.lock_health();
            match &result {
                Ok(_) => health.record_success(now, elapsed_ms),
                // The service answered; only the token was refused.
                Err(error) if error.is_token_rejection() => health.record_success(now, elapsed_ms),
                Err(error) => health.record_failure(now, elapsed_ms, !is_unreachable(error)),
            }
        }
        result
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.is_disposed() {
            return Err(SessionError::AgentDisposed(self.account_id.clone()));
        }
        Ok(())
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthTracker> {
        self.health
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn is_unreachable(error: &ProtocolError) -> bool {
    matches!(
        error,
        ProtocolError::Network { .. } | ProtocolError::Timeout { .. }
    )
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("account_id", &self.account_id)
            .field("service_endpoint", &self.service_endpoint)
            .field("last_used_at_ms", &self.last_used_at_ms())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
