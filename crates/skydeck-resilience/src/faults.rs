use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skydeck_core::{AccountId, ClockFn};
use skydeck_protocol::{
    CreatedSession, IdentityClient, NetworkFailureKind, ProfileView, ProtocolError,
    ServerDescription, SessionInfo,
};
use skydeck_store::{AccountRecord, CredentialStore, StoreError};

/// Wraps `base` with a fixed offset, simulating a skewed device clock.
pub fn skewed_clock(base: ClockFn, offset_ms: i64) -> ClockFn {
    Arc::new(move || {
        let now = base();
        if offset_ms >= 0 {
            now.saturating_add(offset_ms as u64)
        } else {
            now.saturating_sub(offset_ms.unsigned_abs())
        }
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Faults applied to every call through a `FaultInjectingClient`.
pub struct FaultPlan {
    pub partitioned: bool,
    pub added_latency_ms: u64,
    /// Every n-th call times out; zero disables loss.
    pub drop_one_in: u64,
    /// Session-issuing calls return an undecodable access token.
    pub corrupt_tokens: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultStats {
    pub calls: u64,
    pub partitioned: u64,
    pub dropped: u64,
    pub corrupted: u64,
}

/// `IdentityClient` decorator that injects network faults.
pub struct FaultInjectingClient {
    inner: Arc<dyn IdentityClient>,
    plan: Mutex<FaultPlan>,
    calls: AtomicU64,
    partitioned: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
}

impl FaultInjectingClient {
    pub fn new(inner: Arc<dyn IdentityClient>) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            calls: AtomicU64::new(0),
            partitioned: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        }
    }

    pub fn plan(&self) -> FaultPlan {
        self.lock_plan().clone()
    }

    pub fn set_plan(&self, plan: FaultPlan) {
        tracing::debug!(?plan, "fault plan updated");
        *self.lock_plan() = plan;
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.lock_plan().partitioned = partitioned;
    }

    pub fn clear(&self) {
        self.set_plan(FaultPlan::default());
    }

    pub fn stats(&self) -> FaultStats {
        FaultStats {
            calls: self.calls.load(Ordering::SeqCst),
            partitioned: self.partitioned.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            corrupted: self.corrupted.load(Ordering::SeqCst),
        }
    }

    async fn admit(&self) -> Result<FaultPlan, ProtocolError> {
        let sequence = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let plan = self.plan();
        if plan.added_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(plan.added_latency_ms)).await;
        }
        if plan.partitioned {
            self.partitioned.fetch_add(1, Ordering::SeqCst);
            return Err(ProtocolError::Network {
                kind: NetworkFailureKind::Unreachable,
                message: "simulated network partition".to_string(),
            });
        }
        if plan.drop_one_in > 0 && sequence % plan.drop_one_in == 0 {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return Err(ProtocolError::Timeout {
                after_ms: plan.added_latency_ms,
            });
        }
        Ok(plan)
    }

    fn maybe_corrupt(&self, plan: &FaultPlan, mut session: CreatedSession) -> CreatedSession {
        if plan.corrupt_tokens {
            self.corrupted.fetch_add(1, Ordering::SeqCst);
            session.access_jwt = format!("corrupted-{}", session.access_jwt.len());
        }
        session
    }

    fn lock_plan(&self) -> MutexGuard<'_, FaultPlan> {
        self.plan
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl IdentityClient for FaultInjectingClient {
    async fn create_session(
        &self,
        service_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        let plan = self.admit().await?;
        let session = self
            .inner
            .create_session(service_url, identifier, password)
            .await?;
        Ok(self.maybe_corrupt(&plan, session))
    }

    async fn get_session(
        &self,
        service_url: &str,
        access_jwt: &str,
    ) -> Result<SessionInfo, ProtocolError> {
        self.admit().await?;
        self.inner.get_session(service_url, access_jwt).await
    }

    async fn refresh_session(
        &self,
        service_url: &str,
        refresh_jwt: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        let plan = self.admit().await?;
        let session = self.inner.refresh_session(service_url, refresh_jwt).await?;
        Ok(self.maybe_corrupt(&plan, session))
    }

    async fn describe_server(&self, service_url: &str) -> Result<ServerDescription, ProtocolError> {
        self.admit().await?;
        self.inner.describe_server(service_url).await
    }

    async fn get_profile(
        &self,
        service_url: &str,
        access_jwt: &str,
        actor: &str,
    ) -> Result<ProfileView, ProtocolError> {
        self.admit().await?;
        self.inner.get_profile(service_url, access_jwt, actor).await
    }
}

/// `CredentialStore` decorator whose reads or writes can be failed on demand.
pub struct FaultyCredentialStore {
    inner: Arc<dyn CredentialStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failures: AtomicU64,
}

impl FaultyCredentialStore {
    pub fn new(inner: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn injected_failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn check(&self, flag: &AtomicBool, operation: &str) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Io(format!("injected {operation} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FaultyCredentialStore {
    async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRecord>, StoreError> {
        self.check(&self.fail_reads, "read")?;
        self.inner.get(account_id).await
    }

    async fn put(&self, record: &AccountRecord) -> Result<(), StoreError> {
        self.check(&self.fail_writes, "write")?;
        self.inner.put(record).await
    }

    async fn delete(&self, account_id: &AccountId) -> Result<(), StoreError> {
        self.check(&self.fail_writes, "delete")?;
        self.inner.delete(account_id).await
    }

    async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError> {
        self.check(&self.fail_reads, "list")?;
        self.inner.list_all().await
    }
}

#[cfg(test)]
mod tests {
    use skydeck_core::ManualClock;
    use skydeck_store::MemoryCredentialStore;

    use super::*;
    use crate::{SimulatedIdentityService, SIMULATED_SERVICE_URL};

    fn faulty_client() -> (Arc<SimulatedIdentityService>, FaultInjectingClient) {
        let service = Arc::new(SimulatedIdentityService::new(
            ManualClock::new(1_700_000_000_000).clock_fn(),
        ));
        let client = FaultInjectingClient::new(service.clone());
        (service, client)
    }

    #[tokio::test]
    async fn functional_partition_fails_fast_without_reaching_service() {
        let (service, client) = faulty_client();
        client.set_partitioned(true);

        let error = client
            .describe_server(SIMULATED_SERVICE_URL)
            .await
            .expect_err("partitioned");

        assert!(error.is_transient());
        assert_eq!(service.call_counts().describe_server, 0);
        assert_eq!(client.stats().partitioned, 1);

        client.clear();
        client
            .describe_server(SIMULATED_SERVICE_URL)
            .await
            .expect("healed");
    }

    #[tokio::test]
    async fn functional_packet_loss_drops_every_nth_call() {
        let (_service, client) = faulty_client();
        client.set_plan(FaultPlan {
            drop_one_in: 3,
            ..FaultPlan::default()
        });

        let mut failures = 0;
        for _ in 0..9 {
            if client.describe_server(SIMULATED_SERVICE_URL).await.is_err() {
                failures += 1;
            }
        }

        assert_eq!(failures, 3);
        assert_eq!(client.stats().dropped, 3);
    }

    #[tokio::test]
    async fn functional_token_corruption_yields_undecodable_access_token() {
        let (service, client) = faulty_client();
        let record = service.register_account("alice.test", "pw");
        client.set_plan(FaultPlan {
            corrupt_tokens: true,
            ..FaultPlan::default()
        });

        let session = client
            .refresh_session(SIMULATED_SERVICE_URL, &record.session.refresh_jwt)
            .await
            .expect("refresh");

        assert!(skydeck_protocol::decode_jwt_claims(&session.access_jwt).is_err());
        assert_eq!(client.stats().corrupted, 1);
    }

    #[tokio::test]
    async fn unit_faulty_store_fails_only_selected_operations() {
        let store = FaultyCredentialStore::new(Arc::new(MemoryCredentialStore::new()));
        store.set_fail_writes(true);
        let id = AccountId::new("did:plc:alice");

        assert!(store.get(&id).await.expect("read allowed").is_none());
        assert!(matches!(store.delete(&id).await, Err(StoreError::Io(_))));
        assert_eq!(store.injected_failures(), 1);
    }

    #[test]
    fn unit_skewed_clock_offsets_in_both_directions() {
        let base = ManualClock::new(10_000);
        assert_eq!(skewed_clock(base.clock_fn(), 2_500)(), 12_500);
        assert_eq!(skewed_clock(base.clock_fn(), -20_000)(), 0);
    }
}
