use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use skydeck_core::{AccountId, ManualClock};
use skydeck_protocol::{
    decode_jwt_claims, encode_unsigned_jwt, CreatedSession, IdentityClient, JwtClaims,
    ProfileView, ProtocolError, ServerDescription, SessionInfo,
};
use skydeck_store::{
    AccountIdentity, AccountRecord, AuthType, CredentialStore, MemoryCredentialStore, SessionTokens,
    StoreError,
};

pub(crate) const TOKEN_LIFETIME_SECS: u64 = 2 * 60 * 60;

pub(crate) fn issue_token(did: &str, now_ms: u64, lifetime_secs: u64, scope: &str) -> String {
    let iat = now_ms / 1_000;
    encode_unsigned_jwt(&JwtClaims {
        sub: Some(did.to_string()),
        aud: None,
        scope: Some(scope.to_string()),
        iat: Some(iat),
        exp: Some(iat + lifetime_secs),
    })
}

pub(crate) fn record(did: &str, handle: &str, now_ms: u64) -> AccountRecord {
    AccountRecord {
        account_id: AccountId::new(did),
        identity: AccountIdentity {
            handle: handle.to_string(),
            did: did.to_string(),
            display_name: None,
            avatar_url: None,
        },
        session: SessionTokens {
            access_jwt: issue_token(did, now_ms, TOKEN_LIFETIME_SECS, "access"),
            refresh_jwt: issue_token(did, now_ms, 90 * 24 * 60 * 60, "refresh"),
            access_expires_unix_ms: Some(now_ms + TOKEN_LIFETIME_SECS * 1_000),
        },
        service_endpoint: "https://pds.test".to_string(),
        auth_type: AuthType::AppPassword,
        is_active: true,
        created_unix_ms: now_ms,
        updated_unix_ms: now_ms,
    }
}

/// Identity client whose answers are scripted per test.
pub(crate) struct ScriptedClient {
    pub(crate) clock: ManualClock,
    pub(crate) latency_ms: AtomicU64,
    pub(crate) refresh_calls: AtomicU64,
    pub(crate) get_session_calls: AtomicU64,
    pub(crate) describe_calls: AtomicU64,
    pub(crate) refresh_script: Mutex<VecDeque<Result<(), ProtocolError>>>,
    pub(crate) get_session_failures: Mutex<HashMap<String, ProtocolError>>,
    pub(crate) describe_failure: Mutex<Option<ProtocolError>>,
    pub(crate) panic_on_refresh: AtomicBool,
}

impl ScriptedClient {
    pub(crate) fn new(clock: ManualClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            latency_ms: AtomicU64::new(0),
            refresh_calls: AtomicU64::new(0),
            get_session_calls: AtomicU64::new(0),
            describe_calls: AtomicU64::new(0),
            refresh_script: Mutex::new(VecDeque::new()),
            get_session_failures: Mutex::new(HashMap::new()),
            describe_failure: Mutex::new(None),
            panic_on_refresh: AtomicBool::new(false),
        })
    }

    pub(crate) fn script_refresh(&self, result: Result<(), ProtocolError>) {
        self.refresh_script.lock().expect("script lock").push_back(result);
    }

    pub(crate) fn fail_get_session(&self, did: &str, error: ProtocolError) {
        self.get_session_failures
            .lock()
            .expect("failure lock")
            .insert(did.to_string(), error);
    }

    pub(crate) fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }
    }
}

fn subject_of(token: &str) -> Result<String, ProtocolError> {
    decode_jwt_claims(token)?
        .sub
        .ok_or_else(|| ProtocolError::MalformedToken("missing sub".to_string()))
}

#[async_trait]
impl IdentityClient for ScriptedClient {
    async fn create_session(
        &self,
        _service_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.simulate_latency().await;
        if password != "app-password" {
            return Err(ProtocolError::AuthenticationFailed(
                "Invalid identifier or password".to_string(),
            ));
        }
        let did = format!("did:plc:{}", identifier.trim_end_matches(".test"));
        let now = self.clock.now_ms();
        Ok(CreatedSession {
            access_jwt: issue_token(&did, now, TOKEN_LIFETIME_SECS, "access"),
            refresh_jwt: issue_token(&did, now, 90 * 24 * 60 * 60, "refresh"),
            handle: identifier.to_string(),
            did,
            email: None,
            active: true,
        })
    }

    async fn get_session(
        &self,
        _service_url: &str,
        access_jwt: &str,
    ) -> Result<SessionInfo, ProtocolError> {
        self.get_session_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let did = subject_of(access_jwt)?;
        if let Some(error) = self
            .get_session_failures
            .lock()
            .expect("failure lock")
            .get(&did)
        {
            return Err(error.clone());
        }
        Ok(SessionInfo {
            handle: format!("{}.test", did.trim_start_matches("did:plc:")),
            did,
            active: true,
        })
    }

    async fn refresh_session(
        &self,
        _service_url: &str,
        refresh_jwt: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.panic_on_refresh.load(Ordering::SeqCst) {
            panic!("scripted refresh panic");
        }
        let scripted = self.refresh_script.lock().expect("script lock").pop_front();
        if let Some(Err(error)) = scripted {
            return Err(error);
        }
        let did = subject_of(refresh_jwt)?;
        let now = self.clock.now_ms();
        Ok(CreatedSession {
            access_jwt: issue_token(&did, now, TOKEN_LIFETIME_SECS, "access"),
            refresh_jwt: issue_token(&did, now, 90 * 24 * 60 * 60, "refresh"),
            handle: format!("{}.test", did.trim_start_matches("did:plc:")),
            did,
            email: None,
            active: true,
        })
    }

    async fn describe_server(&self, _service_url: &str) -> Result<ServerDescription, ProtocolError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        match self.describe_failure.lock().expect("failure lock").clone() {
            Some(error) => Err(error),
            None => Ok(ServerDescription::default()),
        }
    }

    async fn get_profile(
        &self,
        _service_url: &str,
        _access_jwt: &str,
        actor: &str,
    ) -> Result<ProfileView, ProtocolError> {
        Ok(ProfileView {
            did: actor.to_string(),
            handle: format!("{}.test", actor.trim_start_matches("did:plc:")),
            display_name: Some("Scripted".to_string()),
            avatar: None,
        })
    }
}

pub(crate) fn network_down() -> ProtocolError {
    ProtocolError::Network {
        kind: skydeck_protocol::NetworkFailureKind::Connect,
        message: "connection refused".to_string(),
    }
}

/// Memory store whose writes can be switched to fail or slowed down.
pub(crate) struct FlakyStore {
    pub(crate) inner: MemoryCredentialStore,
    pub(crate) fail_puts: AtomicBool,
    pub(crate) put_latency_ms: AtomicU64,
}

#[async_trait]
impl CredentialStore for FlakyStore {
    async fn get(&self, account_id: &AccountId) -> Result<Option<AccountRecord>, StoreError> {
        self.inner.get(account_id).await
    }

    async fn put(&self, record: &AccountRecord) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        let latency = self.put_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(latency)).await;
        }
        self.inner.put(record).await
    }

    async fn delete(&self, account_id: &AccountId) -> Result<(), StoreError> {
        self.inner.delete(account_id).await
    }

    async fn list_all(&self) -> Result<Vec<AccountRecord>, StoreError> {
        self.inner.list_all().await
    }
}
