use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use skydeck_core::{AccountId, ClockFn};
use skydeck_protocol::{
    decode_jwt_claims, encode_unsigned_jwt, CreatedSession, IdentityClient, JwtClaims,
    ProfileView, ProtocolError, ServerDescription, SessionInfo,
};
use skydeck_store::{AccountIdentity, AccountRecord, AuthType, SessionTokens};

pub const SIMULATED_SERVICE_URL: &str = "https://pds.simulated.invalid";
const SIMULATED_SERVICE_DID: &str = "did:web:pds.simulated.invalid";
const DEFAULT_ACCESS_LIFETIME_SECS: u64 = 2 * 60 * 60;
const DEFAULT_REFRESH_LIFETIME_SECS: u64 = 90 * 24 * 60 * 60;

/// Wall clock that follows tokio time, so paused-time tests drive both the
/// scheduler and token expiry from one source.
pub fn simulation_clock(start_unix_ms: u64) -> ClockFn {
    let origin = tokio::time::Instant::now();
    Arc::new(move || {
        let elapsed = tokio::time::Instant::now().saturating_duration_since(origin);
        start_unix_ms.saturating_add(elapsed.as_millis() as u64)
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SimulatorCallCounts {
    pub create_session: u64,
    pub get_session: u64,
    pub refresh_session: u64,
    pub describe_server: u64,
    pub get_profile: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    create_session: AtomicU64,
    get_session: AtomicU64,
    refresh_session: AtomicU64,
    describe_server: AtomicU64,
    get_profile: AtomicU64,
}

#[derive(Debug, Clone)]
struct SimulatedAccount {
    did: String,
    handle: String,
    password: String,
    display_name: Option<String>,
    access_jwt: String,
    refresh_jwt: String,
}

/// In-memory identity service with rotating refresh tokens.
///
/// Every refresh invalidates the presented refresh token, so a replayed or
/// concurrently duplicated refresh is rejected the way a real service would.
pub struct SimulatedIdentityService {
    clock: ClockFn,
    access_lifetime_secs: u64,
    refresh_lifetime_secs: u64,
    latency_ms: AtomicU64,
    token_serial: AtomicU64,
    accounts: Mutex<HashMap<String, SimulatedAccount>>,
    counters: CallCounters,
}

impl SimulatedIdentityService {
    pub fn new(clock: ClockFn) -> Self {
        Self {
            clock,
            access_lifetime_secs: DEFAULT_ACCESS_LIFETIME_SECS,
            refresh_lifetime_secs: DEFAULT_REFRESH_LIFETIME_SECS,
            latency_ms: AtomicU64::new(0),
            token_serial: AtomicU64::new(1),
            accounts: Mutex::new(HashMap::new()),
            counters: CallCounters::default(),
        }
    }

    pub fn with_access_lifetime(mut self, lifetime: Duration) -> Self {
        self.access_lifetime_secs = lifetime.as_secs().max(1);
        self
    }

    /// Registers an account and returns a credential record holding a live
    /// session for it.
    pub fn register_account(&self, handle: &str, password: &str) -> AccountRecord {
        let did = format!("did:plc:{}", handle.replace('.', "-"));
        let now = (self.clock)();
        let (access_jwt, refresh_jwt) = self.issue_pair(&did, now);
        let account = SimulatedAccount {
            did: did.clone(),
            handle: handle.to_string(),
            password: password.to_string(),
            display_name: Some(handle.split('.').next().unwrap_or(handle).to_string()),
            access_jwt: access_jwt.clone(),
            refresh_jwt: refresh_jwt.clone(),
        };
        self.lock_accounts().insert(did.clone(), account);
        AccountRecord {
            account_id: AccountId::new(did.clone()),
            identity: AccountIdentity {
                handle: handle.to_string(),
                did,
                display_name: None,
                avatar_url: None,
            },
            session: SessionTokens {
                access_jwt,
                refresh_jwt,
                access_expires_unix_ms: Some(now + self.access_lifetime_secs * 1_000),
            },
            service_endpoint: SIMULATED_SERVICE_URL.to_string(),
            auth_type: AuthType::AppPassword,
            is_active: true,
            created_unix_ms: now,
            updated_unix_ms: now,
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Invalidates every token issued to `did`; only a new sign-in recovers.
    pub fn revoke_sessions(&self, did: &str) -> bool {
        match self.lock_accounts().get_mut(did) {
            Some(account) => {
                account.access_jwt.clear();
                account.refresh_jwt.clear();
                true
            }
            None => false,
        }
    }

    pub fn rename_handle(&self, did: &str, handle: &str) -> bool {
        match self.lock_accounts().get_mut(did) {
            Some(account) => {
                account.handle = handle.to_string();
                true
            }
            None => false,
        }
    }

    pub fn call_counts(&self) -> SimulatorCallCounts {
        SimulatorCallCounts {
            create_session: self.counters.create_session.load(Ordering::SeqCst),
            get_session: self.counters.get_session.load(Ordering::SeqCst),
            refresh_session: self.counters.refresh_session.load(Ordering::SeqCst),
            describe_server: self.counters.describe_server.load(Ordering::SeqCst),
            get_profile: self.counters.get_profile.load(Ordering::SeqCst),
        }
    }

    fn issue_pair(&self, did: &str, now_ms: u64) -> (String, String) {
        let iat = now_ms / 1_000;
        let serial = self.token_serial.fetch_add(1, Ordering::SeqCst);
        // The serial keeps rotated tokens distinct within one second.
        let token = |scope: &str, lifetime_secs: u64| {
            encode_unsigned_jwt(&JwtClaims {
                sub: Some(did.to_string()),
                aud: Some(SIMULATED_SERVICE_DID.to_string()),
                scope: Some(format!("{scope}#{serial}")),
                iat: Some(iat),
                exp: Some(iat + lifetime_secs),
            })
        };
        (
            token("com.atproto.access", self.access_lifetime_secs),
            token("com.atproto.refresh", self.refresh_lifetime_secs),
        )
    }

    fn authorize(&self, token: &str, refresh: bool) -> Result<SimulatedAccount, ProtocolError> {
        let claims = decode_jwt_claims(token)?;
        let did = claims
            .sub
            .clone()
            .ok_or_else(|| ProtocolError::MalformedToken("token has no sub claim".to_string()))?;
        let accounts = self.lock_accounts();
        let account = accounts.get(&did).ok_or_else(|| ProtocolError::TokenRejected {
            reason: "InvalidToken".to_string(),
        })?;
        let current = if refresh {
            &account.refresh_jwt
        } else {
            &account.access_jwt
        };
        if current.is_empty() || current != token {
            return Err(ProtocolError::TokenRejected {
                reason: "InvalidToken".to_string(),
            });
        }
        let expired = claims
            .expires_unix_ms()
            .is_some_and(|expires| expires <= (self.clock)());
        if expired {
            return Err(ProtocolError::TokenRejected {
                reason: "ExpiredToken".to_string(),
            });
        }
        Ok(account.clone())
    }

    fn rotate(&self, did: &str) -> Result<CreatedSession, ProtocolError> {
        let (access_jwt, refresh_jwt) = self.issue_pair(did, (self.clock)());
        let mut accounts = self.lock_accounts();
        let account = accounts.get_mut(did).ok_or_else(|| ProtocolError::TokenRejected {
            reason: "InvalidToken".to_string(),
        })?;
        account.access_jwt = access_jwt.clone();
        account.refresh_jwt = refresh_jwt.clone();
        Ok(CreatedSession {
            access_jwt,
            refresh_jwt,
            handle: account.handle.clone(),
            did: account.did.clone(),
            email: None,
            active: true,
        })
    }

    async fn simulate_latency(&self) {
        let latency_ms = self.latency_ms.load(Ordering::SeqCst);
        if latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(latency_ms)).await;
        }
    }

    fn lock_accounts(&self) -> MutexGuard<'_, HashMap<String, SimulatedAccount>> {
        self.accounts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl IdentityClient for SimulatedIdentityService {
    async fn create_session(
        &self,
        _service_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.counters.create_session.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let did = self
            .lock_accounts()
            .values()
            .find(|account| {
                (account.handle == identifier || account.did == identifier)
                    && account.password == password
            })
            .map(|account| account.did.clone())
            .ok_or_else(|| {
                ProtocolError::AuthenticationFailed("Invalid identifier or password".to_string())
            })?;
        self.rotate(&did)
    }

    async fn get_session(
        &self,
        _service_url: &str,
        access_jwt: &str,
    ) -> Result<SessionInfo, ProtocolError> {
        self.counters.get_session.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let account = self.authorize(access_jwt, false)?;
        Ok(SessionInfo {
            handle: account.handle,
            did: account.did,
            active: true,
        })
    }

    async fn refresh_session(
        &self,
        _service_url: &str,
        refresh_jwt: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.counters.refresh_session.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let account = self.authorize(refresh_jwt, true)?;
        self.rotate(&account.did)
    }

    async fn describe_server(&self, _service_url: &str) -> Result<ServerDescription, ProtocolError> {
        self.counters.describe_server.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(ServerDescription {
            did: Some(SIMULATED_SERVICE_DID.to_string()),
            available_user_domains: vec![".simulated.invalid".to_string()],
        })
    }

    async fn get_profile(
        &self,
        _service_url: &str,
        access_jwt: &str,
        actor: &str,
    ) -> Result<ProfileView, ProtocolError> {
        self.counters.get_profile.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        self.authorize(access_jwt, false)?;
        let accounts = self.lock_accounts();
        let account = accounts
            .values()
            .find(|account| account.did == actor || account.handle == actor)
            .ok_or_else(|| ProtocolError::HttpStatus {
                status: 400,
                error_code: "InvalidRequest".to_string(),
                message: format!("profile not found: {actor}"),
            })?;
        Ok(ProfileView {
            did: account.did.clone(),
            handle: account.handle.clone(),
            display_name: account.display_name.clone(),
            avatar: None,
        })
    }
}

impl std::fmt::Debug for SimulatedIdentityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedIdentityService")
            .field("accounts", &self.lock_accounts().len())
            .field("calls", &self.call_counts())
            .finish()
    }
}
