use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tokio::time::sleep;

use crate::{
    retry::{next_backoff_ms_with_jitter, retry_budget_allows_delay, should_retry_status},
    CreatedSession, IdentityClient, NetworkFailureKind, ProfileView, ProtocolError,
    ServerDescription, SessionInfo,
};

pub const DEFAULT_SERVICE_URL: &str = "https://bsky.social";

const NSID_CREATE_SESSION: &str = "com.atproto.server.createSession";
const NSID_GET_SESSION: &str = "com.atproto.server.getSession";
const NSID_REFRESH_SESSION: &str = "com.atproto.server.refreshSession";
const NSID_DESCRIBE_SERVER: &str = "com.atproto.server.describeServer";
const NSID_GET_PROFILE: &str = "app.bsky.actor.getProfile";

#[derive(Debug, Clone)]
/// Public struct `XrpcClientConfig` used across skydeck components.
pub struct XrpcClientConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
    pub user_agent: String,
}

impl Default for XrpcClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_base_ms: 200,
            retry_backoff_max_ms: 3_000,
            retry_budget_ms: 0,
            retry_jitter: true,
            user_agent: concat!("skydeck/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct XrpcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Credential {
    None,
    Bearer,
}

#[derive(Debug, Clone)]
/// reqwest-backed `IdentityClient` speaking XRPC over HTTPS.
pub struct XrpcClient {
    client: reqwest::Client,
    config: XrpcClientConfig,
}

impl XrpcClient {
    pub fn new(config: XrpcClientConfig) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(
                config.request_timeout_ms.max(1),
            ))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|error| {
                ProtocolError::InvalidResponse(format!("failed to build http client: {error}"))
            })?;
        Ok(Self { client, config })
    }

    fn endpoint(service_url: &str, nsid: &str) -> String {
        format!("{}/xrpc/{nsid}", service_url.trim().trim_end_matches('/'))
    }

    async fn query<T: DeserializeOwned>(
        &self,
        service_url: &str,
        nsid: &str,
        bearer: Option<&str>,
        params: &[(&str, &str)],
    ) -> Result<T, ProtocolError> {
        let url = Self::endpoint(service_url, nsid);
        let started = std::time::Instant::now();
        let max_retries = self.config.max_retries;
        let credential = if bearer.is_some() {
            Credential::Bearer
        } else {
            Credential::None
        };

        for attempt in 0..=max_retries {
            let mut request = self.client.get(&url).query(params);
            if let Some(token) = bearer {
                request = request.header(AUTHORIZATION, format!("Bearer {}", token.trim()));
            }
            let error = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    return decode_success(response).await;
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let raw = response.text().await.unwrap_or_default();
                    classify_error_status(status, &raw, credential)
                }
                Err(error) => map_transport_error(&error, self.config.request_timeout_ms),
            };

            let retryable = match &error {
                ProtocolError::HttpStatus { status, .. } => should_retry_status(*status),
                other => other.is_transient(),
            };
            if attempt < max_retries && retryable {
                let backoff_ms = next_backoff_ms_with_jitter(
                    self.config.retry_backoff_base_ms,
                    self.config.retry_backoff_max_ms,
                    attempt,
                    self.config.retry_jitter,
                );
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                if retry_budget_allows_delay(elapsed_ms, backoff_ms, self.config.retry_budget_ms) {
                    tracing::debug!(nsid, attempt, backoff_ms, error = %error, "retrying xrpc query");
                    sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    continue;
                }
            }
            return Err(error);
        }

        Err(ProtocolError::InvalidResponse(
            "query retry loop terminated unexpectedly".to_string(),
        ))
    }

    async fn procedure<T: DeserializeOwned>(
        &self,
        service_url: &str,
        nsid: &str,
        bearer: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Result<T, ProtocolError> {
        let mut request = self.client.post(Self::endpoint(service_url, nsid));
        if let Some(token) = bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token.trim()));
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let credential = if bearer.is_some() {
            Credential::Bearer
        } else {
            Credential::None
        };
        match request.send().await {
            Ok(response) if response.status().is_success() => decode_success(response).await,
            Ok(response) => {
                let status = response.status().as_u16();
                let raw = response.text().await.unwrap_or_default();
                Err(classify_error_status(status, &raw, credential))
            }
            Err(error) => Err(map_transport_error(&error, self.config.request_timeout_ms)),
        }
    }
}

#[async_trait]
impl IdentityClient for XrpcClient {
    async fn create_session(
        &self,
        service_url: &str,
        identifier: &str,
        password: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.procedure(
            service_url,
            NSID_CREATE_SESSION,
            None,
            Some(json!({ "identifier": identifier.trim(), "password": password })),
        )
        .await
    }

    async fn get_session(
        &self,
        service_url: &str,
        access_jwt: &str,
    ) -> Result<SessionInfo, ProtocolError> {
        self.query(service_url, NSID_GET_SESSION, Some(access_jwt), &[])
            .await
    }

    async fn refresh_session(
        &self,
        service_url: &str,
        refresh_jwt: &str,
    ) -> Result<CreatedSession, ProtocolError> {
        self.procedure(service_url, NSID_REFRESH_SESSION, Some(refresh_jwt), None)
            .await
    }

    async fn describe_server(&self, service_url: &str) -> Result<ServerDescription, ProtocolError> {
        self.query(service_url, NSID_DESCRIBE_SERVER, None, &[])
            .await
    }

    async fn get_profile(
        &self,
        service_url: &str,
        access_jwt: &str,
        actor: &str,
    ) -> Result<ProfileView, ProtocolError> {
        self.query(
            service_url,
            NSID_GET_PROFILE,
            Some(access_jwt),
            &[("actor", actor)],
        )
        .await
    }
}

async fn decode_success<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ProtocolError> {
    let raw = response.text().await.map_err(|error| ProtocolError::Network {
        kind: NetworkFailureKind::Body,
        message: error.to_string(),
    })?;
    serde_json::from_str::<T>(&raw)
        .map_err(|error| ProtocolError::InvalidResponse(format!("failed to decode body: {error}")))
}

fn classify_error_status(status: u16, raw: &str, credential: Credential) -> ProtocolError {
    let body = serde_json::from_str::<XrpcErrorBody>(raw).unwrap_or_default();
    let error_code = body.error.unwrap_or_default();
    let message = body.message.unwrap_or_default();
    match (status, error_code.as_str(), credential) {
        (_, "ExpiredToken" | "InvalidToken", _) | (401, _, Credential::Bearer) => {
            ProtocolError::TokenRejected {
                reason: if error_code.is_empty() {
                    format!("status {status}")
                } else {
                    error_code
                },
            }
        }
        (401, _, Credential::None) => ProtocolError::AuthenticationFailed(if message.is_empty() {
            error_code
        } else {
            message
        }),
        _ => ProtocolError::HttpStatus {
            status,
            error_code,
            message,
        },
    }
}

fn map_transport_error(error: &reqwest::Error, timeout_ms: u64) -> ProtocolError {
    if error.is_timeout() {
        return ProtocolError::Timeout {
            after_ms: timeout_ms,
        };
    }
    let kind = if error.is_connect() {
        NetworkFailureKind::Connect
    } else if error.is_request() {
        NetworkFailureKind::Request
    } else if error.is_body() || error.is_decode() {
        NetworkFailureKind::Body
    } else {
        NetworkFailureKind::Other
    };
    ProtocolError::Network {
        kind,
        message: error.to_string(),
    }
}
