use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Session material returned by `createSession` and `refreshSession`.
pub struct CreatedSession {
    pub access_jwt: String,
    pub refresh_jwt: String,
    pub handle: String,
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub handle: String,
    pub did: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescription {
    #[serde(default)]
    pub did: Option<String>,
    #[serde(default)]
    pub available_user_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `NetworkFailureKind` values.
pub enum NetworkFailureKind {
    Connect,
    Request,
    Body,
    Unreachable,
    Other,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Enumerates supported `ProtocolError` values.
pub enum ProtocolError {
    #[error("network failure ({kind:?}): {message}")]
    Network {
        kind: NetworkFailureKind,
        message: String,
    },
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("service returned status {status}: {error_code} {message}")]
    HttpStatus {
        status: u16,
        error_code: String,
        message: String,
    },
    #[error("token rejected by service: {reason}")]
    TokenRejected { reason: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ProtocolError {
    /// True for failures worth retrying with the same inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            ProtocolError::Network { .. } | ProtocolError::Timeout { .. } => true,
            ProtocolError::HttpStatus { status, .. } => crate::retry::should_retry_status(*status),
            ProtocolError::TokenRejected { .. }
            | ProtocolError::AuthenticationFailed(_)
            | ProtocolError::MalformedToken(_)
            | ProtocolError::InvalidResponse(_) => false,
        }
    }

    /// True when the token itself can never succeed again.
    pub fn is_token_rejection(&self) -> bool {
        matches!(
            self,
            ProtocolError::TokenRejected { .. } | ProtocolError::MalformedToken(_)
        )
    }
}
