use serde::{Deserialize, Serialize};
use skydeck_core::AccountId;
use skydeck_protocol::ProtocolError;
use skydeck_store::StoreError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionErrorKind` values.
pub enum SessionErrorKind {
    AgentCreationFailed,
    SessionInvalid,
    NetworkError,
    TokenCorrupted,
    HealthCheckFailed,
    StoreIo,
    AccountNotFound,
    AccountRemoved,
    AccountInactive,
    AgentDisposed,
    AuthenticationFailed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Enumerates supported `SessionError` values.
pub enum SessionError {
    #[error("agent creation failed for '{account_id}': {reason}")]
    AgentCreationFailed {
        account_id: AccountId,
        reason: String,
        retryable: bool,
    },
    #[error("session for '{account_id}' is invalid: {reason}")]
    SessionInvalid { account_id: AccountId, reason: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("token for '{account_id}' is corrupted: {reason}")]
    TokenCorrupted { account_id: AccountId, reason: String },
    #[error("health check failed for '{account_id}': {reason}")]
    HealthCheckFailed { account_id: AccountId, reason: String },
    #[error("credential store error: {0}")]
    StoreIo(String),
    #[error("account '{0}' is not known to the credential store")]
    AccountNotFound(AccountId),
    #[error("account '{0}' has been removed")]
    AccountRemoved(AccountId),
    #[error("account '{0}' is deactivated")]
    AccountInactive(AccountId),
    #[error("agent for '{0}' was disposed")]
    AgentDisposed(AccountId),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::AgentCreationFailed { .. } => SessionErrorKind::AgentCreationFailed,
            SessionError::SessionInvalid { .. } => SessionErrorKind::SessionInvalid,
            SessionError::NetworkError(_) => SessionErrorKind::NetworkError,
            SessionError::TokenCorrupted { .. } => SessionErrorKind::TokenCorrupted,
            SessionError::HealthCheckFailed { .. } => SessionErrorKind::HealthCheckFailed,
            SessionError::StoreIo(_) => SessionErrorKind::StoreIo,
            SessionError::AccountNotFound(_) => SessionErrorKind::AccountNotFound,
            SessionError::AccountRemoved(_) => SessionErrorKind::AccountRemoved,
            SessionError::AccountInactive(_) => SessionErrorKind::AccountInactive,
            SessionError::AgentDisposed(_) => SessionErrorKind::AgentDisposed,
            SessionError::AuthenticationFailed(_) => SessionErrorKind::AuthenticationFailed,
        }
    }

    /// Transient failures that are retried internally with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            SessionError::NetworkError(_)
            | SessionError::HealthCheckFailed { .. }
            | SessionError::StoreIo(_) => true,
            SessionError::AgentCreationFailed { retryable, .. } => *retryable,
            SessionError::SessionInvalid { .. }
            | SessionError::TokenCorrupted { .. }
            | SessionError::AccountNotFound(_)
            | SessionError::AccountRemoved(_)
            | SessionError::AccountInactive(_)
            | SessionError::AgentDisposed(_)
            | SessionError::AuthenticationFailed(_) => false,
        }
    }

    /// Failures that must go straight to the re-authentication flow.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, SessionError::TokenCorrupted { .. })
    }

    pub(crate) fn from_protocol(account_id: &AccountId, error: ProtocolError) -> Self {
        match error {
            ProtocolError::TokenRejected { reason } => SessionError::TokenCorrupted {
                account_id: account_id.clone(),
                reason,
            },
            ProtocolError::MalformedToken(reason) => SessionError::TokenCorrupted {
                account_id: account_id.clone(),
                reason,
            },
            ProtocolError::AuthenticationFailed(reason) => {
                SessionError::AuthenticationFailed(reason)
            }
            ProtocolError::HttpStatus {
                status,
                error_code,
                message,
            } if !skydeck_protocol::retry::should_retry_status(status) => {
                SessionError::SessionInvalid {
                    account_id: account_id.clone(),
                    reason: format!("status {status}: {error_code} {message}"),
                }
            }
            other => SessionError::NetworkError(other.to_string()),
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        SessionError::StoreIo(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_protocol_errors_map_onto_session_taxonomy() {
        let id = AccountId::new("did:plc:alice");
        let corrupted = SessionError::from_protocol(
            &id,
            ProtocolError::TokenRejected {
                reason: "InvalidToken".to_string(),
            },
        );
        assert_eq!(corrupted.kind(), SessionErrorKind::TokenCorrupted);
        assert!(corrupted.requires_reauthentication());
        assert!(!corrupted.is_retryable());

        let timeout = SessionError::from_protocol(&id, ProtocolError::Timeout { after_ms: 5 });
        assert_eq!(timeout.kind(), SessionErrorKind::NetworkError);
        assert!(timeout.is_retryable());

        let rejected = SessionError::from_protocol(
            &id,
            ProtocolError::HttpStatus {
                status: 400,
                error_code: "AccountTakedown".to_string(),
                message: String::new(),
            },
        );
        assert_eq!(rejected.kind(), SessionErrorKind::SessionInvalid);
        assert!(!rejected.requires_reauthentication());
    }

    #[test]
    fn unit_store_errors_become_retryable_store_io() {
        let error: SessionError = StoreError::Io("disk full".to_string()).into();
        assert_eq!(error.kind(), SessionErrorKind::StoreIo);
        assert!(error.is_retryable());
    }
}
