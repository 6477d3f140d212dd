use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skydeck_core::AccountId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AuthType` values.
pub enum AuthType {
    OAuth,
    AppPassword,
}

impl AuthType {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthType::OAuth => "oauth",
            AuthType::AppPassword => "app_password",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountIdentity {
    pub handle: String,
    pub did: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
/// Access/refresh token pair plus the server-provided expiry hint.
pub struct SessionTokens {
    pub access_jwt: String,
    pub refresh_jwt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_expires_unix_ms: Option<u64>,
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("access_jwt", &"[REDACTED]")
            .field("refresh_jwt", &"[REDACTED]")
            .field("access_expires_unix_ms", &self.access_expires_unix_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccountRecord {
    pub account_id: AccountId,
    pub identity: AccountIdentity,
    pub session: SessionTokens,
    pub service_endpoint: String,
    pub auth_type: AuthType,
    pub is_active: bool,
    pub created_unix_ms: u64,
    pub updated_unix_ms: u64,
}

impl AccountRecord {
    /// Loggable identifier of the current access token.
    pub fn token_fingerprint(&self) -> String {
        token_fingerprint(&self.session.access_jwt)
    }

    /// Returns a copy carrying `session`, with identity fields untouched
    /// except for a server-reported handle change.
    pub fn with_refreshed_session(
        &self,
        session: SessionTokens,
        handle: Option<&str>,
        now_unix_ms: u64,
    ) -> Self {
        let mut next = self.clone();
        next.session = session;
        if let Some(handle) = handle.map(str::trim).filter(|value| !value.is_empty()) {
            next.identity.handle = handle.to_string();
        }
        next.updated_unix_ms = now_unix_ms;
        next
    }

    /// Soft-deleted copy: tokens and identity are kept, the account just
    /// stops taking part in validation.
    pub fn deactivated(&self, now_unix_ms: u64) -> Self {
        let mut next = self.clone();
        next.is_active = false;
        next.updated_unix_ms = now_unix_ms;
        next
    }
}

/// SHA-256 hex digest of a token, safe to log and persist.
pub fn token_fingerprint(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AccountRecord {
        AccountRecord {
            account_id: AccountId::new("did:plc:alice"),
            identity: AccountIdentity {
                handle: "alice.test".to_string(),
                did: "did:plc:alice".to_string(),
                display_name: Some("Alice".to_string()),
                avatar_url: None,
            },
            session: SessionTokens {
                access_jwt: "access-secret".to_string(),
                refresh_jwt: "refresh-secret".to_string(),
                access_expires_unix_ms: Some(10),
            },
            service_endpoint: "https://pds.example".to_string(),
            auth_type: AuthType::AppPassword,
            is_active: true,
            created_unix_ms: 1,
            updated_unix_ms: 1,
        }
    }

    #[test]
    fn unit_session_tokens_debug_output_is_redacted() {
        let rendered = format!("{:?}", record());
        assert!(!rendered.contains("access-secret"));
        assert!(!rendered.contains("refresh-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn unit_refreshed_session_keeps_did_and_updates_handle() {
        let original = record();
        let refreshed = original.with_refreshed_session(
            SessionTokens {
                access_jwt: "next-access".to_string(),
                refresh_jwt: "next-refresh".to_string(),
                access_expires_unix_ms: Some(99),
            },
            Some("alice.new"),
            50,
        );
        assert_eq!(refreshed.identity.did, "did:plc:alice");
        assert_eq!(refreshed.identity.handle, "alice.new");
        assert_eq!(refreshed.updated_unix_ms, 50);
        assert_eq!(refreshed.created_unix_ms, 1);

        let blank_handle = original.with_refreshed_session(original.session.clone(), Some(" "), 2);
        assert_eq!(blank_handle.identity.handle, "alice.test");
    }

    #[test]
    fn unit_deactivated_record_keeps_tokens_and_clears_active_flag() {
        let deactivated = record().deactivated(42);
        assert!(!deactivated.is_active);
        assert_eq!(deactivated.updated_unix_ms, 42);
        assert_eq!(deactivated.session.refresh_jwt, "refresh-secret");
        assert_eq!(deactivated.identity.handle, "alice.test");
    }

    #[test]
    fn unit_token_fingerprint_is_stable_hex_digest() {
        let first = token_fingerprint("token");
        assert_eq!(first.len(), 64);
        assert_eq!(first, token_fingerprint("token"));
        assert_ne!(first, token_fingerprint("token2"));
    }
}
