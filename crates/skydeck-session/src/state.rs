use serde::{Deserialize, Serialize};
use skydeck_core::AccountId;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionPhase` values.
pub enum SessionPhase {
    Unvalidated,
    Valid,
    RefreshPending,
    Invalid,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Why a session left the valid set.
pub enum InvalidReason {
    /// Consecutive refresh failures reached the threshold. Sweeps keep
    /// retrying, so the session can recover without user action.
    RetryBudgetExhausted,
    TokenCorrupted,
}

/// Per-account session bookkeeping. Snapshots are plain data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub account_id: AccountId,
    pub phase: SessionPhase,
    pub is_valid: bool,
    pub last_validated_at_ms: Option<u64>,
    pub refresh_in_progress: bool,
    pub refresh_failure_count: u32,
    pub next_refresh_due_at_ms: Option<u64>,
    pub reauth_required: bool,
    pub invalid_reason: Option<InvalidReason>,
    pub last_error: Option<String>,
}

impl SessionState {
    pub(crate) fn unvalidated(account_id: AccountId) -> Self {
        Self {
            account_id,
            phase: SessionPhase::Unvalidated,
            is_valid: false,
            last_validated_at_ms: None,
            refresh_in_progress: false,
            refresh_failure_count: 0,
            next_refresh_due_at_ms: None,
            reauth_required: false,
            invalid_reason: None,
            last_error: None,
        }
    }
}

/// Result of a refresh, shared verbatim by every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub account_id: AccountId,
    pub error: Option<SessionError>,
    pub refresh_failure_count: u32,
    pub next_refresh_due_at_ms: Option<u64>,
    pub reauth_required: bool,
    /// True only for the outcome that moved the account into re-auth.
    pub reauth_signalled: bool,
}

impl RefreshOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn rejected(account_id: &AccountId, error: SessionError) -> Self {
        Self {
            account_id: account_id.clone(),
            error: Some(error),
            refresh_failure_count: 0,
            next_refresh_due_at_ms: None,
            reauth_required: false,
            reauth_signalled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Per-account entry of a `validate_all` pass.
pub struct ValidationResult {
    pub account_id: AccountId,
    pub handle: Option<String>,
    pub is_valid: bool,
    /// True when this pass performed a refresh round-trip.
    pub refreshed: bool,
    pub phase: SessionPhase,
    pub error: Option<SessionError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `SessionHealth` values.
pub enum SessionHealth {
    Healthy,
    Warning,
    Error,
    Disconnected,
}

/// Which stored accounts currently take part in concurrent sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConcurrentSessionState {
    pub active_accounts: Vec<AccountId>,
    pub total_accounts: usize,
    /// False when no account is stored.
    pub all_accounts_active: bool,
}

/// Per-account summary for account lists and status bars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub account_id: AccountId,
    pub handle: String,
    pub is_active: bool,
    pub is_connected: bool,
    pub last_activity_ms: Option<u64>,
    pub health: SessionHealth,
}
