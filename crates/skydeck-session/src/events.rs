use std::sync::Arc;

use serde::Serialize;
use skydeck_core::AccountId;

use crate::error::SessionErrorKind;
use crate::health::HealthLevel;

pub type EventSink = Arc<dyn Fn(&DiagnosticEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `EvictionReason` values.
pub enum EvictionReason {
    Inactive,
    Capacity,
    MemoryPressure,
    AccountRemoved,
    /// The account signed in again against a different service endpoint.
    Replaced,
    Deactivated,
}

/// Structured diagnostics surfaced to the host application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    MonitoringStarted {
        tick_interval_ms: u64,
    },
    MonitoringStopped {
        ticks: u64,
    },
    HealthCheckCompleted {
        account_id: AccountId,
        level: HealthLevel,
        score: u8,
        response_time_ms: u64,
    },
    HealthCheckFailed {
        account_id: AccountId,
        reason: String,
    },
    NetworkStatusChanged {
        online: bool,
    },
    RefreshFailedPatternDetected {
        error_kind: SessionErrorKind,
        failed: usize,
        attempted: usize,
    },
    ReauthenticationRequired {
        account_id: AccountId,
        reason: String,
    },
    SessionRecovered {
        account_id: AccountId,
    },
    AgentEvicted {
        account_id: AccountId,
        reason: EvictionReason,
    },
}

impl DiagnosticEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosticEvent::MonitoringStarted { .. } => "monitoring_started",
            DiagnosticEvent::MonitoringStopped { .. } => "monitoring_stopped",
            DiagnosticEvent::HealthCheckCompleted { .. } => "health_check_completed",
            DiagnosticEvent::HealthCheckFailed { .. } => "health_check_failed",
            DiagnosticEvent::NetworkStatusChanged { .. } => "network_status_changed",
            DiagnosticEvent::RefreshFailedPatternDetected { .. } => {
                "refresh_failed_pattern_detected"
            }
            DiagnosticEvent::ReauthenticationRequired { .. } => "reauthentication_required",
            DiagnosticEvent::SessionRecovered { .. } => "session_recovered",
            DiagnosticEvent::AgentEvicted { .. } => "agent_evicted",
        }
    }
}

/// Fans diagnostics out to tracing and an optional host sink.
#[derive(Clone, Default)]
pub struct DiagnosticEmitter {
    sink: Option<EventSink>,
}

impl DiagnosticEmitter {
    pub fn new(sink: Option<EventSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        match &event {
            DiagnosticEvent::ReauthenticationRequired { account_id, reason } => {
                tracing::warn!(account_id = %account_id, reason = %reason, "reauthentication required");
            }
            DiagnosticEvent::RefreshFailedPatternDetected {
                error_kind,
                failed,
                attempted,
            } => {
                tracing::warn!(?error_kind, failed, attempted, "refresh failure pattern detected");
            }
            DiagnosticEvent::HealthCheckFailed { account_id, reason } => {
                tracing::debug!(account_id = %account_id, reason = %reason, "health check failed");
            }
            other => tracing::debug!(event = other.name(), "session diagnostic"),
        }
        if let Some(sink) = &self.sink {
            sink(&event);
        }
    }
}

impl std::fmt::Debug for DiagnosticEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiagnosticEmitter")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn unit_emitter_forwards_events_and_serializes_with_type_tag() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&captured);
        let emitter = DiagnosticEmitter::new(Some(Arc::new(move |event: &DiagnosticEvent| {
            sink_events
                .lock()
                .expect("capture lock")
                .push(serde_json::to_value(event).expect("serialize event"));
        })));

        emitter.emit(DiagnosticEvent::ReauthenticationRequired {
            account_id: AccountId::new("did:plc:alice"),
            reason: "refresh failed 3 times".to_string(),
        });

        let events = captured.lock().expect("capture lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "reauthentication_required");
        assert_eq!(events[0]["account_id"], "did:plc:alice");
    }

    #[test]
    fn unit_emitter_without_sink_is_silent() {
        DiagnosticEmitter::default().emit(DiagnosticEvent::NetworkStatusChanged { online: false });
    }
}
