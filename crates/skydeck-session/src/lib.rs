//! Multi-account session and agent-pool lifecycle.
//!
//! `AgentPool` owns per-account agents and enforces capacity, memory and
//! inactivity limits. `SessionManager` tracks session validity and refreshes
//! tokens with exactly one in-flight refresh per account.

mod agent;
mod config;
mod error;
mod events;
mod health;
mod manager;
mod pool;
mod state;

#[cfg(test)]
mod test_support;

pub use agent::Agent;
pub use config::{AgentPoolConfig, SessionManagerConfig};
pub use error::{SessionError, SessionErrorKind};
pub use events::{DiagnosticEmitter, DiagnosticEvent, EventSink, EvictionReason};
pub use health::{classify_health_level, compute_health_score, HealthLevel, HealthStatus};
pub use manager::SessionManager;
pub use pool::{AgentPool, AgentSnapshot, EvictionReport};
pub use state::{
    ConcurrentSessionState, InvalidReason, RefreshOutcome, SessionHealth, SessionPhase,
    SessionState, SessionStatus, ValidationResult,
};

#[cfg(test)]
mod tests;
