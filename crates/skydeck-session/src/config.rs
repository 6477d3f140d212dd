/// Agent pool tunables, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentPoolConfig {
    pub max_agents: usize,
    pub inactive_timeout_ms: u64,
    pub memory_threshold_mb: f64,
    pub cleanup_interval_ms: u64,
    pub health_check_interval_ms: u64,
    /// Agents used within this window are never evicted for capacity or
    /// memory pressure.
    pub recent_use_grace_ms: u64,
    pub agent_base_memory_mb: f64,
    pub operation_timeout_ms: u64,
    /// Weight of the newest sample in the health moving averages.
    pub health_smoothing: f64,
}

impl Default for AgentPoolConfig {
    fn default() -> Self {
        Self {
            max_agents: 10,
            inactive_timeout_ms: 30 * 60 * 1_000,
            memory_threshold_mb: 256.0,
            cleanup_interval_ms: 5 * 60 * 1_000,
            health_check_interval_ms: 2 * 60 * 1_000,
            recent_use_grace_ms: 60 * 1_000,
            agent_base_memory_mb: 8.0,
            operation_timeout_ms: 10_000,
            health_smoothing: 0.3,
        }
    }
}

/// Session manager tunables, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionManagerConfig {
    pub refresh_failure_threshold: u32,
    pub refresh_safety_margin_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_transient_retries: u32,
    pub operation_timeout_ms: u64,
    pub session_stale_after_ms: u64,
    pub failure_pattern_min_failures: usize,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            refresh_failure_threshold: 3,
            refresh_safety_margin_ms: 5 * 60 * 1_000,
            backoff_base_ms: 500,
            backoff_max_ms: 5_000,
            max_transient_retries: 2,
            operation_timeout_ms: 10_000,
            session_stale_after_ms: 30 * 60 * 1_000,
            failure_pattern_min_failures: 2,
        }
    }
}
