use serde::{Deserialize, Serialize};

const LATENCY_FLOOR_MS: f64 = 200.0;
const LATENCY_CEILING_MS: f64 = 5_000.0;
const ERROR_WEIGHT: f64 = 50.0;
const LATENCY_WEIGHT: f64 = 30.0;
const SESSION_WEIGHT: f64 = 20.0;
const DEGRADED_BELOW_SCORE: u8 = 70;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `HealthLevel` values.
pub enum HealthLevel {
    Online,
    Degraded,
    Offline,
}

/// Point-in-time health of one agent. Plain data, safe to hand out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub level: HealthLevel,
    pub is_online: bool,
    pub last_health_check_ms: Option<u64>,
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub session_valid: bool,
    pub score: u8,
}

impl HealthStatus {
    /// Status reported when no round-trip could be attempted at all.
    pub fn unreachable(now_ms: u64) -> Self {
        Self {
            level: HealthLevel::Offline,
            is_online: false,
            last_health_check_ms: Some(now_ms),
            average_response_time_ms: 0.0,
            error_rate: 1.0,
            session_valid: false,
            score: compute_health_score(1.0, 0.0, false),
        }
    }
}

/// Weighted 0..=100 score from error rate, latency and session validity.
pub fn compute_health_score(error_rate: f64, average_response_ms: f64, session_valid: bool) -> u8 {
    let error_rate = error_rate.clamp(0.0, 1.0);
    let error_component = (1.0 - error_rate) * ERROR_WEIGHT;
    let latency_fraction = ((average_response_ms - LATENCY_FLOOR_MS)
        / (LATENCY_CEILING_MS - LATENCY_FLOOR_MS))
        .clamp(0.0, 1.0);
    let latency_component = (1.0 - latency_fraction) * LATENCY_WEIGHT;
    let session_component = if session_valid { SESSION_WEIGHT } else { 0.0 };
    (error_component + latency_component + session_component)
        .round()
        .clamp(0.0, 100.0) as u8
}

pub fn classify_health_level(is_online: bool, score: u8) -> HealthLevel {
    if !is_online {
        HealthLevel::Offline
    } else if score < DEGRADED_BELOW_SCORE {
        HealthLevel::Degraded
    } else {
        HealthLevel::Online
    }
}

#[derive(Debug, Clone)]
pub(crate) struct HealthTracker {
    smoothing: f64,
    average_response_ms: Option<f64>,
    error_rate: f64,
    last_check_ms: Option<u64>,
    is_online: bool,
    session_valid: bool,
}

impl HealthTracker {
    pub(crate) fn new(smoothing: f64, session_valid: bool) -> Self {
        Self {
            smoothing: smoothing.clamp(0.01, 1.0),
            average_response_ms: None,
            error_rate: 0.0,
            last_check_ms: None,
            is_online: true,
            session_valid,
        }
    }

    pub(crate) fn record_success(&mut self, now_ms: u64, elapsed_ms: u64) {
        self.record_latency(elapsed_ms);
        self.error_rate = self.blend(self.error_rate, 0.0);
        self.last_check_ms = Some(now_ms);
        self.is_online = true;
    }

    pub(crate) fn record_failure(&mut self, now_ms: u64, elapsed_ms: u64, reachable: bool) {
        self.record_latency(elapsed_ms);
        self.error_rate = self.blend(self.error_rate, 1.0);
        self.last_check_ms = Some(now_ms);
        self.is_online = reachable;
    }

    pub(crate) fn set_session_valid(&mut self, valid: bool) {
        self.session_valid = valid;
    }

    pub(crate) fn snapshot(&self) -> HealthStatus {
        let average_response_time_ms = self.average_response_ms.unwrap_or(0.0);
        let score = compute_health_score(
            self.error_rate,
            average_response_time_ms,
            self.session_valid,
        );
        HealthStatus {
            level: classify_health_level(self.is_online, score),
            is_online: self.is_online,
            last_health_check_ms: self.last_check_ms,
            average_response_time_ms,
            error_rate: self.error_rate,
            session_valid: self.session_valid,
            score,
        }
    }

    fn record_latency(&mut self, elapsed_ms: u64) {
        let sample = elapsed_ms as f64;
        self.average_response_ms = Some(match self.average_response_ms {
            Some(previous) => self.blend(previous, sample),
            None => sample,
        });
    }

    fn blend(&self, previous: f64, sample: f64) -> f64 {
        self.smoothing * sample + (1.0 - self.smoothing) * previous
    }
}
