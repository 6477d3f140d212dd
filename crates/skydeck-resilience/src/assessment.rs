use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use skydeck_core::AccountId;
use skydeck_session::{SessionError, SessionManager};

const DEFAULT_RECOVERY_TARGET: f64 = 0.8;
const DEFAULT_RECOVERY_BUDGET_MS: u64 = 30_000;
const RECOVERY_WEIGHT: f64 = 50.0;
const CRITICAL_WEIGHT: f64 = 30.0;
const TIMING_WEIGHT: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `FaultKind` values.
pub enum FaultKind {
    NetworkPartition,
    HighLatency,
    PacketLoss,
    TokenCorruption,
    ClockSkew,
    StoreFailure,
    ResourcePressure,
}

impl FaultKind {
    fn recommendation(self) -> &'static str {
        match self {
            FaultKind::NetworkPartition => {
                "lower the refresh backoff cap or validate on network recovery so sessions return sooner after a partition"
            }
            FaultKind::HighLatency => {
                "raise the per-operation timeout; slow round-trips are being counted as failures"
            }
            FaultKind::PacketLoss => {
                "allow more transient refresh retries; isolated drops are exhausting the failure threshold"
            }
            FaultKind::TokenCorruption => {
                "surface the re-authentication prompt prominently; corrupted tokens cannot recover on their own"
            }
            FaultKind::ClockSkew => {
                "schedule refreshes from issued token lifetimes rather than absolute expiry"
            }
            FaultKind::StoreFailure => {
                "check credential store health; refreshed tokens could not be persisted"
            }
            FaultKind::ResourcePressure => {
                "lower the agent or memory limits so eviction relieves pressure before health checks are shed"
            }
        }
    }
}

/// Measured effect of one injected fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioObservation {
    pub name: String,
    pub fault: FaultKind,
    pub sessions_valid_before: usize,
    pub sessions_valid_after: usize,
    /// Time from fault removal until recovery; `None` if it never recovered.
    pub recovery_ms: Option<u64>,
    pub integrity_violations: usize,
    pub critical_attempted: usize,
    pub critical_succeeded: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioScore {
    pub name: String,
    pub fault: FaultKind,
    pub recovery_ratio: f64,
    pub score: u8,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResilienceReport {
    pub overall_score: u8,
    pub scenarios: Vec<ScenarioScore>,
    pub recommendations: Vec<String>,
}

/// Accumulates scenario observations and scores them.
#[derive(Debug, Clone)]
pub struct ResilienceAssessment {
    recovery_target: f64,
    recovery_budget_ms: u64,
    observations: Vec<ScenarioObservation>,
}

impl Default for ResilienceAssessment {
    fn default() -> Self {
        Self::new(DEFAULT_RECOVERY_TARGET, DEFAULT_RECOVERY_BUDGET_MS)
    }
}

impl ResilienceAssessment {
    pub fn new(recovery_target: f64, recovery_budget_ms: u64) -> Self {
        Self {
            recovery_target: recovery_target.clamp(0.0, 1.0),
            recovery_budget_ms: recovery_budget_ms.max(1),
            observations: Vec::new(),
        }
    }

    pub fn record(&mut self, observation: ScenarioObservation) {
        tracing::debug!(
            scenario = %observation.name,
            fault = ?observation.fault,
            before = observation.sessions_valid_before,
            after = observation.sessions_valid_after,
            "resilience scenario recorded"
        );
        self.observations.push(observation);
    }

    pub fn observations(&self) -> &[ScenarioObservation] {
        &self.observations
    }

    pub fn report(&self) -> ResilienceReport {
        let scenarios = self
            .observations
            .iter()
            .map(|observation| self.score(observation))
            .collect::<Vec<_>>();
        let overall_score = if scenarios.is_empty() {
            0
        } else {
            let total = scenarios
                .iter()
                .map(|scenario| u32::from(scenario.score))
                .sum::<u32>();
            (total / scenarios.len() as u32) as u8
        };

        let mut recommendations = Vec::new();
        let mut seen = BTreeSet::new();
        for (scenario, observation) in scenarios.iter().zip(&self.observations) {
            if observation.integrity_violations > 0 {
                recommendations.push(format!(
                    "{}: account identity changed during the fault; audit credential writes",
                    scenario.name
                ));
            }
            if !scenario.passed && seen.insert(scenario.fault) {
                recommendations.push(format!(
                    "{}: {}",
                    scenario.name,
                    scenario.fault.recommendation()
                ));
            }
        }
        ResilienceReport {
            overall_score,
            scenarios,
            recommendations,
        }
    }

    fn score(&self, observation: &ScenarioObservation) -> ScenarioScore {
        let recovery_ratio = ratio(
            observation.sessions_valid_after,
            observation.sessions_valid_before,
        );
        let critical_ratio = ratio(observation.critical_succeeded, observation.critical_attempted);
        let timing = match observation.recovery_ms {
            Some(elapsed) if elapsed <= self.recovery_budget_ms => 1.0,
            Some(elapsed) => self.recovery_budget_ms as f64 / elapsed as f64,
            None => 0.0,
        };
        let score = if observation.integrity_violations > 0 {
            0
        } else {
            (recovery_ratio * RECOVERY_WEIGHT + critical_ratio * CRITICAL_WEIGHT + timing * TIMING_WEIGHT)
                .round()
                .clamp(0.0, 100.0) as u8
        };
        ScenarioScore {
            name: observation.name.clone(),
            fault: observation.fault,
            recovery_ratio,
            score,
            passed: observation.integrity_violations == 0 && recovery_ratio >= self.recovery_target,
        }
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        1.0
    } else {
        (numerator as f64 / denominator as f64).min(1.0)
    }
}

/// Valid sessions and stored identities captured before a fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBaseline {
    pub valid_accounts: BTreeSet<AccountId>,
    pub identities: BTreeMap<AccountId, (String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryMeasurement {
    pub expected: usize,
    pub recovered: usize,
    pub integrity_violations: Vec<String>,
}

impl RecoveryMeasurement {
    pub fn recovery_ratio(&self) -> f64 {
        ratio(self.recovered, self.expected)
    }
}

pub async fn capture_baseline(manager: &SessionManager) -> Result<SessionBaseline, SessionError> {
    let records = manager.pool().store().list_all().await?;
    let valid_accounts = manager
        .session_states()
        .into_iter()
        .filter(|state| state.is_valid)
        .map(|state| state.account_id)
        .collect();
    let identities = records
        .into_iter()
        .map(|record| {
            (
                record.account_id,
                (record.identity.did, record.identity.handle),
            )
        })
        .collect();
    Ok(SessionBaseline {
        valid_accounts,
        identities,
    })
}

/// Compares current state against `baseline`: how many previously valid
/// sessions are valid again, and whether any stored DID or handle drifted.
pub async fn measure_recovery(
    manager: &SessionManager,
    baseline: &SessionBaseline,
) -> Result<RecoveryMeasurement, SessionError> {
    let records = manager.pool().store().list_all().await?;
    let current = records
        .into_iter()
        .map(|record| {
            (
                record.account_id,
                (record.identity.did, record.identity.handle),
            )
        })
        .collect::<BTreeMap<_, _>>();

    let mut integrity_violations = Vec::new();
    for (account_id, expected) in &baseline.identities {
        match current.get(account_id) {
            Some(found) if found == expected => {}
            Some((did, handle)) => integrity_violations.push(format!(
                "{account_id}: identity changed to did={did} handle={handle}"
            )),
            None => integrity_violations.push(format!("{account_id}: record missing")),
        }
    }

    let recovered = baseline
        .valid_accounts
        .iter()
        .filter(|account_id| {
            manager
                .get_session_state(account_id)
                .is_some_and(|state| state.is_valid)
        })
        .count();
    Ok(RecoveryMeasurement {
        expected: baseline.valid_accounts.len(),
        recovered,
        integrity_violations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(name: &str, fault: FaultKind, before: usize, after: usize) -> ScenarioObservation {
        ScenarioObservation {
            name: name.to_string(),
            fault,
            sessions_valid_before: before,
            sessions_valid_after: after,
            recovery_ms: Some(5_000),
            integrity_violations: 0,
            critical_attempted: 10,
            critical_succeeded: 10,
        }
    }

    #[test]
    fn unit_full_recovery_within_budget_scores_perfectly() {
        let mut assessment = ResilienceAssessment::default();
        assessment.record(observation("partition", FaultKind::NetworkPartition, 10, 10));

        let report = assessment.report();

        assert_eq!(report.overall_score, 100);
        assert!(report.scenarios[0].passed);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn functional_failed_scenarios_produce_one_recommendation_per_fault() {
        let mut assessment = ResilienceAssessment::default();
        assessment.record(observation("partition-a", FaultKind::NetworkPartition, 10, 5));
        assessment.record(observation("partition-b", FaultKind::NetworkPartition, 10, 6));
        let mut slow = observation("latency", FaultKind::HighLatency, 4, 4);
        slow.recovery_ms = Some(60_000);
        assessment.record(slow);

        let report = assessment.report();

        assert_eq!(report.scenarios[0].score, 75);
        assert!(!report.scenarios[0].passed);
        assert_eq!(report.scenarios[2].score, 90);
        assert!(report.scenarios[2].passed);
        assert_eq!(report.recommendations.len(), 1);
        assert!(report.recommendations[0].starts_with("partition-a:"));
    }

    #[test]
    fn regression_identity_drift_zeroes_the_scenario() {
        let mut assessment = ResilienceAssessment::default();
        let mut drifted = observation("corruption", FaultKind::TokenCorruption, 3, 3);
        drifted.integrity_violations = 1;
        assessment.record(drifted);

        let report = assessment.report();

        assert_eq!(report.scenarios[0].score, 0);
        assert!(!report.scenarios[0].passed);
        assert!(report.recommendations[0].contains("identity changed"));
    }
}
