//! Fault injection and resilience scoring for the session stack.
//!
//! Provides an in-memory identity service, wrappers that inject network and
//! storage faults, and an assessment that scores recovery after each fault.

mod assessment;
mod faults;
mod simulator;

pub use assessment::{
    capture_baseline, measure_recovery, FaultKind, RecoveryMeasurement, ResilienceAssessment,
    ResilienceReport, ScenarioObservation, ScenarioScore, SessionBaseline,
};
pub use faults::{
    skewed_clock, FaultInjectingClient, FaultPlan, FaultStats, FaultyCredentialStore,
};
pub use simulator::{
    simulation_clock, SimulatedIdentityService, SimulatorCallCounts, SIMULATED_SERVICE_URL,
};
