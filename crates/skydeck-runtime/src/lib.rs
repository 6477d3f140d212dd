//! Background scheduling for session upkeep.
//!
//! Runs periodic eviction, validation and health sweeps against a
//! `SessionManager`, adapting cadence to focus, network, battery and
//! resource-pressure signals from the host.

pub mod monitor_runtime;

pub use monitor_runtime::*;
