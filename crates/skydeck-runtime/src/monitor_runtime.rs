use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use skydeck_core::{current_unix_timestamp_ms, write_text_atomic};
use skydeck_session::{AgentPoolConfig, DiagnosticEvent, SessionManager};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MONITOR_SCHEMA_VERSION: u32 = 1;
const MONITOR_STATE_RUNNING: &str = "running";
const MONITOR_STATE_STOPPED: &str = "stopped";
const MONITOR_STATE_UNKNOWN: &str = "unknown";
const MONITOR_REASON_STARTED: &str = "monitor_started";
const MONITOR_REASON_SWEEP_OK: &str = "monitor_sweep_ok";
const MONITOR_REASON_TICK_SKIPPED: &str = "monitor_tick_skipped_sweep_in_flight";
const MONITOR_REASON_SIGNAL_DEFERRED: &str = "monitor_signal_deferred_sweep_in_flight";
const MONITOR_REASON_VALIDATION_SUSPENDED: &str = "monitor_validation_suspended_offline";
const MONITOR_REASON_HEALTH_SHED: &str = "monitor_health_checks_shed_under_pressure";
const MONITOR_REASON_REFRESH_FAILURES: &str = "monitor_refresh_failures";
const MONITOR_REASON_STOPPED: &str = "monitor_stopped";
const MONITOR_REASON_STATE_MISSING: &str = "monitor_state_missing";
const MAX_DIAGNOSTICS: usize = 32;

fn monitor_schema_version() -> u32 {
    MONITOR_SCHEMA_VERSION
}

fn default_monitor_run_state() -> String {
    MONITOR_STATE_UNKNOWN.to_string()
}

fn default_monitor_reason_code() -> String {
    MONITOR_REASON_STATE_MISSING.to_string()
}

#[derive(Debug, Clone, PartialEq)]
/// Cadence of the background monitor. Intervals are foreground values; the
/// multiplier stretches them while backgrounded or on low battery.
pub struct BackgroundMonitorConfig {
    pub tick_interval: Duration,
    pub validate_interval: Duration,
    pub cleanup_interval: Duration,
    pub health_check_interval: Duration,
    pub background_interval_multiplier: f64,
    pub state_path: Option<PathBuf>,
}

impl BackgroundMonitorConfig {
    pub fn from_pool_config(pool: &AgentPoolConfig) -> Self {
        Self {
            cleanup_interval: Duration::from_millis(pool.cleanup_interval_ms),
            health_check_interval: Duration::from_millis(pool.health_check_interval_ms),
            ..Self::default()
        }
    }

    fn tick_interval_ms(&self) -> u64 {
        u64::try_from(self.tick_interval.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for BackgroundMonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            validate_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(2 * 60),
            background_interval_multiplier: 4.0,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Host lifecycle signals delivered to a running monitor.
pub enum MonitorSignal {
    FocusGained,
    Backgrounded,
    NetworkOnline,
    NetworkOffline,
    BatteryLow,
    BatteryRestored,
    ResourcePressure,
    ResourcePressureCleared,
    SweepNow,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Persisted view of the monitor, refreshed after every sweep.
pub struct BackgroundMonitorSnapshot {
    #[serde(default = "monitor_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub updated_unix_ms: u64,
    #[serde(default = "default_monitor_run_state")]
    pub run_state: String,
    #[serde(default = "default_monitor_reason_code")]
    pub reason_code: String,
    #[serde(default)]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub tick_count: u64,
    #[serde(default)]
    pub skipped_ticks: u64,
    #[serde(default)]
    pub deferred_signal_sweeps: u64,
    #[serde(default)]
    pub sweep_count: u64,
    #[serde(default)]
    pub last_sweep_unix_ms: u64,
    #[serde(default)]
    pub validate_runs: u64,
    #[serde(default)]
    pub cleanup_runs: u64,
    #[serde(default)]
    pub health_runs: u64,
    #[serde(default)]
    pub health_checks_shed: u64,
    #[serde(default)]
    pub validations_suspended: u64,
    #[serde(default)]
    pub agents_evicted: u64,
    #[serde(default)]
    pub refresh_failures: u64,
    #[serde(default)]
    pub last_validated_accounts: usize,
    #[serde(default)]
    pub last_valid_accounts: usize,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub backgrounded: bool,
    #[serde(default)]
    pub battery_low: bool,
    #[serde(default)]
    pub under_pressure: bool,
    #[serde(default)]
    pub interval_multiplier: f64,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
    #[serde(default)]
    pub state_path: String,
}

impl Default for BackgroundMonitorSnapshot {
    fn default() -> Self {
        Self {
            schema_version: MONITOR_SCHEMA_VERSION,
            updated_unix_ms: current_unix_timestamp_ms(),
            run_state: MONITOR_STATE_UNKNOWN.to_string(),
            reason_code: MONITOR_REASON_STATE_MISSING.to_string(),
            tick_interval_ms: 0,
            tick_count: 0,
            skipped_ticks: 0,
            deferred_signal_sweeps: 0,
            sweep_count: 0,
            last_sweep_unix_ms: 0,
            validate_runs: 0,
            cleanup_runs: 0,
            health_runs: 0,
            health_checks_shed: 0,
            validations_suspended: 0,
            agents_evicted: 0,
            refresh_failures: 0,
            last_validated_accounts: 0,
            last_valid_accounts: 0,
            online: true,
            backgrounded: false,
            battery_low: false,
            under_pressure: false,
            interval_multiplier: 1.0,
            reason_codes: Vec::new(),
            diagnostics: Vec::new(),
            state_path: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct MonitorConditions {
    offline: bool,
    backgrounded: bool,
    battery_low: bool,
    under_pressure: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepTimers {
    last_validate: Option<Instant>,
    last_cleanup: Option<Instant>,
    last_health: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ForcedWork {
    validate: bool,
    cleanup: bool,
    health: bool,
}

impl ForcedWork {
    fn is_empty(&self) -> bool {
        !(self.validate || self.cleanup || self.health)
    }

    fn merge(self, other: ForcedWork) -> ForcedWork {
        ForcedWork {
            validate: self.validate || other.validate,
            cleanup: self.cleanup || other.cleanup,
            health: self.health || other.health,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SweepPlan {
    cleanup: bool,
    validate: bool,
    health: bool,
    validation_suspended: bool,
    health_shed: bool,
}

impl SweepPlan {
    fn has_work(&self) -> bool {
        self.cleanup || self.validate || self.health
    }
}

#[derive(Debug, Default)]
struct SweepReport {
    evicted: usize,
    deferred: usize,
    validated: usize,
    valid: usize,
    refresh_failures: usize,
    health_checked: usize,
}

fn interval_multiplier(config: &BackgroundMonitorConfig, conditions: &MonitorConditions) -> f64 {
    if conditions.backgrounded || conditions.battery_low {
        config.background_interval_multiplier.max(1.0)
    } else {
        1.0
    }
}

fn is_due(last: Option<Instant>, interval: Duration, multiplier: f64, now: Instant) -> bool {
    match last {
        Some(last) => now.saturating_duration_since(last) >= interval.mul_f64(multiplier),
        None => true,
    }
}

/// Picks the work for one sweep. Eviction and validation always win over
/// health checks; offline suspends validation and pressure sheds health.
fn plan_sweep(
    config: &BackgroundMonitorConfig,
    conditions: &MonitorConditions,
    timers: &SweepTimers,
    forced: ForcedWork,
    now: Instant,
) -> SweepPlan {
    let multiplier = interval_multiplier(config, conditions);
    let cleanup = forced.cleanup
        || is_due(timers.last_cleanup, config.cleanup_interval, multiplier, now);
    let validate_due = forced.validate
        || is_due(timers.last_validate, config.validate_interval, multiplier, now);
    let health_due = forced.health
        || is_due(timers.last_health, config.health_check_interval, multiplier, now);
    SweepPlan {
        cleanup,
        validate: validate_due && !conditions.offline,
        health: health_due && !conditions.offline && !conditions.under_pressure,
        validation_suspended: validate_due && conditions.offline,
        health_shed: health_due && !conditions.offline && conditions.under_pressure,
    }
}

struct MonitorState {
    snapshot: BackgroundMonitorSnapshot,
    conditions: MonitorConditions,
    timers: SweepTimers,
    /// Signal-forced work refused while a sweep was running; the next sweep
    /// takes it over.
    pending_forced: ForcedWork,
}

struct MonitorShared {
    config: BackgroundMonitorConfig,
    state: Mutex<MonitorState>,
    sweep_in_flight: AtomicBool,
}

impl MonitorShared {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn snapshot(&self) -> BackgroundMonitorSnapshot {
        self.lock_state().snapshot.clone()
    }

    fn persist(&self, snapshot: &BackgroundMonitorSnapshot) {
        let Some(state_path) = &self.config.state_path else {
            return;
        };
        if let Err(error) = persist_background_monitor_snapshot(state_path, snapshot) {
            tracing::warn!(
                path = %state_path.display(),
                error = %error,
                "background monitor snapshot persist failed"
            );
        }
    }
}

/// Clears the in-flight flag however the sweep ends.
struct SweepGuard {
    shared: Arc<MonitorShared>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.shared.sweep_in_flight.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug)]
/// Handle to a running monitor task.
pub struct BackgroundMonitorHandle {
    state_path: Option<PathBuf>,
    signal_tx: mpsc::UnboundedSender<MonitorSignal>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    shared: Arc<MonitorShared>,
}

impl std::fmt::Debug for MonitorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorShared")
            .field("config", &self.config)
            .field("sweep_in_flight", &self.sweep_in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl BackgroundMonitorHandle {
    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    /// Delivers a host signal. Returns false once the monitor has stopped.
    pub fn signal(&self, signal: MonitorSignal) -> bool {
        self.signal_tx.send(signal).is_ok()
    }

    pub fn snapshot(&self) -> BackgroundMonitorSnapshot {
        self.shared.snapshot()
    }

    /// Stops ticking, waits for a sweep in flight, then persists the final
    /// snapshot.
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

pub fn start_background_monitor(
    config: BackgroundMonitorConfig,
    manager: SessionManager,
) -> Result<BackgroundMonitorHandle> {
    if config.tick_interval.is_zero() {
        anyhow::bail!("background monitor tick interval must be greater than zero");
    }
    if !config.background_interval_multiplier.is_finite() || config.background_interval_multiplier < 1.0 {
        anyhow::bail!("background interval multiplier must be a finite value >= 1.0");
    }
    let runtime = tokio::runtime::Handle::try_current()
        .context("background monitor requires an active Tokio runtime")?;

    let snapshot = BackgroundMonitorSnapshot {
        run_state: MONITOR_STATE_RUNNING.to_string(),
        reason_code: MONITOR_REASON_STARTED.to_string(),
        tick_interval_ms: config.tick_interval_ms(),
        reason_codes: vec![MONITOR_REASON_STARTED.to_string()],
        diagnostics: vec![format!(
            "monitor_started: tick_interval_ms={} multiplier={}",
            config.tick_interval_ms(),
            config.background_interval_multiplier
        )],
        state_path: config
            .state_path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_default(),
        ..BackgroundMonitorSnapshot::default()
    };
    if let Some(state_path) = &config.state_path {
        persist_background_monitor_snapshot(state_path, &snapshot)?;
    }

    manager.events().emit(DiagnosticEvent::MonitoringStarted {
        tick_interval_ms: config.tick_interval_ms(),
    });
    tracing::info!(
        tick_interval_ms = config.tick_interval_ms(),
        "background monitor started"
    );

    let state_path = config.state_path.clone();
    let shared = Arc::new(MonitorShared {
        config,
        state: Mutex::new(MonitorState {
            snapshot,
            conditions: MonitorConditions::default(),
            timers: SweepTimers::default(),
            pending_forced: ForcedWork::default(),
        }),
        sweep_in_flight: AtomicBool::new(false),
    });
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let loop_shared = Arc::clone(&shared);
    let task = runtime.spawn(async move {
        run_background_monitor_loop(loop_shared, manager, signal_rx, shutdown_rx).await;
    });
    Ok(BackgroundMonitorHandle {
        state_path,
        signal_tx,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        shared,
    })
}

pub fn inspect_background_monitor(state_path: &Path) -> BackgroundMonitorSnapshot {
    let mut snapshot = BackgroundMonitorSnapshot {
        state_path: state_path.display().to_string(),
        ..BackgroundMonitorSnapshot::default()
    };
    if !state_path.exists() {
        snapshot
            .reason_codes
            .push(MONITOR_REASON_STATE_MISSING.to_string());
        snapshot
            .diagnostics
            .push(format!("state_missing: path={}", state_path.display()));
        return snapshot;
    }

    let raw = match std::fs::read_to_string(state_path) {
        Ok(raw) => raw,
        Err(error) => {
            snapshot.reason_code = "monitor_state_read_failed".to_string();
            snapshot
                .reason_codes
                .push("monitor_state_read_failed".to_string());
            snapshot.diagnostics.push(format!(
                "state_read_failed: path={} error={error}",
                state_path.display()
            ));
            return snapshot;
        }
    };

    match serde_json::from_str::<BackgroundMonitorSnapshot>(&raw) {
        Ok(mut parsed) => {
            parsed.state_path = state_path.display().to_string();
            parsed
        }
        Err(error) => {
            snapshot.reason_code = "monitor_state_parse_failed".to_string();
            snapshot
                .reason_codes
                .push("monitor_state_parse_failed".to_string());
            snapshot.diagnostics.push(format!(
                "state_parse_failed: path={} error={error}",
                state_path.display()
            ));
            snapshot
        }
    }
}

async fn run_background_monitor_loop(
    shared: Arc<MonitorShared>,
    manager: SessionManager,
    mut signal_rx: mpsc::UnboundedReceiver<MonitorSignal>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(shared.config.tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut current_sweep: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                shared.lock_state().snapshot.tick_count += 1;
                if let Some(sweep) = maybe_start_sweep(&shared, &manager, ForcedWork::default()) {
                    current_sweep = Some(sweep);
                }
            }
            Some(signal) = signal_rx.recv() => {
                let forced = apply_signal(&shared, &manager, signal);
                if !forced.is_empty() {
                    if let Some(sweep) = maybe_start_sweep(&shared, &manager, forced) {
                        current_sweep = Some(sweep);
                    }
                }
            }
            _ = &mut shutdown_rx => {
                if let Some(sweep) = current_sweep.take() {
                    let _ = sweep.await;
                }
                let snapshot = {
                    let mut state = shared.lock_state();
                    let snapshot = &mut state.snapshot;
                    snapshot.run_state = MONITOR_STATE_STOPPED.to_string();
                    snapshot.reason_code = MONITOR_REASON_STOPPED.to_string();
                    snapshot.updated_unix_ms = current_unix_timestamp_ms();
                    snapshot.reason_codes = vec![MONITOR_REASON_STOPPED.to_string()];
                    push_diagnostic(
                        &mut snapshot.diagnostics,
                        format!("monitor_stopped: ticks={}", snapshot.tick_count),
                    );
                    snapshot.clone()
                };
                shared.persist(&snapshot);
                manager.events().emit(DiagnosticEvent::MonitoringStopped {
                    ticks: snapshot.tick_count,
                });
                tracing::info!(ticks = snapshot.tick_count, "background monitor stopped");
                break;
            }
        }
    }
}

fn apply_signal(
    shared: &MonitorShared,
    manager: &SessionManager,
    signal: MonitorSignal,
) -> ForcedWork {
    let mut forced = ForcedWork::default();
    let mut network_change = None;
    {
        let mut state = shared.lock_state();
        let conditions = &mut state.conditions;
        match signal {
            MonitorSignal::FocusGained => {
                conditions.backgrounded = false;
                forced.validate = true;
            }
            MonitorSignal::Backgrounded => conditions.backgrounded = true,
            MonitorSignal::NetworkOnline => {
                if conditions.offline {
                    network_change = Some(true);
                }
                conditions.offline = false;
                forced.validate = true;
            }
            MonitorSignal::NetworkOffline => {
                if !conditions.offline {
                    network_change = Some(false);
                }
                conditions.offline = true;
            }
            MonitorSignal::BatteryLow => conditions.battery_low = true,
            MonitorSignal::BatteryRestored => conditions.battery_low = false,
            MonitorSignal::ResourcePressure => {
                conditions.under_pressure = true;
                forced.cleanup = true;
            }
            MonitorSignal::ResourcePressureCleared => conditions.under_pressure = false,
            MonitorSignal::SweepNow => {
                forced = ForcedWork {
                    validate: true,
                    cleanup: true,
                    health: true,
                };
            }
        }
        let conditions = state.conditions;
        let multiplier = interval_multiplier(&shared.config, &conditions);
        let snapshot = &mut state.snapshot;
        snapshot.online = !conditions.offline;
        snapshot.backgrounded = conditions.backgrounded;
        snapshot.battery_low = conditions.battery_low;
        snapshot.under_pressure = conditions.under_pressure;
        snapshot.interval_multiplier = multiplier;
    }
    tracing::debug!(?signal, "background monitor signal");
    if let Some(online) = network_change {
        manager
            .events()
            .emit(DiagnosticEvent::NetworkStatusChanged { online });
    }
    forced
}

fn maybe_start_sweep(
    shared: &Arc<MonitorShared>,
    manager: &SessionManager,
    forced: ForcedWork,
) -> Option<JoinHandle<()>> {
    if shared.sweep_in_flight.swap(true, Ordering::SeqCst) {
        let mut state = shared.lock_state();
        if forced.is_empty() {
            state.snapshot.skipped_ticks += 1;
            push_unique_reason_code(&mut state.snapshot.reason_codes, MONITOR_REASON_TICK_SKIPPED);
        } else {
            state.pending_forced = state.pending_forced.merge(forced);
            state.snapshot.deferred_signal_sweeps += 1;
            push_unique_reason_code(
                &mut state.snapshot.reason_codes,
                MONITOR_REASON_SIGNAL_DEFERRED,
            );
        }
        return None;
    }
    let guard = SweepGuard {
        shared: Arc::clone(shared),
    };

    let now = Instant::now();
    let plan = {
        let mut state = shared.lock_state();
        let forced = forced.merge(std::mem::take(&mut state.pending_forced));
        let plan = plan_sweep(&shared.config, &state.conditions, &state.timers, forced, now);
        if plan.cleanup {
            state.timers.last_cleanup = Some(now);
        }
        if plan.validate {
            state.timers.last_validate = Some(now);
        }
        if plan.health || plan.health_shed {
            state.timers.last_health = Some(now);
        }
        let snapshot = &mut state.snapshot;
        if plan.validation_suspended {
            snapshot.validations_suspended += 1;
        }
        if plan.health_shed {
            snapshot.health_checks_shed += 1;
        }
        plan
    };
    if !plan.has_work() {
        return None;
    }

    let shared = Arc::clone(shared);
    let manager = manager.clone();
    Some(tokio::spawn(async move {
        let _guard = guard;
        let report = execute_sweep(&manager, plan).await;
        let snapshot = record_sweep(&shared, plan, &report);
        shared.persist(&snapshot);
    }))
}

async fn execute_sweep(manager: &SessionManager, plan: SweepPlan) -> SweepReport {
    let mut report = SweepReport::default();
    if plan.cleanup {
        let eviction = manager.run_eviction_sweep();
        report.evicted = eviction.evicted.len();
        report.deferred = eviction.deferred.len();
    }
    if plan.validate {
        let results = manager.validate_all().await;
        report.validated = results.len();
        report.valid = results.iter().filter(|result| result.is_valid).count();
        report.refresh_failures = results
            .iter()
            .filter(|result| result.refreshed && result.error.is_some())
            .count();
    }
    if plan.health {
        report.health_checked = manager.run_health_checks().await.len();
    }
    report
}

fn record_sweep(
    shared: &MonitorShared,
    plan: SweepPlan,
    report: &SweepReport,
) -> BackgroundMonitorSnapshot {
    let mut state = shared.lock_state();
    let snapshot = &mut state.snapshot;
    let now = current_unix_timestamp_ms();
    snapshot.sweep_count += 1;
    snapshot.last_sweep_unix_ms = now;
    snapshot.updated_unix_ms = now;
    snapshot.reason_code = MONITOR_REASON_SWEEP_OK.to_string();
    let mut reason_codes = vec![MONITOR_REASON_SWEEP_OK.to_string()];
    if plan.cleanup {
        snapshot.cleanup_runs += 1;
        snapshot.agents_evicted += report.evicted as u64;
    }
    if plan.validate {
        snapshot.validate_runs += 1;
        snapshot.last_validated_accounts = report.validated;
        snapshot.last_valid_accounts = report.valid;
        snapshot.refresh_failures += report.refresh_failures as u64;
        if report.refresh_failures > 0 {
            push_unique_reason_code(&mut reason_codes, MONITOR_REASON_REFRESH_FAILURES);
        }
    }
    if plan.health {
        snapshot.health_runs += 1;
    }
    if plan.validation_suspended {
        push_unique_reason_code(&mut reason_codes, MONITOR_REASON_VALIDATION_SUSPENDED);
    }
    if plan.health_shed {
        push_unique_reason_code(&mut reason_codes, MONITOR_REASON_HEALTH_SHED);
    }
    snapshot.reason_codes = reason_codes;
    push_diagnostic(
        &mut snapshot.diagnostics,
        format!(
            "sweep: evicted={} deferred={} validated={} valid={} refresh_failures={} health_checked={}",
            report.evicted,
            report.deferred,
            report.validated,
            report.valid,
            report.refresh_failures,
            report.health_checked
        ),
    );
    tracing::debug!(
        evicted = report.evicted,
        validated = report.validated,
        valid = report.valid,
        health_checked = report.health_checked,
        "background sweep finished"
    );
    snapshot.clone()
}

fn persist_background_monitor_snapshot(
    state_path: &Path,
    snapshot: &BackgroundMonitorSnapshot,
) -> Result<()> {
    if let Some(parent) = state_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let payload = serde_json::to_string_pretty(snapshot)
        .context("failed to serialize background monitor snapshot")?;
    write_text_atomic(state_path, &payload)
}

fn push_unique_reason_code(reason_codes: &mut Vec<String>, reason_code: &str) {
    if reason_codes.iter().any(|existing| existing == reason_code) {
        return;
    }
    reason_codes.push(reason_code.to_string());
}

fn push_diagnostic(diagnostics: &mut Vec<String>, line: String) {
    diagnostics.push(line);
    if diagnostics.len() > MAX_DIAGNOSTICS {
        let overflow = diagnostics.len() - MAX_DIAGNOSTICS;
        diagnostics.drain(..overflow);
    }
}
