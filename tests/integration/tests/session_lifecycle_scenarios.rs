use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use skydeck_core::{AccountId, ClockFn};
use skydeck_resilience::{
    capture_baseline, measure_recovery, simulation_clock, FaultInjectingClient, FaultKind,
    ResilienceAssessment, ScenarioObservation, SimulatedIdentityService,
};
use skydeck_runtime::{start_background_monitor, BackgroundMonitorConfig};
use skydeck_session::{
    AgentPool, AgentPoolConfig, DiagnosticEmitter, DiagnosticEvent, EvictionReason, SessionError,
    SessionManager, SessionManagerConfig, SessionPhase,
};
use skydeck_store::{CredentialStore, MemoryCredentialStore};

const START_MS: u64 = 1_700_000_000_000;

struct Harness {
    clock: ClockFn,
    service: Arc<SimulatedIdentityService>,
    faults: Arc<FaultInjectingClient>,
    store: Arc<MemoryCredentialStore>,
    manager: SessionManager,
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
    accounts: Vec<AccountId>,
}

impl Harness {
    fn new(
        handles: &[&str],
        access_lifetime: Duration,
        pool_config: AgentPoolConfig,
        manager_config: SessionManagerConfig,
    ) -> Self {
        let clock = simulation_clock(START_MS);
        let service = Arc::new(
            SimulatedIdentityService::new(clock.clone()).with_access_lifetime(access_lifetime),
        );
        let records = handles
            .iter()
            .map(|handle| service.register_account(handle, "app-password"))
            .collect::<Vec<_>>();
        let accounts = records
            .iter()
            .map(|record| record.account_id.clone())
            .collect();
        let store = Arc::new(MemoryCredentialStore::with_records(records));
        let faults = Arc::new(FaultInjectingClient::new(service.clone()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        let emitter = DiagnosticEmitter::new(Some(Arc::new(move |event: &DiagnosticEvent| {
            sink_events
                .lock()
                .expect("events lock")
                .push(event.clone());
        })));
        let pool = Arc::new(AgentPool::new(
            pool_config,
            faults.clone(),
            store.clone(),
            clock.clone(),
            emitter,
        ));
        Self {
            clock,
            service,
            faults,
            store,
            manager: SessionManager::new(manager_config, pool),
            events,
            accounts,
        }
    }

    fn with_defaults(handles: &[&str], access_lifetime: Duration) -> Self {
        Self::new(
            handles,
            access_lifetime,
            AgentPoolConfig::default(),
            SessionManagerConfig::default(),
        )
    }

    fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    fn event_count(&self, matches: impl Fn(&DiagnosticEvent) -> bool) -> usize {
        self.events
            .lock()
            .expect("events lock")
            .iter()
            .filter(|event| matches(event))
            .count()
    }
}

fn short_lived() -> Duration {
    // Shorter than the default five minute safety margin, so every
    // validation pass refreshes.
    Duration::from_secs(4 * 60)
}

#[tokio::test(start_paused = true)]
async fn integration_concurrent_refreshes_share_one_network_call() {
    let harness = Harness::with_defaults(&["alice.test"], short_lived());
    let account = harness.accounts[0].clone();
    let before = harness
        .store
        .get(&account)
        .await
        .expect("store read")
        .expect("record");
    harness.service.set_latency(Duration::from_millis(300));

    let refreshes = (0..16).map(|_| harness.manager.proactive_refresh(&account));
    let outcomes = futures_util::future::join_all(refreshes).await;

    assert!(outcomes.iter().all(|outcome| outcome.succeeded()));
    assert_eq!(harness.service.call_counts().refresh_session, 1);
    assert_eq!(harness.manager.refresh_executions(), 1);
    let after = harness
        .store
        .get(&account)
        .await
        .expect("store read")
        .expect("record");
    assert_ne!(after.session.refresh_jwt, before.session.refresh_jwt);
    assert_eq!(after.identity.did, before.identity.did);
}

#[tokio::test(start_paused = true)]
async fn integration_refresh_round_trip_persists_rotated_tokens() {
    let harness = Harness::with_defaults(&["alice.test"], short_lived());
    let account = harness.accounts[0].clone();
    let before = harness
        .store
        .get(&account)
        .await
        .expect("store read")
        .expect("record");

    let outcome = harness.manager.proactive_refresh(&account).await;
    assert!(outcome.succeeded());
    let state = harness
        .manager
        .get_session_state(&account)
        .expect("state");
    assert_eq!(state.phase, SessionPhase::Valid);
    assert_eq!(state.refresh_failure_count, 0);
    assert!(state
        .next_refresh_due_at_ms
        .is_some_and(|due| due > harness.now_ms()));

    let after = harness
        .store
        .get(&account)
        .await
        .expect("store read")
        .expect("record");
    assert_ne!(after.session.access_jwt, before.session.access_jwt);
    assert_ne!(after.session.refresh_jwt, before.session.refresh_jwt);
    assert_eq!(after.identity.handle, "alice.test");

    // The rotated refresh token must be the one used next time.
    let second = harness.manager.proactive_refresh(&account).await;
    assert!(second.succeeded(), "{:?}", second.error);
    assert_eq!(harness.service.call_counts().refresh_session, 2);
}

#[tokio::test(start_paused = true)]
async fn integration_validate_all_isolates_a_revoked_account() {
    let harness = Harness::with_defaults(&["alice.test", "bob.test", "carol.test"], short_lived());
    let bob = AccountId::new("did:plc:bob-test");
    assert!(harness.service.revoke_sessions(bob.as_str()));

    let results = harness.manager.validate_all().await;
    assert_eq!(results.len(), 3);
    for result in &results {
        if result.account_id == bob {
            assert!(!result.is_valid);
            assert!(matches!(
                result.error,
                Some(SessionError::TokenCorrupted { .. })
            ));
        } else {
            assert!(result.is_valid, "{:?}", result.error);
            assert!(result.refreshed);
        }
    }
    let bob_state = harness.manager.get_session_state(&bob).expect("bob state");
    assert!(bob_state.reauth_required);
    assert_eq!(bob_state.next_refresh_due_at_ms, None);
}

#[tokio::test(start_paused = true)]
async fn integration_reauthentication_is_requested_once_and_recovery_is_reported() {
    let harness = Harness::with_defaults(&["alice.test"], short_lived());
    let account = harness.accounts[0].clone();
    harness.faults.set_partitioned(true);

    for _ in 0..6 {
        harness.manager.validate_all().await;
        tokio::time::sleep(Duration::from_secs(6)).await;
    }
    let state = harness
        .manager
        .get_session_state(&account)
        .expect("state");
    assert_eq!(state.phase, SessionPhase::Invalid);
    assert!(state.refresh_failure_count >= 3);
    assert_eq!(
        harness.event_count(|event| matches!(
            event,
            DiagnosticEvent::ReauthenticationRequired { .. }
        )),
        1
    );

    harness.faults.set_partitioned(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    harness.manager.validate_all().await;
    let state = harness
        .manager
        .get_session_state(&account)
        .expect("state");
    assert_eq!(state.phase, SessionPhase::Valid);
    assert!(!state.reauth_required);
    assert_eq!(
        harness.event_count(|event| matches!(event, DiagnosticEvent::SessionRecovered { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn integration_eviction_defers_agent_pinned_by_refresh() {
    let harness = Harness::new(
        &["alice.test"],
        short_lived(),
        AgentPoolConfig {
            inactive_timeout_ms: 1_000,
            recent_use_grace_ms: 0,
            ..AgentPoolConfig::default()
        },
        SessionManagerConfig::default(),
    );
    let account = harness.accounts[0].clone();
    harness
        .manager
        .pool()
        .get_or_create(&account)
        .await
        .expect("agent");
    harness.service.set_latency(Duration::from_secs(4));

    let manager = harness.manager.clone();
    let refresh_account = account.clone();
    let refresh = tokio::spawn(async move { manager.proactive_refresh(&refresh_account).await });
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(harness.manager.is_refresh_in_progress(&account));

    let report = harness.manager.run_eviction_sweep();
    assert!(report.evicted.is_empty());
    assert_eq!(report.deferred, vec![account.clone()]);
    assert!(harness.manager.pool().get(&account).is_some());

    let outcome = refresh.await.expect("refresh task");
    assert!(outcome.succeeded(), "{:?}", outcome.error);
}

#[tokio::test(start_paused = true)]
async fn integration_capacity_eviction_keeps_most_recent_five_of_eight() {
    let handles = [
        "user1.test",
        "user2.test",
        "user3.test",
        "user4.test",
        "user5.test",
        "user6.test",
        "user7.test",
        "user8.test",
    ];
    let harness = Harness::new(
        &handles,
        Duration::from_secs(2 * 60 * 60),
        AgentPoolConfig {
            max_agents: 5,
            recent_use_grace_ms: 0,
            ..AgentPoolConfig::default()
        },
        SessionManagerConfig::default(),
    );
    for account in &harness.accounts {
        harness
            .manager
            .pool()
            .get_or_create(account)
            .await
            .expect("agent");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(harness.manager.pool().len(), 8);

    let report = harness.manager.run_eviction_sweep();
    assert_eq!(harness.manager.pool().len(), 5);
    let evicted = report
        .evicted
        .iter()
        .map(|(account_id, reason)| {
            assert_eq!(*reason, EvictionReason::Capacity);
            account_id.as_str().to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(
        evicted,
        vec!["did:plc:user1-test", "did:plc:user2-test", "did:plc:user3-test"]
    );
    assert_eq!(
        harness.event_count(|event| matches!(event, DiagnosticEvent::AgentEvicted { .. })),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn integration_monitor_recovers_sessions_after_network_partition() {
    let harness = Harness::with_defaults(
        &["alice.test", "bob.test", "carol.test", "dave.test", "erin.test"],
        Duration::from_secs(6 * 60),
    );
    let mut monitor = start_background_monitor(
        BackgroundMonitorConfig {
            tick_interval: Duration::from_millis(250),
            validate_interval: Duration::from_secs(1),
            ..BackgroundMonitorConfig::default()
        },
        harness.manager.clone(),
    )
    .expect("start monitor");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let baseline = capture_baseline(&harness.manager).await.expect("baseline");
    assert_eq!(baseline.valid_accounts.len(), 5);

    // Sessions become due one minute in; the partition covers that window.
    tokio::time::sleep(Duration::from_secs(57)).await;
    harness.faults.set_partitioned(true);
    tokio::time::sleep(Duration::from_secs(8)).await;
    harness.faults.set_partitioned(false);
    let healed_at = harness.now_ms();
    assert!(harness.faults.stats().partitioned > 0);

    let budget_ms = 30_000;
    let mut recovery_ms = None;
    let mut measurement = measure_recovery(&harness.manager, &baseline)
        .await
        .expect("measure");
    while harness.now_ms() - healed_at < budget_ms {
        tokio::time::sleep(Duration::from_millis(500)).await;
        measurement = measure_recovery(&harness.manager, &baseline)
            .await
            .expect("measure");
        if measurement.recovered == measurement.expected {
            recovery_ms = Some(harness.now_ms() - healed_at);
            break;
        }
    }
    monitor.shutdown().await;

    assert!(measurement.recovery_ratio() >= 0.8);
    assert!(measurement.integrity_violations.is_empty());

    // Every account must still take a real refresh once the network is back.
    let refresh_calls_before = harness.service.call_counts().refresh_session;
    let mut critical_attempted = 0;
    let mut critical_succeeded = 0;
    for account in &harness.accounts {
        critical_attempted += 1;
        if harness.manager.proactive_refresh(account).await.succeeded() {
            critical_succeeded += 1;
        }
    }
    assert_eq!(
        harness.service.call_counts().refresh_session - refresh_calls_before,
        critical_attempted as u64
    );
    assert_eq!(critical_succeeded, critical_attempted);

    for account in &harness.accounts {
        let record = harness
            .store
            .get(account)
            .await
            .expect("store read")
            .expect("record");
        assert_eq!(record.identity.did, account.as_str());
    }

    let mut assessment = ResilienceAssessment::default();
    assessment.record(ScenarioObservation {
        name: "partition_8s".to_string(),
        fault: FaultKind::NetworkPartition,
        sessions_valid_before: measurement.expected,
        sessions_valid_after: measurement.recovered,
        recovery_ms,
        integrity_violations: measurement.integrity_violations.len(),
        critical_attempted,
        critical_succeeded,
    });
    let report = assessment.report();
    assert!(report.scenarios[0].passed, "{report:?}");
    assert!(report.scenarios[0].score >= 70, "{report:?}");
    let rendered = serde_json::to_value(&report).expect("serialize report");
    assert_eq!(rendered["scenarios"][0]["fault"], "network_partition");
}
