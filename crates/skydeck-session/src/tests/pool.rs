use std::sync::{Arc, Mutex};

use skydeck_core::{AccountId, ManualClock};
use skydeck_protocol::ProtocolError;
use skydeck_store::MemoryCredentialStore;

use crate::test_support::{network_down, record, ScriptedClient};
use crate::{
    AgentPool, AgentPoolConfig, DiagnosticEmitter, DiagnosticEvent, EvictionReason, HealthLevel,
    SessionError,
};

const START_MS: u64 = 1_700_000_000_000;

struct Fixture {
    clock: ManualClock,
    client: Arc<ScriptedClient>,
    pool: AgentPool,
    events: Arc<Mutex<Vec<DiagnosticEvent>>>,
}

fn fixture(config: AgentPoolConfig, dids: &[&str]) -> Fixture {
    let clock = ManualClock::new(START_MS);
    let client = ScriptedClient::new(clock.clone());
    let store = MemoryCredentialStore::with_records(dids.iter().map(|did| {
        let handle = format!("{}.test", did.trim_start_matches("did:plc:"));
        record(did, &handle, START_MS)
    }));
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let emitter = DiagnosticEmitter::new(Some(Arc::new(move |event: &DiagnosticEvent| {
        sink_events.lock().expect("events lock").push(event.clone());
    })));
    let pool = AgentPool::new(
        config,
        client.clone(),
        Arc::new(store),
        clock.clock_fn(),
        emitter,
    );
    Fixture {
        clock,
        client,
        pool,
        events,
    }
}

fn account(did: &str) -> AccountId {
    AccountId::new(did)
}

#[tokio::test(start_paused = true)]
async fn functional_concurrent_get_or_create_shares_one_handshake() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    fx.client
        .latency_ms
        .store(200, std::sync::atomic::Ordering::SeqCst);
    let id = account("did:plc:alice");

    let results =
        futures_util::future::join_all((0..6).map(|_| fx.pool.get_or_create(&id))).await;

    let agents = results
        .into_iter()
        .map(|result| result.expect("agent"))
        .collect::<Vec<_>>();
    assert!(agents.iter().all(|agent| Arc::ptr_eq(agent, &agents[0])));
    assert_eq!(
        fx.client
            .get_session_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
    assert_eq!(fx.pool.len(), 1);
    assert_eq!(agents[0].access_count(), 6);
}

#[tokio::test]
async fn functional_failed_creation_leaves_no_pool_slot() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    fx.client.fail_get_session("did:plc:alice", network_down());

    let error = fx
        .pool
        .get_or_create(&account("did:plc:alice"))
        .await
        .expect_err("unreachable service");

    assert!(matches!(
        error,
        SessionError::AgentCreationFailed {
            retryable: true,
            ..
        }
    ));
    assert!(fx.pool.is_empty());
}

#[tokio::test]
async fn functional_rejected_access_token_still_creates_agent_with_invalid_session() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    fx.client.fail_get_session(
        "did:plc:alice",
        ProtocolError::TokenRejected {
            reason: "ExpiredToken".to_string(),
        },
    );

    let agent = fx
        .pool
        .get_or_create(&account("did:plc:alice"))
        .await
        .expect("agent");

    assert!(!agent.health_status().session_valid);
    assert_eq!(fx.pool.len(), 1);
}

#[tokio::test]
async fn unit_unknown_account_is_not_found() {
    let fx = fixture(AgentPoolConfig::default(), &[]);
    let error = fx
        .pool
        .get_or_create(&account("did:plc:ghost"))
        .await
        .expect_err("no record");
    assert_eq!(error, SessionError::AccountNotFound(account("did:plc:ghost")));
}

#[tokio::test]
async fn functional_sweep_evicts_inactive_agents_first() {
    let config = AgentPoolConfig {
        inactive_timeout_ms: 60_000,
        ..AgentPoolConfig::default()
    };
    let fx = fixture(config, &["did:plc:alice", "did:plc:bob"]);
    fx.pool
        .get_or_create(&account("did:plc:alice"))
        .await
        .expect("alice");
    fx.clock.advance_ms(50_000);
    fx.pool
        .get_or_create(&account("did:plc:bob"))
        .await
        .expect("bob");
    fx.clock.advance_ms(20_000);

    let report = fx.pool.run_eviction_sweep(|_| false);

    assert_eq!(
        report.evicted,
        vec![(account("did:plc:alice"), EvictionReason::Inactive)]
    );
    assert_eq!(fx.pool.account_ids(), vec![account("did:plc:bob")]);
    let recorded = fx.events.lock().expect("events lock");
    assert!(recorded.iter().any(|event| matches!(
        event,
        DiagnosticEvent::AgentEvicted { reason: EvictionReason::Inactive, .. }
    )));
}

#[tokio::test]
async fn integration_capacity_sweep_keeps_most_recently_used_agents() {
    let dids = (0..8)
        .map(|index| format!("did:plc:user{index}"))
        .collect::<Vec<_>>();
    let did_refs = dids.iter().map(String::as_str).collect::<Vec<_>>();
    let config = AgentPoolConfig {
        max_agents: 5,
        recent_use_grace_ms: 1_000,
        ..AgentPoolConfig::default()
    };
    let fx = fixture(config, &did_refs);
    for did in &dids {
        fx.pool.get_or_create(&account(did)).await.expect("agent");
        fx.clock.advance_ms(10_000);
    }
    // user0 is touched right before the sweep and must survive it.
    fx.pool.touch(&account("did:plc:user0"));

    let report = fx.pool.run_eviction_sweep(|_| false);

    let evicted = report
        .evicted
        .iter()
        .map(|(id, reason)| {
            assert_eq!(*reason, EvictionReason::Capacity);
            id.as_str().to_string()
        })
        .collect::<Vec<_>>();
    assert_eq!(
        evicted,
        vec!["did:plc:user1", "did:plc:user2", "did:plc:user3"]
    );
    assert_eq!(report.remaining, 5);
    assert!(fx.pool.get(&account("did:plc:user0")).is_some());
}

#[tokio::test]
async fn functional_sweep_defers_pinned_agents() {
    let config = AgentPoolConfig {
        max_agents: 0,
        inactive_timeout_ms: 0,
        recent_use_grace_ms: 0,
        ..AgentPoolConfig::default()
    };
    let fx = fixture(config, &["did:plc:alice", "did:plc:bob"]);
    fx.pool
        .get_or_create(&account("did:plc:alice"))
        .await
        .expect("alice");
    fx.pool
        .get_or_create(&account("did:plc:bob"))
        .await
        .expect("bob");
    fx.clock.advance_ms(1_000);

    let pinned = account("did:plc:alice");
    let report = fx.pool.run_eviction_sweep(|id| *id == pinned);

    assert_eq!(report.deferred, vec![account("did:plc:alice")]);
    assert_eq!(
        report.evicted,
        vec![(account("did:plc:bob"), EvictionReason::Inactive)]
    );
    assert_eq!(fx.pool.account_ids(), vec![account("did:plc:alice")]);
}

#[tokio::test]
async fn functional_memory_pressure_evicts_least_healthy_first() {
    let config = AgentPoolConfig {
        memory_threshold_mb: 20.0,
        recent_use_grace_ms: 0,
        ..AgentPoolConfig::default()
    };
    let fx = fixture(config, &["did:plc:alice", "did:plc:bob", "did:plc:carol"]);
    for did in ["did:plc:alice", "did:plc:bob", "did:plc:carol"] {
        fx.pool.get_or_create(&account(did)).await.expect("agent");
    }
    *fx.client.describe_failure.lock().expect("failure lock") = Some(network_down());
    fx.pool.health_check(&account("did:plc:carol")).await;
    fx.clock.advance_ms(1_000);

    let report = fx.pool.run_eviction_sweep(|_| false);

    assert_eq!(
        report.evicted,
        vec![(account("did:plc:carol"), EvictionReason::MemoryPressure)]
    );
    assert!(report.memory_mb <= 20.0);
}

#[tokio::test]
async fn functional_health_check_never_fails_and_reports_offline() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    let id = account("did:plc:alice");

    let healthy = fx.pool.health_check(&id).await;
    assert_eq!(healthy.level, HealthLevel::Online);
    assert_eq!(healthy.score, 100);

    *fx.client.describe_failure.lock().expect("failure lock") = Some(network_down());
    let offline = fx.pool.health_check(&id).await;
    assert_eq!(offline.level, HealthLevel::Offline);
    assert!(offline.error_rate > 0.0);
    assert_eq!(fx.pool.agent_health(&id), Some(offline));

    let unknown = fx.pool.health_check(&account("did:plc:ghost")).await;
    assert_eq!(unknown.level, HealthLevel::Offline);

    let recorded = fx.events.lock().expect("events lock");
    assert!(recorded
        .iter()
        .any(|event| matches!(event, DiagnosticEvent::HealthCheckCompleted { .. })));
    assert_eq!(
        recorded
            .iter()
            .filter(|event| matches!(event, DiagnosticEvent::HealthCheckFailed { .. }))
            .count(),
        2
    );
}

#[tokio::test]
async fn regression_evicted_agent_rejects_new_operations_but_stays_readable() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    let id = account("did:plc:alice");
    let agent = fx.pool.get_or_create(&id).await.expect("agent");

    assert!(fx.pool.evict(&id, EvictionReason::Capacity));
    assert!(!fx.pool.evict(&id, EvictionReason::Capacity));

    assert!(agent.is_disposed());
    assert_eq!(agent.account_id(), &id);
    let error = agent
        .refresh_session("unused")
        .await
        .expect_err("disposed agent");
    assert_eq!(error, SessionError::AgentDisposed(id));
}

#[tokio::test]
async fn unit_memory_estimate_prefers_measured_value() {
    let fx = fixture(AgentPoolConfig::default(), &["did:plc:alice"]);
    assert_eq!(fx.pool.aggregate_memory_mb(), 0.0);
    let agent = fx
        .pool
        .get_or_create(&account("did:plc:alice"))
        .await
        .expect("agent");
    assert!((agent.memory_estimate_mb() - 8.01).abs() < 1e-9);

    agent.record_memory_estimate_mb(40.0);
    assert_eq!(fx.pool.aggregate_memory_mb(), 40.0);
    agent.record_memory_estimate_mb(f64::NAN);
    assert!((fx.pool.aggregate_memory_mb() - 8.01).abs() < 1e-9);
}
