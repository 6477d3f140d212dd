use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use skydeck_core::{system_clock, AccountId};
use skydeck_protocol::{XrpcClient, XrpcClientConfig};
use skydeck_runtime::{start_background_monitor, BackgroundMonitorConfig, BackgroundMonitorSnapshot};
use skydeck_session::{
    AgentPool, AgentPoolConfig, DiagnosticEmitter, DiagnosticEvent, SessionManager,
    SessionManagerConfig, SessionStatus, ValidationResult,
};
use skydeck_store::FileCredentialStore;

use crate::cli_args::{Cli, CliCommand, MonitorArgs, SignInArgs};

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let manager = build_session_manager(&cli)?;
    match &cli.command {
        CliCommand::Validate => {
            let results = manager.validate_all().await;
            println!("{}", render_validation_results(&results, cli.json));
        }
        CliCommand::Accounts => {
            let statuses = manager
                .session_statuses()
                .await
                .context("failed to list accounts")?;
            println!("{}", render_session_statuses(&statuses, cli.json)?);
        }
        CliCommand::SignIn(args) => run_sign_in(&manager, args, cli.json).await?,
        CliCommand::SignOut(args) => {
            let account_id = AccountId::new(args.account.trim());
            manager
                .remove_account(&account_id)
                .await
                .with_context(|| format!("failed to remove account {account_id}"))?;
            println!("removed {account_id}");
        }
        CliCommand::Deactivate(args) => {
            let account_id = AccountId::new(args.account.trim());
            manager
                .deactivate_account(&account_id)
                .await
                .with_context(|| format!("failed to deactivate account {account_id}"))?;
            println!("deactivated {account_id}");
        }
        CliCommand::Monitor(args) => {
            let snapshot = run_monitor(manager, args).await?;
            println!("{}", render_monitor_summary(&snapshot, cli.json)?);
        }
    }
    Ok(())
}

fn build_session_manager(cli: &Cli) -> Result<SessionManager> {
    let client = XrpcClient::new(XrpcClientConfig {
        request_timeout_ms: cli.request_timeout_ms,
        ..XrpcClientConfig::default()
    })
    .context("failed to build XRPC client")?;
    let store = FileCredentialStore::new(
        cli.store_path.clone(),
        cli.store_encryption.into(),
        cli.store_key.clone(),
    );
    let pool_config = AgentPoolConfig {
        max_agents: cli.max_agents,
        operation_timeout_ms: cli.request_timeout_ms,
        ..AgentPoolConfig::default()
    };
    let manager_config = SessionManagerConfig {
        refresh_failure_threshold: cli.reauth_threshold.max(1),
        operation_timeout_ms: cli.request_timeout_ms,
        ..SessionManagerConfig::default()
    };
    let events = DiagnosticEmitter::new(Some(Arc::new(|event: &DiagnosticEvent| {
        if let DiagnosticEvent::ReauthenticationRequired { account_id, .. } = event {
            eprintln!("account {account_id} needs to sign in again");
        }
    })));
    let pool = AgentPool::new(
        pool_config,
        Arc::new(client),
        Arc::new(store),
        system_clock(),
        events,
    );
    Ok(SessionManager::new(manager_config, Arc::new(pool)))
}

async fn run_sign_in(manager: &SessionManager, args: &SignInArgs, json_output: bool) -> Result<()> {
    let state = manager
        .sign_in(&args.identifier, &args.password, args.service.as_deref())
        .await
        .with_context(|| format!("sign-in failed for {}", args.identifier))?;
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&state).context("failed to render session state")?
        );
    } else {
        println!("signed in {} (phase={:?})", state.account_id, state.phase);
    }
    Ok(())
}

async fn run_monitor(manager: SessionManager, args: &MonitorArgs) -> Result<BackgroundMonitorSnapshot> {
    let config = BackgroundMonitorConfig {
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        validate_interval: Duration::from_millis(args.validate_interval_ms),
        state_path: args.state_path.clone(),
        ..BackgroundMonitorConfig::from_pool_config(manager.pool().config())
    };
    let mut handle = start_background_monitor(config, manager)?;
    match args.duration_ms {
        Some(duration_ms) => tokio::time::sleep(Duration::from_millis(duration_ms)).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
        }
    }
    handle.shutdown().await;
    Ok(handle.snapshot())
}

pub(crate) fn render_validation_results(results: &[ValidationResult], json_output: bool) -> String {
    if json_output {
        let rows = results
            .iter()
            .map(|result| {
                json!({
                    "account_id": result.account_id.as_str(),
                    "handle": result.handle,
                    "is_valid": result.is_valid,
                    "refreshed": result.refreshed,
                    "phase": result.phase,
                    "error": result.error.as_ref().map(ToString::to_string),
                })
            })
            .collect::<Vec<_>>();
        return serde_json::Value::Array(rows).to_string();
    }
    if results.is_empty() {
        return "no accounts".to_string();
    }
    let valid = results.iter().filter(|result| result.is_valid).count();
    let mut lines = vec![format!("validated={} valid={valid}", results.len())];
    for result in results {
        let mut line = format!(
            "{} handle={} valid={} refreshed={}",
            result.account_id,
            result.handle.as_deref().unwrap_or("-"),
            result.is_valid,
            result.refreshed
        );
        if let Some(error) = &result.error {
            line.push_str(&format!(" error={error}"));
        }
        lines.push(line);
    }
    lines.join("\n")
}

pub(crate) fn render_session_statuses(statuses: &[SessionStatus], json_output: bool) -> Result<String> {
    if json_output {
        return serde_json::to_string_pretty(statuses).context("failed to render account statuses");
    }
    if statuses.is_empty() {
        return Ok("no accounts".to_string());
    }
    Ok(statuses
        .iter()
        .map(|status| {
            format!(
                "{}{} {} connected={} health={:?}",
                if status.is_active { "* " } else { "  " },
                status.handle,
                status.account_id,
                status.is_connected,
                status.health
            )
        })
        .collect::<Vec<_>>()
        .join("\n"))
}

fn render_monitor_summary(snapshot: &BackgroundMonitorSnapshot, json_output: bool) -> Result<String> {
    if json_output {
        return serde_json::to_string_pretty(snapshot).context("failed to render monitor snapshot");
    }
    Ok(format!(
        "monitor {}: ticks={} sweeps={} validations={} evicted={} refresh_failures={}",
        snapshot.run_state,
        snapshot.tick_count,
        snapshot.sweep_count,
        snapshot.validate_runs,
        snapshot.agents_evicted,
        snapshot.refresh_failures
    ))
}

#[cfg(test)]
mod tests {
    use skydeck_core::AccountId;
    use skydeck_session::{SessionError, SessionHealth, SessionPhase, SessionStatus, ValidationResult};

    use super::{render_session_statuses, render_validation_results};

    fn result(did: &str, is_valid: bool, error: Option<SessionError>) -> ValidationResult {
        ValidationResult {
            account_id: AccountId::new(did),
            handle: Some(format!("{}.test", did.trim_start_matches("did:plc:"))),
            is_valid,
            refreshed: error.is_some(),
            phase: if is_valid {
                SessionPhase::Valid
            } else {
                SessionPhase::Invalid
            },
            error,
        }
    }

    #[test]
    fn unit_render_validation_results_summarizes_and_lists_errors() {
        let rendered = render_validation_results(
            &[
                result("did:plc:alice", true, None),
                result(
                    "did:plc:bob",
                    false,
                    Some(SessionError::NetworkError("timeout".to_string())),
                ),
            ],
            false,
        );
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("validated=2 valid=1"));
        assert!(rendered.contains("did:plc:bob handle=bob.test valid=false refreshed=true error="));
    }

    #[test]
    fn unit_render_validation_results_json_is_an_array() {
        let rendered = render_validation_results(&[result("did:plc:alice", true, None)], true);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("json");
        assert_eq!(parsed[0]["account_id"], "did:plc:alice");
        assert_eq!(parsed[0]["phase"], "valid");
        assert!(parsed[0]["error"].is_null());
    }

    #[test]
    fn unit_render_session_statuses_marks_active_account() {
        let rendered = render_session_statuses(
            &[SessionStatus {
                account_id: AccountId::new("did:plc:alice"),
                handle: "alice.test".to_string(),
                is_active: true,
                is_connected: false,
                last_activity_ms: None,
                health: SessionHealth::Disconnected,
            }],
            false,
        )
        .expect("render");
        assert_eq!(
            rendered,
            "* alice.test did:plc:alice connected=false health=Disconnected"
        );
        assert_eq!(
            render_session_statuses(&[], false).expect("render"),
            "no accounts"
        );
    }
}
