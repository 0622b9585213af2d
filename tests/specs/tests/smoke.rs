// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end protocol tests: a real agent transport against an
//! in-process panel server.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use xboard_agent::agent::{build, report_tick, run_with_shutdown, sync_tick};
use xboard_agent::transport::{proto as agent_proto, PanelTransport};
use xboard_panel::service::proto as panel_proto;
use xboard_panel::stat::job::flush;
use xboard_panel::stat::repo::{FileStatRepository, StatRow};
use xboard_panel::stat::Granularity;
use xboard_specs::{TestPanel, TOKEN};

const NODE: i64 = 7;
const SINGBOX_DOC: &str = r#"{"inbounds": [{"type": "vless", "listen": "::", "listen_port": 443, "users": []}]}"#;

#[tokio::test]
async fn wrong_token_is_unauthenticated_and_not_retried() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    let config = panel.agent_config(NODE, staging.path(), "wrong-token")?;

    let transport = PanelTransport::connect(&config, CancellationToken::new())?;
    let started = tokio::time::Instant::now();
    let err = transport.get_config("").await.err();
    assert_eq!(err.map(|e| e.code()), Some(tonic::Code::Unauthenticated));
    // Permanent errors skip the backoff schedule entirely.
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

#[tokio::test]
async fn heartbeat_and_status_round_trip() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    let config = panel.agent_config(NODE, staging.path(), TOKEN)?;

    let transport = PanelTransport::connect(&config, CancellationToken::new())?;
    transport.heartbeat(Utc::now().timestamp()).await.map_err(anyhow::Error::from)?;

    let state = build(config, CancellationToken::new()).await?;
    report_tick(&state).await;
    let seen = panel.state.last_status(NODE).await;
    assert!(seen.is_some(), "panel should hold the reported status");
    let report = seen.ok_or_else(|| anyhow::anyhow!("missing report"))?;
    assert!(report.system.map(|s| s.mem_total_bytes > 0).unwrap_or(false));
    Ok(())
}

#[tokio::test]
async fn config_sync_applies_exactly_once_per_etag() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    panel.state.set_node_config(NODE, SINGBOX_DOC.to_owned()).await;

    let config = panel.agent_config(NODE, staging.path(), TOKEN)?;
    let state = build(config, CancellationToken::new()).await?;

    // First tick stages the document.
    sync_tick(&state).await;
    let staged = staging.path().join("sing-box.json");
    assert_eq!(std::fs::read_to_string(&staged)?, SINGBOX_DOC);

    // Unchanged server state: the second tick must not re-apply. The
    // sentinel we plant locally survives to prove it.
    std::fs::write(&staged, "sentinel")?;
    sync_tick(&state).await;
    assert_eq!(std::fs::read_to_string(&staged)?, "sentinel");

    // A real change on the panel re-applies.
    let updated = SINGBOX_DOC.replace("443", "8443");
    panel.state.set_node_config(NODE, updated.clone()).await;
    sync_tick(&state).await;
    assert_eq!(std::fs::read_to_string(&staged)?, updated);
    Ok(())
}

#[tokio::test]
async fn users_inject_into_staged_config() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    panel.state.set_node_config(NODE, SINGBOX_DOC.to_owned()).await;
    panel
        .state
        .set_node_users(NODE, vec![
            panel_proto::User {
                uuid: "9f6d7f3e-0000-4000-8000-000000000001".to_owned(),
                email: "42.alice".to_owned(),
                enabled: true,
            },
            panel_proto::User {
                uuid: "9f6d7f3e-0000-4000-8000-000000000002".to_owned(),
                email: "43.bob".to_owned(),
                enabled: false,
            },
        ])
        .await;

    let config = panel.agent_config(NODE, staging.path(), TOKEN)?;
    let state = build(config, CancellationToken::new()).await?;
    sync_tick(&state).await;

    let staged = std::fs::read_to_string(staging.path().join("sing-box.json"))?;
    assert!(staged.contains("42.alice"), "enabled user injected: {staged}");
    assert!(!staged.contains("43.bob"), "disabled user filtered: {staged}");
    Ok(())
}

#[tokio::test]
async fn interval_overrides_reach_the_tickers() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    panel.state.set_interval_overrides(30, 15).await;

    let config = panel.agent_config(NODE, staging.path(), TOKEN)?;
    let state = build(config, CancellationToken::new()).await?;
    assert_eq!(state.sync_period(), Duration::from_secs(60));

    report_tick(&state).await;
    assert_eq!(state.sync_period(), Duration::from_secs(30));
    assert_eq!(state.report_period(), Duration::from_secs(15));
    Ok(())
}

#[tokio::test]
async fn traffic_flows_into_buckets_and_the_store() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    let config = panel.agent_config(1, staging.path(), TOKEN)?;
    let transport = PanelTransport::connect(&config, CancellationToken::new())?;

    // Three deltas for the same user, as an agent would report them.
    for _ in 0..3 {
        let resp = transport
            .report_traffic(Utc::now().timestamp(), vec![agent_proto::UserTraffic {
                user_id: 42,
                upload_bytes: 1024,
                download_bytes: 0,
            }])
            .await
            .map_err(anyhow::Error::from)?;
        assert!(resp.success);
    }

    // Daily flush lands one additive row of 3072.
    let repo = FileStatRepository::ephemeral();
    let accumulator = panel.state.accumulators.accumulator(Granularity::Daily);
    let applied = flush(accumulator, Granularity::Daily, &repo, Utc::now()).await?;
    assert_eq!(applied, 1);
    assert_eq!(repo.user_total(42, 1).await, StatRow { upload: 3072, download: 0 });

    // Hourly bucket still holds its own copy.
    let hourly = panel.state.accumulators.accumulator(Granularity::Hourly);
    assert_eq!(hourly.get(1, 42).map(|d| d.upload), Some(3072));
    Ok(())
}

#[tokio::test]
async fn panel_commands_dispatch_over_the_stream() -> anyhow::Result<()> {
    let panel = TestPanel::start().await?;
    let staging = tempfile::tempdir()?;
    let config = panel.agent_config(NODE, staging.path(), TOKEN)?;

    let shutdown = CancellationToken::new();
    let agent = tokio::spawn(run_with_shutdown(config, shutdown.clone()));

    // Wait for the agent's stream to register.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !panel.state.connected_agents().await.contains(&NODE) {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "agent never connected");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Inventory query round-trips.
    let reply = panel
        .state
        .send_command(NODE, Duration::from_secs(5), |command_id| {
            panel_proto::panel_command::Command::GetCores(panel_proto::GetCoresCommand {
                command_id,
            })
        })
        .await?;
    let Some(panel_proto::agent_message::Message::Cores(cores)) = reply.message else {
        anyhow::bail!("expected a cores report, got {reply:?}");
    };
    assert_eq!(cores.cores.len(), 1);
    assert_eq!(cores.cores[0].engine_kind, "singbox");
    assert!(!cores.cores[0].installed);

    // Zero-downtime switches are refused (not silently downgraded) when
    // the switcher is disabled.
    let reply = panel
        .state
        .send_command(NODE, Duration::from_secs(5), |command_id| {
            panel_proto::panel_command::Command::SwitchCore(panel_proto::SwitchCoreCommand {
                command_id,
                from_instance_id: String::new(),
                engine_kind: "singbox".to_owned(),
                config_json: SINGBOX_DOC.to_owned(),
                switch_id: "sw-9".to_owned(),
                listen_ports: vec![443],
                zero_downtime: true,
            })
        })
        .await?;
    let Some(panel_proto::agent_message::Message::SwitchResult(result)) = reply.message else {
        anyhow::bail!("expected a switch result, got {reply:?}");
    };
    assert!(!result.success);
    assert!(result.error.contains("disabled"), "unexpected: {}", result.error);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), agent).await;
    Ok(())
}
