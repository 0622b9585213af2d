// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! XBoard panel: the control-plane side of the agent protocol. Serves
//! per-node config/user/forwarding documents, dispatches core-switch
//! commands over the agent stream, and aggregates per-user traffic into
//! hourly/daily/monthly buckets.

pub mod config;
pub mod service;
pub mod stat;
pub mod state;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::PanelConfig;
use crate::service::{proto, PanelGrpc};
use crate::stat::job::spawn_flush_jobs;
use crate::stat::repo::FileStatRepository;
use crate::state::PanelState;

/// Build shared state from config, seeding per-node documents.
pub async fn build_state(config: &PanelConfig, shutdown: CancellationToken) -> Arc<PanelState> {
    let state = Arc::new(PanelState::new(config.host_token.clone(), shutdown));
    state
        .set_interval_overrides(config.sync_interval_override, config.report_interval_override)
        .await;

    for (&node_id, seed) in &config.nodes {
        if let Some(ref path) = seed.config_file {
            match std::fs::read_to_string(path) {
                Ok(document) => state.set_node_config(node_id, document).await,
                Err(e) => tracing::warn!(node = node_id, "seed config unreadable: {e}"),
            }
        }
        if !seed.users.is_empty() {
            let users = seed
                .users
                .iter()
                .map(|u| proto::User {
                    uuid: u.uuid.clone(),
                    email: u.email.clone(),
                    enabled: u.enabled,
                })
                .collect();
            state.set_node_users(node_id, users).await;
        }
        if !seed.forwarding.is_empty() {
            let rules = seed
                .forwarding
                .iter()
                .map(|r| proto::ForwardingRule {
                    id: r.id,
                    listen_port: u32::from(r.listen_port),
                    target_address: r.target_address.clone(),
                    target_port: u32::from(r.target_port),
                    protocol: r.protocol.clone(),
                    priority: r.priority,
                    enabled: r.enabled,
                })
                .collect();
            state.set_forwarding_rules(node_id, rules).await;
        }
    }
    state
}

/// Run the panel until shutdown.
pub async fn run(config: PanelConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let state = build_state(&config, shutdown.clone()).await;

    let repo = Arc::new(FileStatRepository::open(config.stat_store.clone())?);
    let flush_tasks =
        spawn_flush_jobs(Arc::clone(&state.accumulators), repo, shutdown.clone());

    let addr: std::net::SocketAddr = config
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address {}: {e}", config.listen))?;
    info!(%addr, nodes = config.nodes.len(), "panel listening");

    let server_shutdown = shutdown.clone();
    let server = PanelGrpc::new(Arc::clone(&state))
        .into_router()
        .serve_with_shutdown(addr, async move { server_shutdown.cancelled().await });

    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.cancel();
        }
    }

    for task in flush_tasks {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), task).await;
    }
    Ok(())
}
