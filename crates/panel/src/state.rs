// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared panel state: per-node documents, connected agents, and the
//! traffic accumulators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::service::proto;
use crate::stat::MultiAccumulator;

/// Versioned documents the panel serves to one node.
#[derive(Debug, Clone, Default)]
pub struct NodeDocs {
    pub config_json: String,
    pub config_version: i64,
    pub config_etag: String,
    pub users: Vec<proto::User>,
    pub users_etag: String,
    pub forwarding_rules: Vec<proto::ForwardingRule>,
    pub forwarding_version: i64,
}

type CommandSender = mpsc::Sender<Result<proto::PanelCommand, Status>>;

/// Everything the gRPC service and the flush jobs share.
pub struct PanelState {
    token: String,
    pub accumulators: Arc<MultiAccumulator>,
    pub shutdown: CancellationToken,

    nodes: RwLock<HashMap<i64, NodeDocs>>,
    /// Command-stream sender per connected agent.
    agents: RwLock<HashMap<i64, CommandSender>>,
    /// In-flight Panel→Agent commands awaiting replies.
    pending: Mutex<HashMap<u64, oneshot::Sender<proto::AgentMessage>>>,
    next_command: AtomicU64,

    /// Tick-interval overrides handed to agents via ReportStatus; zero
    /// means none.
    intervals: RwLock<(u32, u32)>,

    last_status: RwLock<HashMap<i64, proto::StatusReport>>,
    forwarding_acks: RwLock<HashMap<i64, proto::ForwardingStatusReport>>,
    alive_users: RwLock<HashMap<i64, Vec<i64>>>,
}

impl PanelState {
    pub fn new(token: String, shutdown: CancellationToken) -> Self {
        Self {
            token,
            accumulators: Arc::new(MultiAccumulator::new()),
            shutdown,
            nodes: RwLock::new(HashMap::new()),
            agents: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_command: AtomicU64::new(1),
            intervals: RwLock::new((0, 0)),
            last_status: RwLock::new(HashMap::new()),
            forwarding_acks: RwLock::new(HashMap::new()),
            alive_users: RwLock::new(HashMap::new()),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Opaque version tag for a served document.
    pub fn etag(bytes: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(bytes);
        let mut out = String::with_capacity(32);
        for b in &digest[..16] {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    // -- Node documents -------------------------------------------------------

    pub async fn set_node_config(&self, node_id: i64, config_json: String) {
        let etag = Self::etag(config_json.as_bytes());
        let mut nodes = self.nodes.write().await;
        let docs = nodes.entry(node_id).or_default();
        if docs.config_etag != etag {
            docs.config_version += 1;
            docs.config_etag = etag;
            docs.config_json = config_json;
        }
    }

    pub async fn set_node_users(&self, node_id: i64, users: Vec<proto::User>) {
        let rendered = users
            .iter()
            .map(|u| format!("{}|{}|{}", u.uuid, u.email, u.enabled))
            .collect::<Vec<_>>()
            .join("\n");
        let etag = Self::etag(rendered.as_bytes());
        let mut nodes = self.nodes.write().await;
        let docs = nodes.entry(node_id).or_default();
        if docs.users_etag != etag {
            docs.users_etag = etag;
            docs.users = users;
        }
    }

    pub async fn set_forwarding_rules(&self, node_id: i64, rules: Vec<proto::ForwardingRule>) {
        let mut nodes = self.nodes.write().await;
        let docs = nodes.entry(node_id).or_default();
        docs.forwarding_version += 1;
        docs.forwarding_rules = rules;
    }

    pub async fn node_docs(&self, node_id: i64) -> Option<NodeDocs> {
        self.nodes.read().await.get(&node_id).cloned()
    }

    // -- Interval overrides ---------------------------------------------------

    pub async fn set_interval_overrides(&self, sync_secs: u32, report_secs: u32) {
        *self.intervals.write().await = (sync_secs, report_secs);
    }

    pub async fn interval_overrides(&self) -> (u32, u32) {
        *self.intervals.read().await
    }

    // -- Reports --------------------------------------------------------------

    pub async fn record_status(&self, report: proto::StatusReport) {
        self.last_status.write().await.insert(report.node_id, report);
    }

    pub async fn last_status(&self, node_id: i64) -> Option<proto::StatusReport> {
        self.last_status.read().await.get(&node_id).cloned()
    }

    pub async fn record_forwarding_ack(&self, ack: proto::ForwardingStatusReport) {
        self.forwarding_acks.write().await.insert(ack.node_id, ack);
    }

    pub async fn forwarding_ack(&self, node_id: i64) -> Option<proto::ForwardingStatusReport> {
        self.forwarding_acks.read().await.get(&node_id).cloned()
    }

    pub async fn record_alive(&self, node_id: i64, user_ids: Vec<i64>) {
        self.alive_users.write().await.insert(node_id, user_ids);
    }

    pub async fn alive_users(&self, node_id: i64) -> Vec<i64> {
        self.alive_users.read().await.get(&node_id).cloned().unwrap_or_default()
    }

    // -- Command stream -------------------------------------------------------

    pub async fn register_agent(&self, node_id: i64, sender: CommandSender) {
        info!(node = node_id, "agent stream connected");
        if self.agents.write().await.insert(node_id, sender).is_some() {
            debug!(node = node_id, "previous agent stream replaced");
        }
    }

    pub async fn unregister_agent(&self, node_id: i64) {
        self.agents.write().await.remove(&node_id);
        info!(node = node_id, "agent stream disconnected");
    }

    pub async fn connected_agents(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.agents.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Route an agent reply to whoever is waiting on its command id.
    pub async fn resolve_reply(&self, command_id: u64, message: proto::AgentMessage) {
        let waiter = self.pending.lock().await.remove(&command_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => warn!(command_id, "reply for unknown command"),
        }
    }

    /// Send a command to a connected agent and wait for its reply.
    ///
    /// `build` receives the allocated command id.
    pub async fn send_command<F>(
        &self,
        node_id: i64,
        timeout: Duration,
        build: F,
    ) -> anyhow::Result<proto::AgentMessage>
    where
        F: FnOnce(u64) -> proto::panel_command::Command,
    {
        let sender = self
            .agents
            .read()
            .await
            .get(&node_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("node {node_id} has no connected agent"))?;

        let command_id = self.next_command.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(command_id, tx);

        let command = proto::PanelCommand { command: Some(build(command_id)) };
        if sender.send(Ok(command)).await.is_err() {
            self.pending.lock().await.remove(&command_id);
            anyhow::bail!("agent stream for node {node_id} closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => anyhow::bail!("reply channel for command {command_id} dropped"),
            Err(_) => {
                self.pending.lock().await.remove(&command_id);
                anyhow::bail!("command {command_id} to node {node_id} timed out")
            }
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
