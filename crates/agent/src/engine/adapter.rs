// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine adapter: everything the agent does to one engine kind.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, info};

use crate::capability::{CapabilityCache, EngineProbe};
use crate::config::EngineConfig;
use crate::engine::registry::InstanceRegistry;
use crate::engine::{config_digest, singbox, xray, CoreInstance, EngineKind, InstanceState};
use crate::service::{ServiceManager, ServiceStatus};

/// Per-user traffic delta from an engine stats query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficDelta {
    pub user_id: i64,
    pub upload: u64,
    pub download: u64,
}

/// Adapter for one engine kind. Engine-specific behavior dispatches on
/// the closed [`EngineKind`] set.
pub struct EngineAdapter {
    kind: EngineKind,
    config: EngineConfig,
    service: Arc<ServiceManager>,
    registry: Arc<InstanceRegistry>,
    capabilities: Arc<CapabilityCache>,
}

impl EngineAdapter {
    pub fn new(
        kind: EngineKind,
        config: EngineConfig,
        service: Arc<ServiceManager>,
        registry: Arc<InstanceRegistry>,
        capabilities: Arc<CapabilityCache>,
    ) -> Self {
        Self { kind, config, service, registry, capabilities }
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn probe(&self) -> EngineProbe {
        self.capabilities.probe(self.kind, &self.config.binary).await
    }

    pub async fn version(&self) -> String {
        self.probe().await.version
    }

    /// Binary presence check; relative paths are resolved against PATH.
    pub fn is_installed(&self) -> bool {
        let binary = &self.config.binary;
        if binary.is_absolute() {
            return binary.exists();
        }
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
            })
            .unwrap_or(false)
    }

    /// Validate a config file with the engine's own checker.
    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        let args = match self.kind {
            EngineKind::Xray => xray::validate_args(config_path),
            EngineKind::SingBox => singbox::validate_args(config_path),
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = tokio::time::timeout(
            Duration::from_secs(15),
            tokio::process::Command::new(&self.config.binary).args(&arg_refs).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{} config check timed out", self.kind))?
        .with_context(|| format!("running {} config check", self.kind))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{} rejected config: {}", self.kind, stderr.trim());
        }
        Ok(())
    }

    /// Service unit name for an instance: the base name itself, a
    /// `{instance}` template substitution, or `base@id`.
    pub fn service_name(&self, id: &str) -> String {
        let base = &self.config.service_name;
        if id == base.as_str() {
            base.clone()
        } else if base.contains("{instance}") {
            base.replace("{instance}", id)
        } else {
            format!("{base}@{id}")
        }
    }

    /// Where an instance's staged config lives. The xray family keys
    /// staged configs by service name, sing-box by instance id.
    pub fn staged_path(&self, id: &str) -> PathBuf {
        let file = match self.kind {
            EngineKind::Xray => format!("{}.json", self.service_name(id)),
            EngineKind::SingBox => format!("{id}.json"),
        };
        self.config.config_dir.join(file)
    }

    /// Start an instance from a source config file.
    ///
    /// validate → hash → mark starting → stage if bytes differ → service
    /// start → mark running. Any failure marks the instance `error`.
    pub async fn start(
        &self,
        id: &str,
        config_path: &Path,
        listen_ports: &[u16],
    ) -> anyhow::Result<CoreInstance> {
        let result = self.start_inner(id, config_path, listen_ports).await;
        if let Err(ref e) = result {
            self.registry.mark_error(id, self.kind, format!("{e:#}")).await;
        }
        result
    }

    async fn start_inner(
        &self,
        id: &str,
        config_path: &Path,
        listen_ports: &[u16],
    ) -> anyhow::Result<CoreInstance> {
        self.validate_config(config_path).await?;

        let bytes = std::fs::read(config_path)
            .with_context(|| format!("reading {}", config_path.display()))?;
        let hash = config_digest(&bytes);

        let ports = listen_ports.to_vec();
        let staged = self.staged_path(id);
        self.registry
            .update(id, self.kind, |record| {
                record.state = InstanceState::Starting;
                record.listen_ports = ports.clone();
                record.config_path = staged.clone();
                record.config_hash = hash.clone();
                record.last_error = None;
            })
            .await;

        // Stage only when the source differs from what is already there.
        let needs_copy = match std::fs::read(&staged) {
            Ok(existing) => existing != bytes,
            Err(_) => true,
        };
        if needs_copy {
            if let Some(parent) = staged.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&staged, &bytes)
                .with_context(|| format!("staging {}", staged.display()))?;
            debug!(instance = id, path = %staged.display(), "staged config");
        }

        let service = self.service_name(id);
        if let Some(direct) = self.service.direct() {
            let args = match self.kind {
                EngineKind::Xray => xray::run_args(&staged),
                EngineKind::SingBox => singbox::run_args(&staged),
            };
            direct.register(&service, self.config.binary.clone(), args).await;
        }
        self.service.start(&service).await?;

        let status = self.service.status(&service).await.unwrap_or(ServiceStatus::STOPPED);
        let started_at = crate::transport::now_epoch_secs();
        let record = self
            .registry
            .update(id, self.kind, |record| {
                record.state = InstanceState::Running;
                record.pid = status.pid;
                record.started_at = Some(started_at);
            })
            .await;
        info!(instance = id, engine = %self.kind, pid = ?status.pid, "instance running");
        Ok(record)
    }

    pub async fn stop(&self, id: &str) -> anyhow::Result<()> {
        self.registry
            .update(id, self.kind, |record| record.state = InstanceState::Stopping)
            .await;
        let result = self.service.stop(&self.service_name(id)).await;
        match result {
            Ok(()) => {
                self.registry
                    .update(id, self.kind, |record| {
                        record.state = InstanceState::Stopped;
                        record.pid = None;
                    })
                    .await;
                Ok(())
            }
            Err(e) => {
                self.registry.mark_error(id, self.kind, format!("stop failed: {e:#}")).await;
                Err(e)
            }
        }
    }

    pub async fn restart(&self, id: &str) -> anyhow::Result<()> {
        self.service.restart(&self.service_name(id)).await
    }

    pub async fn reload(&self, id: &str) -> anyhow::Result<()> {
        self.service.reload(&self.service_name(id)).await
    }

    pub async fn status(&self, id: &str) -> anyhow::Result<ServiceStatus> {
        self.service.status(&self.service_name(id)).await
    }

    pub async fn list_instances(&self) -> Vec<CoreInstance> {
        self.registry
            .list()
            .await
            .into_iter()
            .filter(|record| record.engine_kind == self.kind)
            .collect()
    }

    /// Query per-user traffic deltas via the configured stats command.
    pub async fn collect_traffic(&self) -> anyhow::Result<Vec<TrafficDelta>> {
        let Some((program, args)) = self.config.stats_command.split_first() else {
            return Ok(vec![]);
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = tokio::time::timeout(
            Duration::from_secs(10),
            tokio::process::Command::new(program).args(&arg_refs).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{} stats query timed out", self.kind))?
        .with_context(|| format!("running {} stats query", self.kind))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} stats query failed: {}",
                self.kind,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_stats_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse v2ray-format stats JSON into per-user deltas.
///
/// Stat names look like `user>>>42.alice>>>traffic>>>uplink`; both engine
/// families emit this shape from their stats services.
pub fn parse_stats_output(output: &str) -> anyhow::Result<Vec<TrafficDelta>> {
    let value: Value =
        serde_json::from_str(output.trim()).context("parsing stats query output")?;
    let Some(stats) = value.get("stat").and_then(Value::as_array) else {
        return Ok(vec![]);
    };

    let mut by_user: std::collections::BTreeMap<i64, (u64, u64)> = Default::default();
    for stat in stats {
        let Some(name) = stat.get("name").and_then(Value::as_str) else {
            continue;
        };
        let parts: Vec<&str> = name.split(">>>").collect();
        if parts.len() != 4 || parts[0] != "user" || parts[2] != "traffic" {
            continue;
        }
        let Some(user_id) = parse_user_id(parts[1]) else {
            debug!(email = parts[1], "stats entry without numeric user id");
            continue;
        };
        let bytes = match stat.get("value") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::String(s)) => s.parse().unwrap_or(0),
            _ => 0,
        };
        let entry = by_user.entry(user_id).or_insert((0, 0));
        match parts[3] {
            "uplink" => entry.0 += bytes,
            "downlink" => entry.1 += bytes,
            _ => {}
        }
    }

    Ok(by_user
        .into_iter()
        .filter(|(_, (up, down))| *up != 0 || *down != 0)
        .map(|(user_id, (upload, download))| TrafficDelta { user_id, upload, download })
        .collect())
}

/// Panel user ids are encoded as the leading integer of the stats email,
/// e.g. `42.alice` or `42|host-3`.
pub fn parse_user_id(email: &str) -> Option<i64> {
    let digits: String = email.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
#[path = "adapter_tests.rs"]
mod tests;
