// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Panel configuration: CLI surface plus a YAML settings file.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

/// Control plane for XBoard proxy fleets.
#[derive(Debug, Parser)]
#[command(name = "xboard-panel", version, about)]
pub struct Cli {
    /// Path to the YAML settings file.
    #[arg(long, env = "XBOARD_PANEL_CONFIG", default_value = "/etc/xboard/panel.yaml")]
    pub config: PathBuf,

    /// Log format (json or text).
    #[arg(long, env = "XBOARD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "XBOARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelConfig {
    /// gRPC listen address, e.g. `0.0.0.0:8443`.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Bearer token agents must present.
    pub host_token: String,
    /// Durable stat store location.
    #[serde(default = "default_stat_store")]
    pub stat_store: PathBuf,
    /// Optional tick-interval overrides handed to agents (seconds; 0 =
    /// none).
    #[serde(default)]
    pub sync_interval_override: u32,
    #[serde(default)]
    pub report_interval_override: u32,
    /// Seed documents per node id.
    #[serde(default)]
    pub nodes: HashMap<i64, NodeSeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSeed {
    /// Engine config document served to the node.
    pub config_file: Option<PathBuf>,
    pub users: Vec<SeedUser>,
    pub forwarding: Vec<SeedRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedUser {
    pub uuid: String,
    pub email: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedRule {
    pub id: i64,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8443".to_owned()
}

fn default_stat_store() -> PathBuf {
    PathBuf::from("/var/lib/xboard/stats.json")
}

fn default_true() -> bool {
    true
}

impl PanelConfig {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Self = serde_yaml::from_str(&bytes)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host_token.is_empty() {
            anyhow::bail!("host_token must be set");
        }
        if self.listen.is_empty() {
            anyhow::bail!("listen must be set");
        }
        Ok(())
    }
}
