// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent configuration: a small clap surface plus a YAML settings file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

/// Node agent for XBoard proxy fleets.
#[derive(Debug, Parser)]
#[command(name = "xboard-agent", version, about)]
pub struct Cli {
    /// Path to the YAML settings file.
    #[arg(long, env = "XBOARD_AGENT_CONFIG", default_value = "/etc/xboard/agent.yaml")]
    pub config: PathBuf,

    /// Log format (json or text).
    #[arg(long, env = "XBOARD_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "XBOARD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Top-level YAML settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Numeric node identity assigned by the panel.
    pub node_id: i64,
    pub panel: PanelConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub interval: IntervalConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub forwarding: ForwardingConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PanelConfig {
    /// Bearer token identifying this host to the panel.
    pub host_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GrpcConfig {
    /// Legacy (non-gRPC) mode was removed; `false` is a fatal config error.
    pub enabled: bool,
    /// Panel endpoint, e.g. `https://panel.example.com:8443`.
    pub address: String,
    pub tls: TlsConfig,
    pub keepalive: KeepaliveConfig,
    pub retry: RetryConfig,
    pub timeout: TimeoutConfig,
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: String::new(),
            tls: TlsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeepaliveConfig {
    #[serde(with = "humantime_serde")]
    pub time: Duration,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { time: Duration::from_secs(30), timeout: Duration::from_secs(10) }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(with = "humantime_serde")]
    pub default: Duration,
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { default: Duration::from_secs(10), connect: Duration::from_secs(5) }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntervalConfig {
    /// Config/user sync cadence in seconds.
    pub sync: u64,
    /// Status/traffic report cadence in seconds.
    pub report: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self { sync: 60, report: 60 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Enables the zero-downtime switcher and its DNAT table.
    pub enabled: bool,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Allocation retries on address-in-use.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub health_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub health_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    pub nft_bin: PathBuf,
    pub conntrack_bin: PathBuf,
    pub nft_table_name: String,
    pub pid_dir: PathBuf,
    pub cgroup_base_path: PathBuf,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port_range_start: 30000,
            port_range_end: 40000,
            max_retries: 10,
            health_timeout: Duration::from_secs(10),
            health_interval: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
            nft_bin: PathBuf::from("nft"),
            conntrack_bin: PathBuf::from("conntrack"),
            nft_table_name: "xboard_proxy".to_owned(),
            pid_dir: PathBuf::from("/var/run/xboard"),
            cgroup_base_path: PathBuf::from("/sys/fs/cgroup/xboard"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardingConfig {
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,
    pub table_name: String,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sync_interval: Duration::from_secs(30),
            table_name: "xboard_forwarding".to_owned(),
        }
    }
}

/// Service-manager backend selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// `auto` (detect), `systemd`, `openrc`, `runit`, `custom`, or `direct`.
    pub backend: ServiceBackendKind,
    /// Command templates for the custom backend. Keys: start, stop,
    /// restart, reload, status, enable, disable. `{service}` and
    /// `{{service}}` are substituted with the service name.
    pub custom_commands: HashMap<String, String>,
    /// Let the custom backend `pkill -f` by config-file name when its
    /// stop command fails. Off unless explicitly requested.
    pub allow_kill_fallback: bool,
    /// Service directory for the runit backend.
    pub runit_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceBackendKind {
    #[default]
    Auto,
    Systemd,
    Openrc,
    Runit,
    Custom,
    Direct,
}

/// Per-engine settings. The closed engine set mirrors the adapters.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnginesConfig {
    pub xray: Option<EngineConfig>,
    pub singbox: Option<EngineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Engine binary, also used for version/capability probes.
    pub binary: PathBuf,
    /// Directory where staged instance configs are written.
    pub config_dir: PathBuf,
    /// Base service name; `{instance}` is substituted when present,
    /// otherwise non-base instances become `<name>@<id>`.
    pub service_name: String,
    /// Engine access log to tail for `ReportAccessLogs`.
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    /// Command producing v2ray-format stats JSON on stdout, e.g.
    /// `[xray, api, statsquery, --server, 127.0.0.1:10085, -reset]`.
    /// Empty disables traffic collection for this engine.
    #[serde(default)]
    pub stats_command: Vec<String>,
    /// Explicit PID file for the direct-process backend.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

impl AgentConfig {
    /// Load and validate a YAML settings file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Self = serde_yaml::from_str(&bytes)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.grpc.enabled {
            anyhow::bail!("legacy non-gRPC transport was removed; set grpc.enabled = true");
        }
        if self.grpc.address.is_empty() {
            anyhow::bail!("grpc.address must be set");
        }
        if self.panel.host_token.is_empty() {
            anyhow::bail!("panel.host_token must be set");
        }
        if self.node_id <= 0 {
            anyhow::bail!("node_id must be a positive panel-assigned id");
        }
        if self.proxy.port_range_start > self.proxy.port_range_end {
            anyhow::bail!(
                "proxy.port_range_start ({}) exceeds proxy.port_range_end ({})",
                self.proxy.port_range_start,
                self.proxy.port_range_end
            );
        }
        if self.service.backend == ServiceBackendKind::Custom
            && !self.service.custom_commands.contains_key("start")
        {
            anyhow::bail!("service.backend = custom requires at least a start command");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
