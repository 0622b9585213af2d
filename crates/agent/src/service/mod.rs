// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Uniform service control over whatever init system the host runs.

pub mod custom;
pub mod direct;
pub mod openrc;
pub mod runit;
pub mod systemd;

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, warn};

use crate::config::{ServiceBackendKind, ServiceConfig};

/// Result of a status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

impl ServiceStatus {
    pub const STOPPED: Self = Self { running: false, pid: None };
}

/// Service control backend. Engine-agnostic: callers pass service names.
///
/// A tagged choice over the closed backend set; detection picks one at
/// agent startup and it never changes at runtime.
pub enum ServiceManager {
    Systemd(systemd::Systemd),
    Openrc(openrc::Openrc),
    Runit(runit::Runit),
    Custom(custom::Custom),
    Direct(direct::Direct),
}

impl ServiceManager {
    /// Pick a backend: explicit config wins, otherwise detection
    /// precedence is systemd → OpenRC → runit → direct process.
    pub fn detect(config: &ServiceConfig, pid_dir: &Path) -> Self {
        match config.backend {
            ServiceBackendKind::Systemd => return Self::Systemd(systemd::Systemd::new()),
            ServiceBackendKind::Openrc => return Self::Openrc(openrc::Openrc::new()),
            ServiceBackendKind::Runit => {
                return Self::Runit(runit::Runit::new(config.runit_dir.clone()));
            }
            ServiceBackendKind::Custom => {
                return Self::Custom(custom::Custom::new(
                    config.custom_commands.clone(),
                    config.allow_kill_fallback,
                ));
            }
            ServiceBackendKind::Direct => {
                return Self::Direct(direct::Direct::new(pid_dir.to_path_buf()));
            }
            ServiceBackendKind::Auto => {}
        }

        if systemd::Systemd::present() {
            debug!("service backend: systemd");
            Self::Systemd(systemd::Systemd::new())
        } else if openrc::Openrc::present() {
            debug!("service backend: openrc");
            Self::Openrc(openrc::Openrc::new())
        } else if runit::Runit::present(config.runit_dir.as_deref()) {
            debug!("service backend: runit");
            Self::Runit(runit::Runit::new(config.runit_dir.clone()))
        } else {
            debug!("service backend: direct process fallback");
            Self::Direct(direct::Direct::new(pid_dir.to_path_buf()))
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Systemd(_) => "systemd",
            Self::Openrc(_) => "openrc",
            Self::Runit(_) => "runit",
            Self::Custom(_) => "custom",
            Self::Direct(_) => "direct",
        }
    }

    /// The direct backend when active; adapters register process specs
    /// with it so start/stop know what to spawn.
    pub fn direct(&self) -> Option<&direct::Direct> {
        match self {
            Self::Direct(d) => Some(d),
            _ => None,
        }
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        match self {
            Self::Systemd(b) => b.start(service).await,
            Self::Openrc(b) => b.start(service).await,
            Self::Runit(b) => b.start(service).await,
            Self::Custom(b) => b.start(service).await,
            Self::Direct(b) => b.start(service).await,
        }
    }

    /// Stop a service. A stop failure against a service that a status
    /// re-check shows as not running is treated as success.
    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        let result = match self {
            Self::Systemd(b) => b.stop(service).await,
            Self::Openrc(b) => b.stop(service).await,
            Self::Runit(b) => b.stop(service).await,
            Self::Custom(b) => b.stop(service).await,
            Self::Direct(b) => b.stop(service).await,
        };
        if let Err(ref e) = result {
            if !self.status(service).await.unwrap_or(ServiceStatus::STOPPED).running {
                debug!(service, "stop reported failure but service is down: {e:#}");
                return Ok(());
            }
        }
        result
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        match self {
            Self::Systemd(b) => b.restart(service).await,
            Self::Openrc(b) => b.restart(service).await,
            Self::Runit(b) => b.restart(service).await,
            Self::Custom(b) => b.restart(service).await,
            Self::Direct(b) => b.restart(service).await,
        }
    }

    /// Reload, falling back to restart where the backend has no reload.
    pub async fn reload(&self, service: &str) -> anyhow::Result<()> {
        let result = match self {
            Self::Systemd(b) => b.reload(service).await,
            Self::Openrc(b) => b.reload(service).await,
            Self::Runit(b) => b.reload(service).await,
            Self::Custom(b) => return b.reload_or_restart(service).await,
            Self::Direct(b) => b.reload(service).await,
        };
        match result {
            Err(e) => {
                warn!(service, "reload failed, restarting instead: {e:#}");
                self.restart(service).await
            }
            ok => ok,
        }
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        match self {
            Self::Systemd(b) => b.status(service).await,
            Self::Openrc(b) => b.status(service).await,
            Self::Runit(b) => b.status(service).await,
            Self::Custom(b) => b.status(service).await,
            Self::Direct(b) => b.status(service).await,
        }
    }

    pub async fn enable(&self, service: &str) -> anyhow::Result<()> {
        match self {
            Self::Systemd(b) => b.enable(service).await,
            Self::Openrc(b) => b.enable(service).await,
            Self::Runit(b) => b.enable(service).await,
            Self::Custom(b) => b.enable(service).await,
            Self::Direct(_) => Ok(()),
        }
    }

    pub async fn disable(&self, service: &str) -> anyhow::Result<()> {
        match self {
            Self::Systemd(b) => b.disable(service).await,
            Self::Openrc(b) => b.disable(service).await,
            Self::Runit(b) => b.disable(service).await,
            Self::Custom(b) => b.disable(service).await,
            Self::Direct(_) => Ok(()),
        }
    }
}

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Captured output of a finished service command.
pub(crate) struct CommandOutput {
    pub status_ok: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Run a command with a bounded runtime, capturing output.
pub(crate) async fn run_command(program: &str, args: &[&str]) -> anyhow::Result<CommandOutput> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        tokio::process::Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("{program} {} timed out", args.join(" ")))?
    .with_context(|| format!("spawning {program}"))?;

    Ok(CommandOutput {
        status_ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command and fail on nonzero exit.
pub(crate) async fn run_checked(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let out = run_command(program, args).await?;
    if !out.status_ok {
        anyhow::bail!("{program} {} failed: {}", args.join(" "), out.stderr.trim());
    }
    Ok(())
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
