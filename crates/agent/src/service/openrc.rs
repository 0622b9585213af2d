// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use super::{run_checked, run_command, ServiceStatus};

/// OpenRC backend driving `rc-service` / `rc-update`.
pub struct Openrc;

impl Default for Openrc {
    fn default() -> Self {
        Self::new()
    }
}

impl Openrc {
    pub fn new() -> Self {
        Self
    }

    pub fn present() -> bool {
        ["/sbin/rc-service", "/usr/sbin/rc-service", "/bin/rc-service", "/usr/bin/rc-service"]
            .iter()
            .any(|p| Path::new(p).exists())
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-service", &[service, "start"]).await
    }

    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-service", &[service, "stop"]).await
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-service", &[service, "restart"]).await
    }

    pub async fn reload(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-service", &[service, "reload"]).await
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        let out = run_command("rc-service", &[service, "status"]).await?;
        // rc-service exits 0 when started; PID is not exposed uniformly.
        Ok(ServiceStatus { running: out.status_ok && out.stdout.contains("started"), pid: None })
    }

    pub async fn enable(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-update", &["add", service, "default"]).await
    }

    pub async fn disable(&self, service: &str) -> anyhow::Result<()> {
        run_checked("rc-update", &["del", service, "default"]).await
    }
}
