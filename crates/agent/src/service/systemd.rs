// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::Path;

use super::{run_checked, run_command, ServiceStatus};

/// systemd backend driving `systemctl`.
pub struct Systemd {
    bin: String,
}

impl Default for Systemd {
    fn default() -> Self {
        Self::new()
    }
}

impl Systemd {
    pub fn new() -> Self {
        Self { bin: "systemctl".to_owned() }
    }

    /// systemd advertises itself through /run/systemd/system.
    pub fn present() -> bool {
        Path::new("/run/systemd/system").is_dir()
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["start", service]).await
    }

    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["stop", service]).await
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["restart", service]).await
    }

    pub async fn reload(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["reload-or-restart", service]).await
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        let active = run_command(&self.bin, &["is-active", "--quiet", service]).await?;
        if !active.status_ok {
            return Ok(ServiceStatus::STOPPED);
        }
        // MainPID=0 for units without a main process.
        let show = run_command(&self.bin, &["show", "--property=MainPID", "--value", service])
            .await?;
        let pid = show.stdout.trim().parse::<u32>().ok().filter(|p| *p != 0);
        Ok(ServiceStatus { running: true, pid })
    }

    pub async fn enable(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["enable", service]).await
    }

    pub async fn disable(&self, service: &str) -> anyhow::Result<()> {
        run_checked(&self.bin, &["disable", service]).await
    }
}
