// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Conntrack flushing after a remap, so established flows re-resolve
//! through the new DNAT rules instead of lingering on the old backend.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::debug;

const CONNTRACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives the host `conntrack` utility.
#[derive(Debug, Clone)]
pub struct ConntrackFlusher {
    bin: PathBuf,
}

impl ConntrackFlusher {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    /// Delete flows towards `port` for one protocol on both families.
    ///
    /// conntrack exits nonzero when nothing matched; "0 flow entries"
    /// is a success for our purposes.
    pub async fn flush_port(&self, port: u16, protocol: &str) -> anyhow::Result<()> {
        let port_str = port.to_string();
        self.run(&["-D", "-p", protocol, "--dport", &port_str]).await?;
        self.run(&["-D", "-f", "ipv6", "-p", protocol, "--dport", &port_str]).await?;
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> anyhow::Result<()> {
        let output = tokio::time::timeout(
            CONNTRACK_TIMEOUT,
            tokio::process::Command::new(&self.bin).args(args).output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("conntrack {} timed out", args.join(" ")))?
        .with_context(|| format!("spawning {}", self.bin.display()))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("0 flow entries have been deleted") {
            debug!(args = args.join(" "), "no flows matched");
            return Ok(());
        }
        anyhow::bail!("conntrack {} failed: {}", args.join(" "), stderr.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let flusher = ConntrackFlusher::new(PathBuf::from("/nonexistent/conntrack"));
        assert!(flusher.flush_port(443, "tcp").await.is_err());
    }

    #[tokio::test]
    async fn zero_flow_exit_is_success() -> anyhow::Result<()> {
        // A stand-in that fails with conntrack's "nothing matched" text.
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("conntrack");
        std::fs::write(
            &script,
            "#!/bin/sh\necho '0 flow entries have been deleted.' >&2\nexit 1\n",
        )?;
        let mut perms = std::fs::metadata(&script)?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms)?;

        let flusher = ConntrackFlusher::new(script);
        flusher.flush_port(443, "tcp").await?;
        Ok(())
    }

    #[tokio::test]
    async fn real_failures_surface() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("conntrack");
        std::fs::write(&script, "#!/bin/sh\necho 'permission denied' >&2\nexit 1\n")?;
        let mut perms = std::fs::metadata(&script)?.permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&script, perms)?;

        let flusher = ConntrackFlusher::new(script);
        assert!(flusher.flush_port(443, "tcp").await.is_err());
        Ok(())
    }
}
