// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Health gating: a new instance must accept connections on every
//! allocated internal port before the DNAT remap happens.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Dials internal ports on loopback until all answer or time runs out.
#[derive(Debug, Clone, Copy)]
pub struct HealthChecker {
    timeout: Duration,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Wait until every port accepts a TCP connection on `127.0.0.1` or
    /// `[::1]`. An IPv6 stack that is absent entirely is not a failure;
    /// only the global timeout is.
    pub async fn wait_healthy(
        &self,
        ports: &[u16],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut pending: BTreeSet<u16> = ports.iter().copied().collect();

        loop {
            let mut passed = vec![];
            for &port in &pending {
                if dial(port).await {
                    passed.push(port);
                }
            }
            for port in passed {
                pending.remove(&port);
            }
            if pending.is_empty() {
                return Ok(());
            }

            if tokio::time::Instant::now() + self.interval > deadline {
                let ports: Vec<String> = pending.iter().map(u16::to_string).collect();
                anyhow::bail!(
                    "health check timeout after {:?} on ports {}",
                    self.timeout,
                    ports.join(", ")
                );
            }
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("health check cancelled"),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

async fn dial(port: u16) -> bool {
    let v4 = format!("127.0.0.1:{port}");
    if matches!(tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&v4)).await, Ok(Ok(_))) {
        return true;
    }
    let v6 = format!("[::1]:{port}");
    match tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(&v6)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!(port, "dial failed: {e}");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
