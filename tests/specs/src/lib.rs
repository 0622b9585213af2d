// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for cross-crate protocol tests: an in-process panel
//! server plus agent configs pointed at it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use xboard_agent::config::AgentConfig;
use xboard_panel::config::PanelConfig;
use xboard_panel::service::PanelGrpc;
use xboard_panel::state::PanelState;

pub const TOKEN: &str = "spec-test-token";

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// An in-process panel killed on drop.
pub struct TestPanel {
    pub state: Arc<PanelState>,
    pub port: u16,
    shutdown: CancellationToken,
}

impl TestPanel {
    /// Start a panel on a free loopback port and wait until it accepts.
    pub async fn start() -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let config: PanelConfig =
            serde_yaml::from_str(&format!("host_token: {TOKEN}\nlisten: 127.0.0.1:0\n"))?;
        let state = xboard_panel::build_state(&config, shutdown.clone()).await;

        let port = free_port()?;
        let addr: std::net::SocketAddr = format!("127.0.0.1:{port}").parse()?;
        let server_shutdown = shutdown.clone();
        let router = PanelGrpc::new(Arc::clone(&state)).into_router();
        tokio::spawn(async move {
            let _ = router
                .serve_with_shutdown(addr, async move { server_shutdown.cancelled().await })
                .await;
        });

        // Wait for the listener to come up.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                break;
            }
            anyhow::ensure!(tokio::time::Instant::now() < deadline, "panel did not start");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        Ok(Self { state, port, shutdown })
    }

    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// Agent settings pointed at this panel, staging engine configs
    /// under `staging_dir`.
    pub fn agent_config(
        &self,
        node_id: i64,
        staging_dir: &Path,
        token: &str,
    ) -> anyhow::Result<AgentConfig> {
        let yaml = format!(
            r#"
node_id: {node_id}
panel:
  host_token: {token}
grpc:
  address: "{endpoint}"
  retry:
    max_retries: 1
    initial_interval: 20ms
    max_interval: 100ms
  timeout:
    default: 3s
    connect: 2s
interval:
  sync: 60
  report: 60
engines:
  singbox:
    binary: /nonexistent/sing-box
    config_dir: {staging}
    service_name: sing-box
"#,
            endpoint = self.endpoint(),
            staging = staging_dir.display(),
        );
        Ok(serde_yaml::from_str(&yaml)?)
    }
}

impl Drop for TestPanel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
