// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::engine::{CoreInstance, EngineKind, InstanceState};
use crate::nft::ApplyLock;
use crate::switch::{CoreControl, SwitchRequest, Switcher};

/// Test stand-in for the core manager: "starting" an instance binds real
/// loopback listeners on the allocated internal ports so the health
/// checker sees a live backend.
struct FakeCore {
    staging: PathBuf,
    bind: bool,
    start_gate: Option<Arc<tokio::sync::Semaphore>>,
    listeners: tokio::sync::Mutex<HashMap<String, Vec<TcpListener>>>,
    stops: parking_lot::Mutex<Vec<String>>,
    instances: tokio::sync::Mutex<HashMap<String, CoreInstance>>,
}

impl FakeCore {
    fn new(staging: &Path, bind: bool) -> Self {
        Self {
            staging: staging.to_path_buf(),
            bind,
            start_gate: None,
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            stops: parking_lot::Mutex::new(vec![]),
            instances: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn with_start_gate(mut self, gate: Arc<tokio::sync::Semaphore>) -> Self {
        self.start_gate = Some(gate);
        self
    }

    fn stops(&self) -> Vec<String> {
        self.stops.lock().clone()
    }

    async fn seed_instance(&self, id: &str, kind: EngineKind) {
        let mut record = CoreInstance::new(id, kind);
        record.state = InstanceState::Running;
        self.instances.lock().await.insert(id.to_owned(), record);
    }
}

impl CoreControl for FakeCore {
    fn staging_dir(&self, _kind: EngineKind) -> anyhow::Result<PathBuf> {
        Ok(self.staging.clone())
    }

    async fn start_instance(
        &self,
        kind: EngineKind,
        id: &str,
        config_path: &Path,
        listen_ports: &[u16],
    ) -> anyhow::Result<CoreInstance> {
        if let Some(ref gate) = self.start_gate {
            let _permit = gate.acquire().await?;
        }

        // The switcher hands us the patched per-group config; bind what
        // it says, the way a real engine would.
        let text = std::fs::read_to_string(config_path)?;
        let value: Value = serde_json::from_str(&text)?;
        let mut bound = vec![];
        if self.bind {
            let inbounds = value.get("inbounds").and_then(Value::as_array).cloned().unwrap_or_default();
            for inbound in &inbounds {
                let Some(port) = inbound.get("listen_port").and_then(Value::as_u64) else {
                    continue;
                };
                let listener = TcpListener::bind(("127.0.0.1", port as u16))?;
                bound.push(listener);
            }
        }
        self.listeners.lock().await.insert(id.to_owned(), bound);

        let mut record = CoreInstance::new(id, kind);
        record.state = InstanceState::Running;
        record.pid = Some(std::process::id());
        record.listen_ports = listen_ports.to_vec();
        self.instances.lock().await.insert(id.to_owned(), record.clone());
        Ok(record)
    }

    async fn stop_instance(&self, _kind: EngineKind, id: &str) -> anyhow::Result<()> {
        self.stops.lock().push(id.to_owned());
        self.listeners.lock().await.remove(id);
        self.instances.lock().await.remove(id);
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Option<CoreInstance> {
        self.instances.lock().await.get(id).cloned()
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    capture: PathBuf,
    pid_dir: PathBuf,
    staging: PathBuf,
    config: ProxyConfig,
}

fn write_stub(path: &Path, body: &str) -> anyhow::Result<()> {
    std::fs::write(path, body)?;
    let mut perms = std::fs::metadata(path)?.permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

fn harness() -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let capture = dir.path().join("nft-scripts.log");
    let nft_bin = dir.path().join("nft");
    write_stub(
        &nft_bin,
        &format!(
            "#!/bin/sh\ncase \"$1\" in\n  --version) echo 'nftables v1.0.9'; exit 0 ;;\n  -j) echo '{{\"nftables\": []}}'; exit 0 ;;\nesac\ncat >> '{}'\nexit 0\n",
            capture.display()
        ),
    )?;
    let conntrack_bin = dir.path().join("conntrack");
    write_stub(&conntrack_bin, "#!/bin/sh\nexit 0\n")?;

    let pid_dir = dir.path().join("pids");
    let staging = dir.path().join("staging");
    // A file in the way makes the cgroup base uncreatable, which keeps
    // the test process out of any real (or fake) kill path.
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "")?;

    let config = ProxyConfig {
        enabled: true,
        port_range_start: 41000,
        port_range_end: 41999,
        max_retries: 10,
        health_timeout: Duration::from_secs(2),
        health_interval: Duration::from_millis(50),
        drain_timeout: Duration::from_millis(100),
        nft_bin,
        conntrack_bin,
        nft_table_name: "xboard_proxy".to_owned(),
        pid_dir: pid_dir.clone(),
        cgroup_base_path: blocker.join("cgroup"),
    };
    Ok(Harness { _dir: dir, capture, pid_dir, staging, config })
}

fn request(ports: &[u16], from: Option<&str>) -> SwitchRequest {
    SwitchRequest {
        from_instance_id: from.map(str::to_owned),
        engine_kind: EngineKind::SingBox,
        config_json: format!(
            r#"{{"inbounds": [{}]}}"#,
            ports
                .iter()
                .map(|p| format!(r#"{{"type": "vless", "listen": "0.0.0.0", "listen_port": {p}, "users": []}}"#))
                .collect::<Vec<_>>()
                .join(", ")
        ),
        external_ports: ports.to_vec(),
    }
}

#[tokio::test]
async fn successful_switch_remaps_and_records() -> anyhow::Result<()> {
    let h = harness()?;
    let core = Arc::new(FakeCore::new(&h.staging, true));
    let switcher = Switcher::new(
        Arc::clone(&core),
        h.config.clone(),
        Arc::new(ApplyLock::new()),
        CancellationToken::new(),
    );
    switcher.initialize().await?;

    let outcome = switcher.switch(request(&[443, 8443], None)).await?;
    assert!(outcome.new_instance_id.starts_with("singbox-"));
    assert_eq!(outcome.port_mappings.len(), 2);
    for internal in outcome.port_mappings.values() {
        assert!((41000..=41999).contains(internal));
    }

    // The applied ruleset replaced the table and mapped both externals.
    let script = std::fs::read_to_string(&h.capture)?;
    assert!(script.contains("delete table inet xboard_proxy"));
    let internal_443 = outcome.port_mappings[&443];
    assert!(script.contains(&format!("tcp dport 443 dnat ip to 127.0.0.1:{internal_443}")));
    assert!(script.contains(&format!("udp dport 443 dnat ip to 127.0.0.1:{internal_443}")));
    assert!(script.contains("dport 8443"));

    // PID record for the new instance exists and is active.
    assert!(h.pid_dir.join(format!("{}.json", outcome.new_instance_id)).exists());

    // Group state remembers the new owner.
    let groups = switcher.group_snapshot().await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].instance_id, outcome.new_instance_id);
    assert_eq!(groups[0].external_ports, vec![443, 8443]);

    // Nothing was stopped: there was no previous instance.
    assert!(core.stops().is_empty());
    Ok(())
}

#[tokio::test]
async fn health_failure_tears_down_new_instance_only() -> anyhow::Result<()> {
    let mut h = harness()?;
    h.config.health_timeout = Duration::from_millis(300);
    let core = Arc::new(FakeCore::new(&h.staging, false)); // never binds
    let switcher = Switcher::new(
        Arc::clone(&core),
        h.config.clone(),
        Arc::new(ApplyLock::new()),
        CancellationToken::new(),
    );
    switcher.initialize().await?;
    core.seed_instance("singbox-old", EngineKind::SingBox).await;

    let result = switcher.switch(request(&[443], Some("singbox-old"))).await;
    let err = result.err().map(|e| format!("{e:#}")).unwrap_or_default();
    assert!(err.contains("health"), "unexpected: {err}");

    // The sick instance was stopped and its pid record removed; the old
    // instance was never touched.
    let stops = core.stops();
    assert_eq!(stops.len(), 1);
    assert!(stops[0].starts_with("singbox-"));
    assert_ne!(stops[0], "singbox-old");
    let leftover: Vec<_> = std::fs::read_dir(&h.pid_dir)?.collect();
    assert!(leftover.is_empty(), "pid dir should be empty: {leftover:?}");

    // No ruleset was applied.
    let script = std::fs::read_to_string(&h.capture).unwrap_or_default();
    assert!(!script.contains("dport 443"));
    Ok(())
}

#[tokio::test]
async fn concurrent_switches_of_same_group_are_refused() -> anyhow::Result<()> {
    let h = harness()?;
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let core = Arc::new(FakeCore::new(&h.staging, true).with_start_gate(Arc::clone(&gate)));
    let switcher = Arc::new(Switcher::new(
        Arc::clone(&core),
        h.config.clone(),
        Arc::new(ApplyLock::new()),
        CancellationToken::new(),
    ));
    switcher.initialize().await?;

    let first = {
        let switcher = Arc::clone(&switcher);
        tokio::spawn(async move { switcher.switch(request(&[443], None)).await })
    };
    // Give the first switch time to take the group lock and park in start.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = switcher.switch(request(&[443], None)).await;
    let err = second.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("in progress"), "unexpected: {err}");

    // A disjoint group is not blocked by the first switch's lock.
    let gate2 = Arc::clone(&gate);
    gate2.add_permits(2);
    let disjoint = switcher.switch(request(&[9443], None)).await?;
    assert_eq!(disjoint.port_mappings.len(), 1);

    let outcome = first.await??;
    assert!(outcome.new_instance_id.starts_with("singbox-"));
    Ok(())
}

#[tokio::test]
async fn old_instance_drains_after_successful_switch() -> anyhow::Result<()> {
    let h = harness()?;
    let core = Arc::new(FakeCore::new(&h.staging, true));
    let switcher = Switcher::new(
        Arc::clone(&core),
        h.config.clone(),
        Arc::new(ApplyLock::new()),
        CancellationToken::new(),
    );
    switcher.initialize().await?;
    core.seed_instance("singbox-old", EngineKind::SingBox).await;

    let outcome = switcher.switch(request(&[443], Some("singbox-old"))).await?;
    // The switch itself returns before the drain touches the old core.
    assert!(core.stops().is_empty());

    // Drain grace is 100ms in this config; wait it out.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let stops = core.stops();
    assert_eq!(stops, vec!["singbox-old".to_owned()]);
    assert_ne!(outcome.new_instance_id, "singbox-old");
    Ok(())
}

#[tokio::test]
async fn invalid_requests_fail_before_locking() -> anyhow::Result<()> {
    let h = harness()?;
    let core = Arc::new(FakeCore::new(&h.staging, true));
    let switcher = Switcher::new(
        core,
        h.config.clone(),
        Arc::new(ApplyLock::new()),
        CancellationToken::new(),
    );

    let mut no_ports = request(&[443], None);
    no_ports.external_ports.clear();
    assert!(switcher.switch(no_ports).await.is_err());

    let mut bad_json = request(&[443], None);
    bad_json.config_json = "{".to_owned();
    assert!(switcher.switch(bad_json).await.is_err());

    // The group lock was never held, so a valid switch still proceeds.
    let outcome = switcher.switch(request(&[443], None)).await?;
    assert_eq!(outcome.port_mappings.len(), 1);
    Ok(())
}
