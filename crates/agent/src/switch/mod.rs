// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Zero-downtime core switching.
//!
//! A switch starts the replacement engine on freshly-allocated internal
//! ports, health-gates it, then atomically remaps the group's external
//! ports in nftables. The old instance keeps serving until the remap and
//! is drained asynchronously afterwards; no failure path ever touches it.

pub mod alloc;
pub mod cgroup;
pub mod conntrack;
pub mod health;
pub mod lock;
pub mod patch;
pub mod pidfile;

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::engine::manager::{new_instance_id, CoreManager};
use crate::engine::{parse, CoreInstance, EngineKind};
use crate::nft::dnat::{expand_group, DnatManager};
use crate::nft::rebuild::StateRebuilder;
use crate::nft::{ApplyLock, Nft};
use crate::switch::alloc::{PortAllocator, StartError};
use crate::switch::cgroup::CgroupManager;
use crate::switch::conntrack::ConntrackFlusher;
use crate::switch::health::HealthChecker;
use crate::switch::lock::{group_id, GroupLocks};
use crate::switch::pidfile::{PidRecord, PidStatus, PidTracker};

/// The reduced core-manager surface the switcher consumes. Injected at
/// wiring time so the manager and the switcher never reference each
/// other directly.
pub trait CoreControl: Send + Sync + 'static {
    /// Directory where patched per-group configs are staged.
    fn staging_dir(&self, kind: EngineKind) -> anyhow::Result<PathBuf>;

    fn start_instance(
        &self,
        kind: EngineKind,
        id: &str,
        config_path: &Path,
        listen_ports: &[u16],
    ) -> impl Future<Output = anyhow::Result<CoreInstance>> + Send;

    fn stop_instance(
        &self,
        kind: EngineKind,
        id: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_instance(&self, id: &str) -> impl Future<Output = Option<CoreInstance>> + Send;
}

impl CoreControl for CoreManager {
    fn staging_dir(&self, kind: EngineKind) -> anyhow::Result<PathBuf> {
        Ok(self.adapter(kind)?.config().config_dir.clone())
    }

    async fn start_instance(
        &self,
        kind: EngineKind,
        id: &str,
        config_path: &Path,
        listen_ports: &[u16],
    ) -> anyhow::Result<CoreInstance> {
        self.adapter(kind)?.start(id, config_path, listen_ports).await
    }

    async fn stop_instance(&self, kind: EngineKind, id: &str) -> anyhow::Result<()> {
        self.adapter(kind)?.stop(id).await
    }

    async fn get_instance(&self, id: &str) -> Option<CoreInstance> {
        self.registry().get(id).await
    }
}

/// A requested switch, as delivered by the panel.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    pub from_instance_id: Option<String>,
    pub engine_kind: EngineKind,
    pub config_json: String,
    pub external_ports: Vec<u16>,
}

/// A completed switch.
#[derive(Debug, Clone)]
pub struct SwitchOutcome {
    pub new_instance_id: String,
    /// external port → internal port.
    pub port_mappings: BTreeMap<u16, u16>,
}

/// Current owner of one atomically-switched port group.
#[derive(Debug, Clone)]
pub struct InstanceGroup {
    pub external_ports: Vec<u16>,
    pub internal_ports: Vec<u16>,
    pub engine_kind: EngineKind,
    pub instance_id: String,
}

/// Budget for stopping an instance on the teardown and drain paths.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinates allocation, health gating, the atomic remap, and drains.
pub struct Switcher<C: CoreControl> {
    core: Arc<C>,
    config: ProxyConfig,
    dnat: DnatManager,
    rebuilder: StateRebuilder,
    apply_lock: Arc<ApplyLock>,
    groups: GroupLocks,
    allocator: PortAllocator,
    health: HealthChecker,
    conntrack: ConntrackFlusher,
    pids: Arc<PidTracker>,
    cgroups: Option<CgroupManager>,
    cancel: CancellationToken,
    group_state: tokio::sync::Mutex<HashMap<String, InstanceGroup>>,
}

impl<C: CoreControl> Switcher<C> {
    pub fn new(
        core: Arc<C>,
        config: ProxyConfig,
        apply_lock: Arc<ApplyLock>,
        cancel: CancellationToken,
    ) -> Self {
        let nft = Nft::new(config.nft_bin.clone());
        let cgroups = {
            let manager = CgroupManager::new(config.cgroup_base_path.clone());
            manager.available().then_some(manager)
        };
        Self {
            dnat: DnatManager::new(nft.clone(), config.nft_table_name.clone()),
            rebuilder: StateRebuilder::new(nft, config.nft_table_name.clone()),
            apply_lock,
            groups: GroupLocks::new(),
            allocator: PortAllocator::new(config.port_range_start, config.port_range_end),
            health: HealthChecker::new(config.health_timeout, config.health_interval),
            conntrack: ConntrackFlusher::new(config.conntrack_bin.clone()),
            pids: Arc::new(PidTracker::new(config.pid_dir.clone())),
            cgroups,
            cancel,
            group_state: tokio::sync::Mutex::new(HashMap::new()),
            core,
            config,
        }
    }

    /// Startup pass: reclaim the PID dir and make sure the DNAT table
    /// skeleton exists. nft being absent is tolerated here; switches
    /// will fail with a clear error instead.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.pids.dir())?;
        let cleaned = self.pids.cleanup_orphans().await;
        if cleaned > 0 {
            info!(records = cleaned, "orphan cleanup finished");
        }
        if self.dnat.available().await {
            if let Err(e) = self.dnat.ensure_infrastructure().await {
                warn!("dnat infrastructure setup failed: {e:#}");
            }
        } else {
            warn!("nft unavailable; zero-downtime switches will fail until it is installed");
        }
        Ok(())
    }

    /// Shutdown pass: one more orphan sweep so nothing outlives the agent.
    pub async fn shutdown(&self) {
        self.pids.cleanup_orphans().await;
    }

    pub async fn group_snapshot(&self) -> Vec<InstanceGroup> {
        self.group_state.lock().await.values().cloned().collect()
    }

    /// Perform a zero-downtime switch.
    pub async fn switch(&self, request: SwitchRequest) -> anyhow::Result<SwitchOutcome> {
        // 1. Validate inputs before taking any lock.
        if request.external_ports.is_empty() {
            anyhow::bail!("switch requires at least one external port");
        }
        parse::validate(&request.config_json)?;

        // 2. Group id + try-lock; a second switch of the same group is
        //    refused, not queued.
        let group = group_id(&request.external_ports);
        let _group_guard = self
            .groups
            .try_lock(&group)
            .ok_or_else(|| anyhow::anyhow!("switch already in progress for group {group}"))?;

        // 3. Internal ports already claimed by live rules.
        let occupied = self.rebuilder.occupied_internal_ports().await?;

        // 4. Allocate internal ports, patch the config, start the new
        //    instance. Collisions (against live rules or within the
        //    draw) count as address-in-use and are retried.
        let staging = self.core.staging_dir(request.engine_kind)?;
        std::fs::create_dir_all(&staging)?;
        let group_config = staging.join(format!("group-{group}.json"));

        let core = Arc::clone(&self.core);
        let kind = request.engine_kind;
        let config_json = request.config_json.clone();
        let occupied_ref = &occupied;
        let group_config_ref = &group_config;
        let (mapping, instance) = self
            .allocator
            .allocate_with_retry(&request.external_ports, self.config.max_retries, move |mapping| {
                let core = Arc::clone(&core);
                let config_json = config_json.clone();
                async move {
                    let mut seen = std::collections::BTreeSet::new();
                    for internal in mapping.values() {
                        if occupied_ref.contains(internal) || !seen.insert(*internal) {
                            return Err(StartError::AddressInUse(format!(
                                "internal port {internal} already mapped"
                            )));
                        }
                    }

                    let patched = patch::patch_internal_ports(&config_json, &mapping)
                        .map_err(StartError::Other)?;
                    std::fs::write(group_config_ref, patched)
                        .map_err(|e| StartError::Other(e.into()))?;

                    let id = new_instance_id(kind);
                    let internals: Vec<u16> = mapping.values().copied().collect();
                    core.start_instance(kind, &id, group_config_ref, &internals)
                        .await
                        .map_err(StartError::from_start_failure)
                }
            })
            .await?;
        let new_id = instance.id.clone();
        let internal_ports: Vec<u16> = mapping.values().copied().collect();

        // 5. PID bookkeeping for the new instance.
        if let Some(pid) = instance.pid {
            if let Some(ref cgroups) = self.cgroups {
                if let Err(e) = cgroups.add_pid(&new_id, pid) {
                    warn!(instance = %new_id, "cgroup placement failed: {e:#}");
                }
            }
            let record = PidRecord {
                pid,
                instance_id: new_id.clone(),
                engine_kind: kind.as_str().to_owned(),
                status: PidStatus::Active,
                created_at: crate::transport::now_epoch_secs(),
                ports: internal_ports.clone(),
            };
            if let Err(e) = self.pids.write(&record) {
                warn!(instance = %new_id, "pid record write failed: {e:#}");
            }
        } else {
            warn!(instance = %new_id, "no pid reported; skipping pid record");
        }

        // 6. Health gate. A sick instance is torn down; the old one has
        //    not been touched, so clients never notice.
        if let Err(e) = self.health.wait_healthy(&internal_ports, &self.cancel).await {
            self.teardown_new(kind, &new_id).await;
            return Err(e.context(format!("new instance {new_id} failed health gating")));
        }

        // 7. Atomic remap under the agent-wide nft mutex: keep every
        //    recovered rule outside this group, replace the group's own.
        {
            let guard = self.apply_lock.acquire().await;
            let recovered = match self.rebuilder.current_mappings().await {
                Ok(recovered) => recovered,
                Err(e) => {
                    drop(guard);
                    self.teardown_new(kind, &new_id).await;
                    return Err(e.context("state rebuild before remap failed"));
                }
            };
            let mut merged: Vec<crate::nft::PortMapping> = recovered
                .into_iter()
                .filter(|m| !request.external_ports.contains(&m.external_port))
                .collect();
            for (&external, &internal) in &mapping {
                merged.extend(expand_group(external, internal));
            }
            if let Err(e) = self.dnat.switch_atomic(&guard, &merged).await {
                drop(guard);
                self.teardown_new(kind, &new_id).await;
                return Err(e.context("atomic dnat remap failed"));
            }
        }

        // 8. Flush conntrack so established flows re-resolve. Best
        //    effort: the remap already happened.
        for &external in &request.external_ports {
            for protocol in ["tcp", "udp"] {
                if let Err(e) = self.conntrack.flush_port(external, protocol).await {
                    warn!(port = external, protocol, "conntrack flush failed: {e:#}");
                }
            }
        }

        // 9. Record the group owner and drain the old instance off the
        //    caller's path.
        {
            let mut groups = self.group_state.lock().await;
            groups.insert(group.clone(), InstanceGroup {
                external_ports: request.external_ports.clone(),
                internal_ports: internal_ports.clone(),
                engine_kind: kind,
                instance_id: new_id.clone(),
            });
        }
        if let Some(ref old_id) = request.from_instance_id {
            if old_id != &new_id {
                if let Some(old) = self.core.get_instance(old_id).await {
                    self.spawn_drain(old.engine_kind, old.id);
                } else {
                    debug!(instance = %old_id, "old instance unknown; nothing to drain");
                }
            }
        }

        // 10. Done.
        info!(group = %group, instance = %new_id, "switch complete");
        Ok(SwitchOutcome { new_instance_id: new_id, port_mappings: mapping })
    }

    /// Undo every effect on a failed new instance: stop it, kill its
    /// cgroup if termination missed anything, drop its PID record.
    async fn teardown_new(&self, kind: EngineKind, id: &str) {
        let stop = tokio::time::timeout(STOP_TIMEOUT, self.core.stop_instance(kind, id)).await;
        if !matches!(stop, Ok(Ok(()))) {
            warn!(instance = %id, "stop of failed instance did not complete cleanly");
            if let Some(ref cgroups) = self.cgroups {
                let _ = cgroups.kill(id);
            }
        }
        if let Some(ref cgroups) = self.cgroups {
            cgroups.remove(id);
        }
        self.pids.remove(id);
    }

    /// Fire-and-forget drain of the replaced instance: mark it draining,
    /// wait out the grace period, stop it with a bounded budget, fall
    /// back to a cgroup kill, drop the PID record. Tied to the agent
    /// root token so shutdown collapses the grace period.
    fn spawn_drain(&self, old_kind: EngineKind, old_id: String) {
        let core = Arc::clone(&self.core);
        let pids = Arc::clone(&self.pids);
        let cgroups = self.cgroups.clone();
        let cancel = self.cancel.clone();
        let drain_timeout = self.config.drain_timeout;

        tokio::spawn(async move {
            if let Err(e) = pids.mark_draining(&old_id) {
                debug!(instance = %old_id, "drain marking skipped: {e:#}");
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(drain_timeout) => {}
            }

            let stopped = tokio::time::timeout(STOP_TIMEOUT, core.stop_instance(old_kind, &old_id))
                .await;
            match stopped {
                Ok(Ok(())) => debug!(instance = %old_id, "old instance drained"),
                _ => {
                    warn!(instance = %old_id, "drain stop failed; killing cgroup");
                    if let Some(ref cgroups) = cgroups {
                        if let Err(e) = cgroups.kill(&old_id) {
                            warn!(instance = %old_id, "cgroup kill failed: {e:#}");
                        }
                    }
                }
            }
            if let Some(ref cgroups) = cgroups {
                cgroups.remove(&old_id);
            }
            pids.remove(&old_id);
        });
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
