// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core manager: the adapter set plus the cold (stop-then-start) switch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::adapter::{EngineAdapter, TrafficDelta};
use crate::engine::registry::InstanceRegistry;
use crate::engine::{parse, CoreInstance, EngineKind};

/// Time to let the kernel release listening ports between stop and start
/// on the cold path.
const PORT_SETTLE: Duration = Duration::from_millis(300);

/// Synthesize an instance id: `<engine>-<nanos>`.
pub fn new_instance_id(kind: EngineKind) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{kind}-{nanos}")
}

/// Owns the engine adapters and the shared instance registry.
pub struct CoreManager {
    adapters: HashMap<EngineKind, Arc<EngineAdapter>>,
    registry: Arc<InstanceRegistry>,
}

impl CoreManager {
    pub fn new(registry: Arc<InstanceRegistry>) -> Self {
        Self { adapters: HashMap::new(), registry }
    }

    /// Register an engine adapter. New engines plug in here.
    pub fn register(&mut self, adapter: Arc<EngineAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn adapter(&self, kind: EngineKind) -> anyhow::Result<Arc<EngineAdapter>> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no adapter registered for engine {kind}"))
    }

    pub fn registry(&self) -> Arc<InstanceRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<EngineKind> = self.adapters.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub async fn instances(&self) -> Vec<CoreInstance> {
        self.registry.list().await
    }

    /// Per-user traffic deltas merged across all engines.
    pub async fn collect_traffic(&self) -> Vec<TrafficDelta> {
        let mut merged: std::collections::BTreeMap<i64, (u64, u64)> = Default::default();
        for kind in self.kinds() {
            let Ok(adapter) = self.adapter(kind) else { continue };
            match adapter.collect_traffic().await {
                Ok(deltas) => {
                    for d in deltas {
                        let entry = merged.entry(d.user_id).or_insert((0, 0));
                        entry.0 += d.upload;
                        entry.1 += d.download;
                    }
                }
                Err(e) => warn!(engine = %kind, "traffic collection failed: {e:#}"),
            }
        }
        merged
            .into_iter()
            .map(|(user_id, (upload, download))| TrafficDelta { user_id, upload, download })
            .collect()
    }

    /// Cold switch: stop the old instance, settle, start the new one.
    ///
    /// Used when zero-downtime is not requested; callers pick this or the
    /// zero-downtime switcher explicitly, never a silent fallback. On
    /// start failure the backup instance is restarted from its snapshot;
    /// a rollback failure is fatal.
    pub async fn switch_core(
        &self,
        from_instance_id: Option<&str>,
        to: EngineKind,
        config_json: &str,
        listen_ports: &[u16],
    ) -> anyhow::Result<String> {
        let adapter = self.adapter(to)?;
        parse::validate(config_json)?;
        if listen_ports.is_empty() {
            anyhow::bail!("switch requires at least one listen port");
        }

        // Snapshot the backup before touching anything.
        let backup = match from_instance_id {
            Some(id) => self.registry.get(id).await,
            None => None,
        };

        if let Some(ref old) = backup {
            let old_adapter = self.adapter(old.engine_kind)?;
            old_adapter.stop(&old.id).await?;
            tokio::time::sleep(PORT_SETTLE).await;
        }

        let new_id = new_instance_id(to);
        let source = adapter.config().config_dir.join(format!("{new_id}.panel.json"));
        if let Some(parent) = source.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&source, config_json)?;

        match adapter.start(&new_id, &source, listen_ports).await {
            Ok(_) => {
                info!(instance = %new_id, engine = %to, "cold switch complete");
                Ok(new_id)
            }
            Err(start_err) => {
                let Some(old) = backup else {
                    return Err(start_err);
                };
                warn!(
                    instance = %new_id,
                    "cold switch failed, restarting backup {}: {start_err:#}",
                    old.id
                );
                let old_adapter = self.adapter(old.engine_kind)?;
                let config_path = old.config_path.clone();
                if let Err(rollback_err) =
                    old_adapter.start(&old.id, &config_path, &old.listen_ports).await
                {
                    error!(
                        instance = %old.id,
                        "rollback failed, external ports are unserved: {rollback_err:#}"
                    );
                    anyhow::bail!(
                        "switch failed and rollback failed: start: {start_err:#}; rollback: {rollback_err:#}"
                    );
                }
                Err(start_err)
            }
        }
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
