// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persistent PID records and orphan cleanup.
//!
//! One JSON file per instance under the PID directory survives agent
//! restarts; startup cleanup kills whatever the previous agent left
//! behind so no unsupervised engine keeps serving stale config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::service::direct::{is_alive, terminate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PidStatus {
    Active,
    /// Marked before termination so a crash mid-drain is recognizable.
    Draining,
}

/// On-disk record for one supervised process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PidRecord {
    pub pid: u32,
    pub instance_id: String,
    pub engine_kind: String,
    pub status: PidStatus,
    pub created_at: i64,
    pub ports: Vec<u16>,
}

/// Reads and writes `<dir>/<instance_id>.json` records.
pub struct PidTracker {
    dir: PathBuf,
    orphan_grace: Duration,
}

impl PidTracker {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, orphan_grace: Duration::from_secs(3) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, instance_id: &str) -> PathBuf {
        self.dir.join(format!("{instance_id}.json"))
    }

    /// Persist a record. Called once the process is confirmed alive.
    pub fn write(&self, record: &PidRecord) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.path_for(&record.instance_id);
        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, instance_id: &str) -> anyhow::Result<PidRecord> {
        let path = self.path_for(instance_id);
        let bytes = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&bytes).with_context(|| format!("parsing {}", path.display()))
    }

    /// Flip a record to `draining` ahead of termination.
    pub fn mark_draining(&self, instance_id: &str) -> anyhow::Result<()> {
        let mut record = self.read(instance_id)?;
        record.status = PidStatus::Draining;
        self.write(&record)
    }

    /// Remove a record; a missing file is fine.
    pub fn remove(&self, instance_id: &str) {
        let path = self.path_for(instance_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "removing pid file: {e}");
            }
        }
    }

    /// All records currently on disk.
    pub fn list(&self) -> Vec<PidRecord> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return vec![];
        };
        let mut records = vec![];
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|s| serde_json::from_str::<PidRecord>(&s).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), "unreadable pid record: {e:#}"),
            }
        }
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        records
    }

    /// Kill or forget every recorded process.
    ///
    /// Dead PIDs lose their file; live ones get TERM, a short grace,
    /// then KILL, and then the file is removed. Returns how many records
    /// were processed.
    pub async fn cleanup_orphans(&self) -> usize {
        let records = self.list();
        let count = records.len();
        for record in records {
            if is_alive(record.pid) {
                info!(
                    instance = %record.instance_id,
                    pid = record.pid,
                    "terminating orphaned engine process"
                );
                terminate(record.pid, self.orphan_grace).await;
            }
            self.remove(&record.instance_id);
        }
        count
    }
}

#[cfg(test)]
#[path = "pidfile_tests.rs"]
mod tests;
