// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! cgroup v2 placement: one directory per instance so post-stop cleanup
//! can kill everything the engine forked, not just the main PID.

use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use tracing::{debug, warn};

use crate::service::direct::signal_pid;

/// Manages per-instance cgroups under a configured v2 base directory.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    base: PathBuf,
}

impl CgroupManager {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// cgroup v2 is usable when the unified hierarchy is mounted and the
    /// base directory can exist.
    pub fn available(&self) -> bool {
        if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
            return false;
        }
        std::fs::create_dir_all(&self.base).is_ok()
    }

    fn instance_dir(&self, instance_id: &str) -> PathBuf {
        self.base.join(instance_id)
    }

    /// Create the instance cgroup and move `pid` into it.
    pub fn add_pid(&self, instance_id: &str, pid: u32) -> anyhow::Result<()> {
        let dir = self.instance_dir(instance_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::anyhow!("creating cgroup {}: {e}", dir.display()))?;
        std::fs::write(dir.join("cgroup.procs"), pid.to_string())
            .map_err(|e| anyhow::anyhow!("moving pid {pid} into {}: {e}", dir.display()))?;
        debug!(instance = instance_id, pid, "pid placed in cgroup");
        Ok(())
    }

    /// PIDs currently in the instance cgroup.
    pub fn procs(&self, instance_id: &str) -> Vec<u32> {
        let path = self.instance_dir(instance_id).join("cgroup.procs");
        std::fs::read_to_string(path)
            .map(|s| s.lines().filter_map(|l| l.trim().parse().ok()).collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self, instance_id: &str) -> bool {
        self.procs(instance_id).is_empty()
    }

    /// Kill the whole cgroup: `cgroup.kill` when the kernel offers it,
    /// otherwise SIGKILL each member of `cgroup.procs`.
    pub fn kill(&self, instance_id: &str) -> anyhow::Result<()> {
        let dir = self.instance_dir(instance_id);
        let kill_file = dir.join("cgroup.kill");
        if kill_file.exists() {
            return std::fs::write(&kill_file, "1")
                .map_err(|e| anyhow::anyhow!("writing {}: {e}", kill_file.display()));
        }
        for pid in self.procs(instance_id) {
            if let Err(e) = signal_pid(pid, Signal::SIGKILL) {
                warn!(instance = instance_id, pid, "cgroup member kill failed: {e:#}");
            }
        }
        Ok(())
    }

    /// Remove the instance directory once it is empty. ENOENT is fine.
    pub fn remove(&self, instance_id: &str) {
        let dir = self.instance_dir(instance_id);
        if let Err(e) = std::fs::remove_dir(&dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(dir = %dir.display(), "cgroup removal deferred: {e}");
            }
        }
    }
}
