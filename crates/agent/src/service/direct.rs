// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ServiceStatus;

/// What to exec for a service handled by the direct backend.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub pid_file: PathBuf,
}

struct Entry {
    spec: ProcessSpec,
    /// Present while this agent spawned the child; used for reaping.
    child: Option<tokio::process::Child>,
}

/// Direct-process fallback used when no init system is detected.
///
/// Engine adapters register a [`ProcessSpec`] per service before start.
/// Stop is SIGTERM, then SIGKILL after a grace period; reload is SIGHUP;
/// liveness is signal 0.
pub struct Direct {
    pid_dir: PathBuf,
    entries: Mutex<HashMap<String, Entry>>,
    term_grace: Duration,
}

impl Direct {
    pub fn new(pid_dir: PathBuf) -> Self {
        Self { pid_dir, entries: Mutex::new(HashMap::new()), term_grace: Duration::from_secs(3) }
    }

    /// Register (or replace) the process spec for a service.
    pub async fn register(&self, service: &str, binary: PathBuf, args: Vec<String>) {
        let pid_file = self.pid_dir.join(format!("{service}.pid"));
        let mut entries = self.entries.lock().await;
        entries.insert(service.to_owned(), Entry {
            spec: ProcessSpec { binary, args, pid_file },
            child: None,
        });
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(service)
            .ok_or_else(|| anyhow::anyhow!("direct backend: no process spec for {service}"))?;

        if let Some(pid) = read_pid_file(&entry.spec.pid_file) {
            if is_alive(pid) {
                debug!(service, pid, "already running");
                return Ok(());
            }
        }

        let child = tokio::process::Command::new(&entry.spec.binary)
            .args(&entry.spec.args)
            .process_group(0)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!("spawning {}: {e}", entry.spec.binary.display()))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("spawned {service} exited before pid was read"))?;
        if let Some(parent) = entry.spec.pid_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&entry.spec.pid_file, pid.to_string())?;
        entry.child = Some(child);
        debug!(service, pid, "direct process started");
        Ok(())
    }

    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(service)
            .ok_or_else(|| anyhow::anyhow!("direct backend: no process spec for {service}"))?;

        let Some(pid) = entry.child.as_ref().and_then(|c| c.id()).or_else(|| read_pid_file(&entry.spec.pid_file))
        else {
            return Ok(());
        };

        terminate(pid, self.term_grace).await;

        // Reap if the child was ours.
        if let Some(mut child) = entry.child.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
        }
        remove_pid_file(&entry.spec.pid_file);
        Ok(())
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        self.stop(service).await?;
        self.start(service).await
    }

    pub async fn reload(&self, service: &str) -> anyhow::Result<()> {
        let entries = self.entries.lock().await;
        let entry = entries
            .get(service)
            .ok_or_else(|| anyhow::anyhow!("direct backend: no process spec for {service}"))?;
        let pid = entry
            .child
            .as_ref()
            .and_then(|c| c.id())
            .or_else(|| read_pid_file(&entry.spec.pid_file))
            .ok_or_else(|| anyhow::anyhow!("{service} is not running"))?;
        signal_pid(pid, Signal::SIGHUP)
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        let entries = self.entries.lock().await;
        let Some(entry) = entries.get(service) else {
            return Ok(ServiceStatus::STOPPED);
        };
        let pid = entry.child.as_ref().and_then(|c| c.id()).or_else(|| read_pid_file(&entry.spec.pid_file));
        match pid {
            Some(pid) if is_alive(pid) => Ok(ServiceStatus { running: true, pid: Some(pid) }),
            _ => Ok(ServiceStatus::STOPPED),
        }
    }
}

/// Liveness probe via signal 0.
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid_i32) = i32::try_from(pid) else {
        return false;
    };
    signal::kill(Pid::from_raw(pid_i32), None).is_ok()
}

/// Send a signal, treating ESRCH as "already gone".
pub fn signal_pid(pid: u32, sig: Signal) -> anyhow::Result<()> {
    let pid_i32 = i32::try_from(pid).map_err(|_| anyhow::anyhow!("pid {pid} out of range"))?;
    match signal::kill(Pid::from_raw(pid_i32), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(anyhow::anyhow!("kill({pid}, {sig}): {e}")),
    }
}

/// SIGTERM, poll for exit within `grace`, then SIGKILL.
pub async fn terminate(pid: u32, grace: Duration) {
    if signal_pid(pid, Signal::SIGTERM).is_err() {
        warn!(pid, "SIGTERM failed");
    }
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if !is_alive(pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    if is_alive(pid) {
        let _ = signal_pid(pid, Signal::SIGKILL);
    }
}

fn read_pid_file(path: &std::path::Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_pid_file(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "removing pid file: {e}");
        }
    }
}

#[cfg(test)]
#[path = "direct_tests.rs"]
mod tests;
