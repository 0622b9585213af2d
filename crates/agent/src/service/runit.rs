// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::{Path, PathBuf};

use regex::Regex;

use super::{run_checked, run_command, ServiceStatus};

const DEFAULT_SERVICE_DIRS: [&str; 2] = ["/var/service", "/etc/service"];

/// runit backend driving `sv` against a service directory.
pub struct Runit {
    service_dir: PathBuf,
}

impl Runit {
    pub fn new(service_dir: Option<PathBuf>) -> Self {
        let service_dir = service_dir.unwrap_or_else(|| {
            DEFAULT_SERVICE_DIRS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_dir())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVICE_DIRS[0]))
        });
        Self { service_dir }
    }

    pub fn present(service_dir: Option<&Path>) -> bool {
        match service_dir {
            Some(dir) => dir.is_dir(),
            None => DEFAULT_SERVICE_DIRS.iter().any(|p| Path::new(p).is_dir()),
        }
    }

    fn unit(&self, service: &str) -> String {
        self.service_dir.join(service).to_string_lossy().into_owned()
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        run_checked("sv", &["up", &self.unit(service)]).await
    }

    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        run_checked("sv", &["down", &self.unit(service)]).await
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        run_checked("sv", &["restart", &self.unit(service)]).await
    }

    pub async fn reload(&self, service: &str) -> anyhow::Result<()> {
        run_checked("sv", &["hup", &self.unit(service)]).await
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        let out = run_command("sv", &["status", &self.unit(service)]).await?;
        Ok(parse_sv_status(&out.stdout))
    }

    /// Enabling under runit is linking the service dir into the scan dir.
    pub async fn enable(&self, service: &str) -> anyhow::Result<()> {
        let source = PathBuf::from("/etc/sv").join(service);
        let target = self.service_dir.join(service);
        if target.exists() {
            return Ok(());
        }
        std::os::unix::fs::symlink(&source, &target).map_err(|e| {
            anyhow::anyhow!("linking {} -> {}: {e}", source.display(), target.display())
        })
    }

    pub async fn disable(&self, service: &str) -> anyhow::Result<()> {
        let target = self.service_dir.join(service);
        match std::fs::remove_file(&target) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(anyhow::anyhow!("unlinking {}: {e}", target.display()))
            }
            _ => Ok(()),
        }
    }
}

/// Parse `sv status` output, e.g. `run: /var/service/xray: (pid 1234) 56s`.
fn parse_sv_status(output: &str) -> ServiceStatus {
    if !output.starts_with("run:") {
        return ServiceStatus::STOPPED;
    }
    let pid = Regex::new(r"\(pid (\d+)\)")
        .ok()
        .and_then(|re| re.captures(output))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    ServiceStatus { running: true, pid }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sv_status_parses_running() {
        let st = parse_sv_status("run: /var/service/xray: (pid 1234) 56s\n");
        assert!(st.running);
        assert_eq!(st.pid, Some(1234));
    }

    #[test]
    fn sv_status_parses_down() {
        let st = parse_sv_status("down: /var/service/xray: 2s, normally up\n");
        assert!(!st.running);
        assert_eq!(st.pid, None);
    }
}
