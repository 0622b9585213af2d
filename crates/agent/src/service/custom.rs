// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::HashMap;

use tracing::warn;

use super::{run_command, ServiceStatus};

/// User-defined command backend.
///
/// Commands are shell lines with `{service}` / `{{service}}` template
/// tokens. Operations without a configured command fail except `reload`,
/// which falls back to the restart command.
pub struct Custom {
    commands: HashMap<String, String>,
    allow_kill_fallback: bool,
}

impl Custom {
    pub fn new(commands: HashMap<String, String>, allow_kill_fallback: bool) -> Self {
        Self { commands, allow_kill_fallback }
    }

    fn render(&self, op: &str, service: &str) -> anyhow::Result<String> {
        let template = self
            .commands
            .get(op)
            .ok_or_else(|| anyhow::anyhow!("no custom {op} command configured"))?;
        Ok(substitute(template, service))
    }

    async fn run_op(&self, op: &str, service: &str) -> anyhow::Result<()> {
        let command = self.render(op, service)?;
        let out = run_command("sh", &["-c", &command]).await?;
        if !out.status_ok {
            anyhow::bail!("custom {op} command failed: {}", out.stderr.trim());
        }
        Ok(())
    }

    pub async fn start(&self, service: &str) -> anyhow::Result<()> {
        self.run_op("start", service).await
    }

    /// Stop; when the command fails and the kill fallback is explicitly
    /// enabled, `pkill -f` by staged-config name as a coarse last resort.
    pub async fn stop(&self, service: &str) -> anyhow::Result<()> {
        match self.run_op("stop", service).await {
            Ok(()) => Ok(()),
            Err(e) if self.allow_kill_fallback => {
                warn!(service, "custom stop failed, trying pkill fallback: {e:#}");
                let pattern = format!("{service}.json");
                let out = run_command("pkill", &["-f", &pattern]).await?;
                // pkill exits 1 when nothing matched; the process is gone
                // either way.
                let _ = out;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn restart(&self, service: &str) -> anyhow::Result<()> {
        if self.commands.contains_key("restart") {
            return self.run_op("restart", service).await;
        }
        self.stop(service).await?;
        self.start(service).await
    }

    pub async fn reload_or_restart(&self, service: &str) -> anyhow::Result<()> {
        if self.commands.contains_key("reload") {
            return self.run_op("reload", service).await;
        }
        self.restart(service).await
    }

    pub async fn status(&self, service: &str) -> anyhow::Result<ServiceStatus> {
        match self.render("status", service) {
            Ok(command) => {
                let out = run_command("sh", &["-c", &command]).await?;
                Ok(ServiceStatus { running: out.status_ok, pid: None })
            }
            // No status command: assume stopped rather than guessing.
            Err(_) => Ok(ServiceStatus::STOPPED),
        }
    }

    pub async fn enable(&self, service: &str) -> anyhow::Result<()> {
        self.run_op("enable", service).await
    }

    pub async fn disable(&self, service: &str) -> anyhow::Result<()> {
        self.run_op("disable", service).await
    }
}

/// Replace both `{{service}}` and `{service}` tokens.
///
/// The double-brace form is substituted first so it never leaves a stray
/// brace pair behind.
fn substitute(template: &str, service: &str) -> String {
    template.replace("{{service}}", service).replace("{service}", service)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[yare::parameterized(
        single    = { "systemctl start {service}", "systemctl start xray" },
        double    = { "rc-service {{service}} start", "rc-service xray start" },
        both      = { "echo {service} {{service}}", "echo xray xray" },
        untouched = { "echo plain", "echo plain" },
    )]
    fn token_substitution(template: &str, expected: &str) {
        assert_eq!(substitute(template, "xray"), expected);
    }

    #[tokio::test]
    async fn missing_command_fails() {
        let custom = Custom::new(HashMap::new(), false);
        assert!(custom.start("xray").await.is_err());
    }

    #[tokio::test]
    async fn status_without_command_reports_stopped() -> anyhow::Result<()> {
        let custom = Custom::new(HashMap::new(), false);
        let st = custom.status("xray").await?;
        assert!(!st.running);
        Ok(())
    }

    #[tokio::test]
    async fn commands_run_through_shell() -> anyhow::Result<()> {
        let mut commands = HashMap::new();
        commands.insert("start".to_owned(), "true {service}".to_owned());
        commands.insert("status".to_owned(), "true".to_owned());
        let custom = Custom::new(commands, false);
        custom.start("xray").await?;
        assert!(custom.status("xray").await?.running);
        Ok(())
    }
}
