// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine capability detection: version probe, build tags, feature flags.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::EngineKind;

/// Outcome of probing one engine binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProbe {
    /// `xray`, `singbox`, or `unknown` when the probe failed.
    pub engine_kind: String,
    pub version: String,
    pub capabilities: Vec<String>,
    pub build_tags: Vec<String>,
}

impl EngineProbe {
    fn unknown() -> Self {
        Self {
            engine_kind: "unknown".to_owned(),
            version: String::new(),
            capabilities: vec![],
            build_tags: vec![],
        }
    }
}

/// Parse `<engine> version` output into a probe result.
///
/// Regexes are deliberately tolerant: version lines differ across builds
/// and distributions, and a probe that fails to match simply yields
/// `unknown` rather than an error.
pub fn parse_version_output(kind: EngineKind, output: &str) -> EngineProbe {
    let version = match kind {
        EngineKind::Xray => capture_version(output, r"(?i)xray[^\d]*(\d+\.\d+\.\d+)"),
        EngineKind::SingBox => capture_version(output, r"(?i)sing-box\s+version\s+v?(\d+\.\d+\.\d+)"),
    };

    let Some(version) = version else {
        return EngineProbe::unknown();
    };

    let build_tags = parse_build_tags(output);
    let capabilities = derive_capabilities(kind, &version, &build_tags);

    EngineProbe {
        engine_kind: kind.as_str().to_owned(),
        version,
        capabilities,
        build_tags,
    }
}

fn capture_version(output: &str, pattern: &str) -> Option<String> {
    let re = Regex::new(pattern).ok()?;
    re.captures(output).and_then(|c| c.get(1)).map(|m| m.as_str().to_owned())
}

fn parse_build_tags(output: &str) -> Vec<String> {
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Tags:") {
            return rest.split(',').map(|t| t.trim().to_owned()).filter(|t| !t.is_empty()).collect();
        }
    }
    vec![]
}

/// Split a dotted version into numeric components, ignoring suffixes.
fn version_triple(version: &str) -> (u64, u64, u64) {
    let mut parts = version.split('.').map(|p| {
        p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().unwrap_or(0)
    });
    (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    )
}

fn at_least(version: &str, major: u64, minor: u64) -> bool {
    let (maj, min, _) = version_triple(version);
    maj > major || (maj == major && min >= minor)
}

/// Feature flags from (a) version thresholds and (b) build-tag substrings.
fn derive_capabilities(kind: EngineKind, version: &str, tags: &[String]) -> Vec<String> {
    let mut caps = vec![];
    match kind {
        EngineKind::Xray => {
            caps.extend(["vmess", "vless", "trojan", "shadowsocks"].map(str::to_owned));
            if at_least(version, 1, 8) {
                caps.push("reality".to_owned());
                caps.push("xtls-vision".to_owned());
            }
        }
        EngineKind::SingBox => {
            caps.extend(["vmess", "vless", "trojan", "shadowsocks"].map(str::to_owned));
            if at_least(version, 1, 8) {
                caps.push("rule-set".to_owned());
            }
            let has = |needle: &str| tags.iter().any(|t| t.contains(needle));
            if has("with_quic") {
                caps.push("hysteria2".to_owned());
                caps.push("tuic".to_owned());
            }
            if has("with_grpc") {
                caps.push("grpc-transport".to_owned());
            }
            if has("with_utls") {
                caps.push("utls".to_owned());
            }
            if has("reality") {
                caps.push("reality".to_owned());
            }
        }
    }
    caps
}

/// Runs `<binary> version` at most once per TTL per engine.
pub struct CapabilityCache {
    ttl: Duration,
    entries: Mutex<HashMap<EngineKind, (Instant, EngineProbe)>>,
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl CapabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    /// Probe an engine, serving a cached result while fresh.
    ///
    /// Never fails: probe errors yield `engine_kind = "unknown"`.
    pub async fn probe(&self, kind: EngineKind, binary: &Path) -> EngineProbe {
        let mut entries = self.entries.lock().await;
        if let Some((at, probe)) = entries.get(&kind) {
            if at.elapsed() < self.ttl {
                return probe.clone();
            }
        }

        let probe = match run_version(binary).await {
            Ok(output) => parse_version_output(kind, &output),
            Err(e) => {
                debug!(engine = %kind, "version probe failed: {e:#}");
                EngineProbe::unknown()
            }
        };
        entries.insert(kind, (Instant::now(), probe.clone()));
        probe
    }
}

async fn run_version(binary: &Path) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(binary).arg("version").output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("version probe timed out"))??;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
#[path = "capability_tests.rs"]
mod tests;
