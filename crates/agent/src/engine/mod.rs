// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod adapter;
pub mod inject;
pub mod manager;
pub mod parse;
pub mod registry;
pub mod singbox;
pub mod xray;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Supported proxy-core engines. A closed set; adding an engine means
/// adding a variant and registering its adapter with the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Xray,
    #[serde(rename = "singbox")]
    SingBox,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Xray => "xray",
            Self::SingBox => "singbox",
        }
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "xray" => Ok(Self::Xray),
            "singbox" | "sing-box" => Ok(Self::SingBox),
            other => anyhow::bail!("unknown engine kind: {other}"),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a supervised core process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }
}

/// One supervised proxy-core process.
///
/// Records are cloned on every read across the registry lock boundary;
/// no caller holds a reference into the registry map.
#[derive(Debug, Clone)]
pub struct CoreInstance {
    pub id: String,
    pub engine_kind: EngineKind,
    pub state: InstanceState,
    /// Externally-advertised ports, authoritative from the panel.
    pub listen_ports: Vec<u16>,
    pub config_path: PathBuf,
    /// Hex digest of the config bytes at the moment of a successful start.
    pub config_hash: String,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub last_error: Option<String>,
}

impl CoreInstance {
    pub fn new(id: impl Into<String>, engine_kind: EngineKind) -> Self {
        Self {
            id: id.into(),
            engine_kind,
            state: InstanceState::Stopped,
            listen_ports: vec![],
            config_path: PathBuf::new(),
            config_hash: String::new(),
            pid: None,
            started_at: None,
            last_error: None,
        }
    }
}

/// A user attached to an inbound. Passwords stay local; only UUID-bearing
/// identities propagate upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InboundUser {
    pub uuid: Option<String>,
    pub email: Option<String>,
    /// Present for password-bearing protocols; never reported upstream.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

/// TLS posture of an inbound, parsed as opaque configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TlsDetails {
    pub enabled: bool,
    pub server_name: Option<String>,
    pub reality: Option<RealityDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealityDetails {
    /// Handshake target, e.g. `www.example.com:443`.
    pub handshake: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiplexDetails {
    pub enabled: bool,
    /// TCP Brutal bandwidth in Mbps when configured.
    pub brutal_up_mbps: Option<u64>,
    pub brutal_down_mbps: Option<u64>,
}

/// Everything the agent extracts from one inbound definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolDetails {
    pub protocol: String,
    pub tag: Option<String>,
    pub listen: Option<String>,
    pub port: u16,
    pub transport: Option<String>,
    pub tls: TlsDetails,
    pub multiplex: MultiplexDetails,
    pub users: Vec<InboundUser>,
}

/// Hex digest of config bytes: the first 128 bits of SHA-256.
pub fn config_digest(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(32);
    for b in &digest[..16] {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_128_bit_hex() {
        let d = config_digest(b"{}");
        assert_eq!(d.len(), 32);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(d, config_digest(b"{}"));
        assert_ne!(d, config_digest(b"{ }"));
    }

    #[test]
    fn engine_kind_round_trips() -> anyhow::Result<()> {
        assert_eq!(EngineKind::parse("xray")?, EngineKind::Xray);
        assert_eq!(EngineKind::parse("sing-box")?, EngineKind::SingBox);
        assert_eq!(EngineKind::parse("SINGBOX")?, EngineKind::SingBox);
        assert!(EngineKind::parse("v2ray").is_err());
        Ok(())
    }
}
