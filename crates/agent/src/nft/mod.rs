// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! nftables plumbing shared by the DNAT switcher and the forwarding
//! applier: the script runner, the port-mapping model, and the single
//! agent-wide apply mutex.

pub mod dnat;
pub mod forward;
pub mod rebuild;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Protocol dimension of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Both,
}

impl Protocol {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "both" => Ok(Self::Both),
            other => anyhow::bail!("unknown protocol: {other}"),
        }
    }

    /// Concrete wire protocols this value expands to.
    pub fn expand(self) -> &'static [&'static str] {
        match self {
            Self::Tcp => &["tcp"],
            Self::Udp => &["udp"],
            Self::Both => &["tcp", "udp"],
        }
    }
}

/// Address family dimension of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

/// One `(external, internal, protocol, family)` tuple. Derived state:
/// always reconstructable from the live ruleset, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub protocol: Protocol,
    pub family: Family,
}

const NFT_TIMEOUT: Duration = Duration::from_secs(10);

/// Thin wrapper around the host `nft` binary.
#[derive(Debug, Clone)]
pub struct Nft {
    bin: PathBuf,
}

impl Nft {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    /// Whether nft is usable on this host.
    pub async fn available(&self) -> bool {
        self.run(&["--version"], None).await.is_ok()
    }

    /// Syntax-check a script without applying (`nft -c -f -`).
    pub async fn check_script(&self, script: &str) -> anyhow::Result<()> {
        self.run(&["-c", "-f", "-"], Some(script)).await.map(|_| ())
    }

    /// Apply a script from stdin (`nft -f -`). One script is one atomic
    /// transaction per nft semantics.
    pub async fn run_script(&self, script: &str) -> anyhow::Result<()> {
        self.run(&["-f", "-"], Some(script)).await.map(|_| ())
    }

    /// JSON listing of one table.
    pub async fn list_table_json(&self, table: &str) -> anyhow::Result<String> {
        self.run(&["-j", "list", "table", "inet", table], None).await
    }

    async fn run(&self, args: &[&str], stdin: Option<&str>) -> anyhow::Result<String> {
        let mut command = tokio::process::Command::new(&self.bin);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let run = async {
            let mut child = command
                .spawn()
                .with_context(|| format!("spawning {}", self.bin.display()))?;
            if let (Some(mut pipe), Some(script)) = (child.stdin.take(), stdin) {
                pipe.write_all(script.as_bytes()).await?;
                drop(pipe);
            }
            let output = child.wait_with_output().await?;
            if !output.status.success() {
                anyhow::bail!(
                    "nft {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        };

        tokio::time::timeout(NFT_TIMEOUT, run)
            .await
            .map_err(|_| anyhow::anyhow!("nft {} timed out", args.join(" ")))?
    }
}

/// The single-writer mutex over the host ruleset. Zero-downtime swaps
/// and forwarding applies both take it, so their transactions never
/// interleave.
#[derive(Default)]
pub struct ApplyLock {
    lock: Mutex<()>,
}

impl ApplyLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}
