// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Versioned host packet-forwarding rules: a second nftables table,
//! replaced wholesale on every accepted version.

use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

use super::{ApplyLock, Nft, Protocol};

/// One forwarding rule as delivered by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRule {
    pub id: i64,
    pub listen_port: u16,
    pub target_address: String,
    pub target_port: u16,
    pub protocol: Protocol,
    pub priority: i32,
    pub enabled: bool,
}

/// Applies forwarding rule sets and tracks the last accepted version.
///
/// The stored version only advances on a fully successful apply, so a
/// failed tick retries the same version on the next pull.
pub struct ForwardingApplier {
    nft: Nft,
    table: String,
    version: i64,
}

impl ForwardingApplier {
    pub fn new(nft: Nft, table: impl Into<String>) -> Self {
        Self { nft, table: table.into(), version: 0 }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub async fn nft_available(&self) -> bool {
        self.nft.available().await
    }

    /// Render the replacement script for a rule set.
    ///
    /// Rules sort by `(priority, id)` so equal inputs always produce an
    /// identical script; disabled rules are omitted entirely.
    pub fn render_script(&self, rules: &[ForwardingRule]) -> String {
        let mut ordered: Vec<&ForwardingRule> = rules.iter().filter(|r| r.enabled).collect();
        ordered.sort_by_key(|r| (r.priority, r.id));

        let mut dnat_body = String::new();
        let mut snat_body = String::new();
        for rule in ordered {
            let Some(target) = TargetAddr::parse(&rule.target_address) else {
                warn!(rule = rule.id, target = %rule.target_address,
                      "skipping rule with unparseable target address");
                continue;
            };
            for proto in rule.protocol.expand() {
                dnat_body.push_str(&format!(
                    "        {} {proto} dport {} dnat {} to {}:{}\n",
                    target.nfproto_match(),
                    rule.listen_port,
                    target.dnat_keyword(),
                    target.rendered(),
                    rule.target_port,
                ));
                snat_body.push_str(&format!(
                    "        {} daddr {} {proto} dport {} masquerade\n",
                    target.daddr_keyword(),
                    target.rendered(),
                    rule.target_port,
                ));
            }
        }

        let mut script = String::new();
        script.push_str(&format!("add table inet {}\n", self.table));
        script.push_str(&format!("delete table inet {}\n", self.table));
        script.push_str(&format!("table inet {} {{\n", self.table));
        script.push_str("    chain prerouting {\n");
        script.push_str("        type nat hook prerouting priority dstnat; policy accept;\n");
        script.push_str(&dnat_body);
        script.push_str("    }\n");
        script.push_str("    chain postrouting {\n");
        script.push_str("        type nat hook postrouting priority srcnat; policy accept;\n");
        script.push_str(&snat_body);
        script.push_str("    }\n");
        script.push_str("}\n");
        script
    }

    /// Validate-then-apply a rule set under the shared nft lock. The
    /// version is recorded only after the real apply succeeds.
    pub async fn apply(
        &mut self,
        lock: &ApplyLock,
        rules: &[ForwardingRule],
        version: i64,
    ) -> anyhow::Result<()> {
        let script = self.render_script(rules);
        let _guard = lock.acquire().await;
        self.nft.check_script(&script).await?;
        self.nft.run_script(&script).await?;
        self.version = version;
        debug!(table = %self.table, version, "forwarding ruleset applied");
        Ok(())
    }
}

/// A forwarding target address with its family-specific nft spellings.
enum TargetAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl TargetAddr {
    fn parse(address: &str) -> Option<Self> {
        if let Ok(v4) = address.parse::<Ipv4Addr>() {
            return Some(Self::V4(v4));
        }
        address.parse::<Ipv6Addr>().ok().map(Self::V6)
    }

    fn nfproto_match(&self) -> &'static str {
        match self {
            Self::V4(_) => "meta nfproto ipv4",
            Self::V6(_) => "meta nfproto ipv6",
        }
    }

    fn dnat_keyword(&self) -> &'static str {
        match self {
            Self::V4(_) => "ip",
            Self::V6(_) => "ip6",
        }
    }

    fn daddr_keyword(&self) -> &'static str {
        match self {
            Self::V4(_) => "ip",
            Self::V6(_) => "ip6",
        }
    }

    fn rendered(&self) -> String {
        match self {
            Self::V4(addr) => addr.to_string(),
            Self::V6(addr) => format!("[{addr}]"),
        }
    }
}

#[cfg(test)]
#[path = "forward_tests.rs"]
mod tests;
