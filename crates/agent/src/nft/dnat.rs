// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The zero-downtime DNAT table: rendering and atomic replacement.

use tracing::debug;

use super::{Family, Nft, PortMapping, Protocol};

/// Owns the `xboard_proxy` table (two chains: prerouting dstnat, output).
pub struct DnatManager {
    nft: Nft,
    table: String,
}

impl DnatManager {
    pub fn new(nft: Nft, table: impl Into<String>) -> Self {
        Self { nft, table: table.into() }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Render the full-table replacement script for a mapping set.
    ///
    /// The leading `add table` guarantees the `delete table` cannot fail
    /// on a host that has never seen the table; the whole script is one
    /// atomic nft transaction, so readers observe either the old or the
    /// new ruleset, never a mix.
    pub fn render_switch_script(&self, mappings: &[PortMapping]) -> String {
        let mut body = String::new();
        for mapping in mappings {
            for line in render_rule_lines(mapping) {
                body.push_str("        ");
                body.push_str(&line);
                body.push('\n');
            }
        }

        let mut script = String::new();
        script.push_str(&format!("add table inet {}\n", self.table));
        script.push_str(&format!("delete table inet {}\n", self.table));
        script.push_str(&format!("table inet {} {{\n", self.table));
        script.push_str("    chain prerouting {\n");
        script.push_str("        type nat hook prerouting priority dstnat; policy accept;\n");
        script.push_str(&body);
        script.push_str("    }\n");
        script.push_str("    chain output {\n");
        script.push_str("        type nat hook output priority 0; policy accept;\n");
        script.push_str(&body);
        script.push_str("    }\n");
        script.push_str("}\n");
        script
    }

    /// Atomically replace the table contents with `mappings`.
    ///
    /// Callers must hold the [`ApplyLock`]; the lock parameter makes
    /// that explicit at the call site.
    pub async fn switch_atomic(
        &self,
        _guard: &tokio::sync::MutexGuard<'_, ()>,
        mappings: &[PortMapping],
    ) -> anyhow::Result<()> {
        let script = self.render_switch_script(mappings);
        debug!(table = %self.table, rules = mappings.len(), "applying dnat ruleset");
        self.nft.run_script(&script).await
    }

    /// Create the table and chains if missing. Safe to repeat.
    pub async fn ensure_infrastructure(&self) -> anyhow::Result<()> {
        let script = format!(
            "add table inet {table}\n\
             add chain inet {table} prerouting {{ type nat hook prerouting priority dstnat; policy accept; }}\n\
             add chain inet {table} output {{ type nat hook output priority 0; policy accept; }}\n",
            table = self.table,
        );
        match self.nft.run_script(&script).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete the table; a table that never existed is success.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        let script = format!("delete table inet {}\n", self.table);
        match self.nft.run_script(&script).await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such file or directory") => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn available(&self) -> bool {
        self.nft.available().await
    }
}

/// One nft line per concrete `(protocol, family)` of a mapping.
fn render_rule_lines(mapping: &PortMapping) -> Vec<String> {
    let mut lines = vec![];
    for proto in mapping.protocol.expand() {
        let line = match mapping.family {
            Family::V4 => format!(
                "meta nfproto ipv4 {proto} dport {} dnat ip to 127.0.0.1:{}",
                mapping.external_port, mapping.internal_port
            ),
            Family::V6 => format!(
                "meta nfproto ipv6 {proto} dport {} dnat ip6 to [::1]:{}",
                mapping.external_port, mapping.internal_port
            ),
        };
        lines.push(line);
    }
    lines
}

/// Expand a `(protocol=both, both families)` group mapping into concrete
/// rule tuples: one per `(tcp|udp, v4|v6)`.
pub fn expand_group(external_port: u16, internal_port: u16) -> Vec<PortMapping> {
    let mut rules = vec![];
    for protocol in [Protocol::Tcp, Protocol::Udp] {
        for family in [Family::V4, Family::V6] {
            rules.push(PortMapping { external_port, internal_port, protocol, family });
        }
    }
    rules
}

#[cfg(test)]
#[path = "dnat_tests.rs"]
mod tests;
