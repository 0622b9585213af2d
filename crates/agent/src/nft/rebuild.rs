// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reconstruct the live port-mapping set from nftables JSON output.
//!
//! The agent keeps no authoritative copy of the DNAT state; after a
//! restart (or before a switch) it rebuilds the picture from the kernel.

use std::collections::BTreeSet;

use serde_json::Value;

use super::{Family, Nft, PortMapping, Protocol};

/// Rebuilds mapping state by listing the DNAT table.
pub struct StateRebuilder {
    nft: Nft,
    table: String,
}

impl StateRebuilder {
    pub fn new(nft: Nft, table: impl Into<String>) -> Self {
        Self { nft, table: table.into() }
    }

    /// Current mappings. A missing table yields an empty set.
    pub async fn current_mappings(&self) -> anyhow::Result<Vec<PortMapping>> {
        let json = match self.nft.list_table_json(&self.table).await {
            Ok(json) => json,
            Err(e) if e.to_string().contains("No such file or directory") => {
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };
        parse_table_json(&json)
    }

    /// Internal ports already claimed by live rules. The switcher
    /// rejects allocations that would collide with these.
    pub async fn occupied_internal_ports(&self) -> anyhow::Result<BTreeSet<u16>> {
        Ok(self.current_mappings().await?.iter().map(|m| m.internal_port).collect())
    }
}

/// Walk `nft -j` output and recover mapping tuples.
///
/// Both chains carry identical rule bodies, so results are deduplicated.
pub fn parse_table_json(json: &str) -> anyhow::Result<Vec<PortMapping>> {
    let value: Value = serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("parsing nft json listing: {e}"))?;
    let Some(objects) = value.get("nftables").and_then(Value::as_array) else {
        return Ok(vec![]);
    };

    let mut mappings = BTreeSet::new();
    for object in objects {
        let Some(rule) = object.get("rule") else { continue };
        let Some(exprs) = rule.get("expr").and_then(Value::as_array) else { continue };
        if let Some(mapping) = parse_rule_exprs(exprs) {
            mappings.insert(mapping);
        }
    }
    Ok(mappings.into_iter().collect())
}

/// Recover one mapping from a rule expression list, expecting the shape
/// emitted by the DNAT renderer: an nfproto match, a dport match, and a
/// dnat verdict.
fn parse_rule_exprs(exprs: &[Value]) -> Option<PortMapping> {
    let mut family = None;
    let mut protocol = None;
    let mut external_port = None;
    let mut internal_port = None;

    for expr in exprs {
        if let Some(m) = expr.get("match") {
            let left = m.get("left")?;
            if left.pointer("/meta/key").and_then(Value::as_str) == Some("nfproto") {
                family = match m.get("right").and_then(Value::as_str) {
                    Some("ipv4") => Some(Family::V4),
                    Some("ipv6") => Some(Family::V6),
                    _ => None,
                };
            } else if let Some(payload) = left.get("payload") {
                if payload.get("field").and_then(Value::as_str) == Some("dport") {
                    protocol = match payload.get("protocol").and_then(Value::as_str) {
                        Some("tcp") => Some(Protocol::Tcp),
                        Some("udp") => Some(Protocol::Udp),
                        _ => None,
                    };
                    external_port =
                        m.get("right").and_then(Value::as_u64).and_then(|p| u16::try_from(p).ok());
                }
            }
        } else if let Some(dnat) = expr.get("dnat") {
            internal_port =
                dnat.get("port").and_then(Value::as_u64).and_then(|p| u16::try_from(p).ok());
        }
    }

    Some(PortMapping {
        external_port: external_port?,
        internal_port: internal_port?,
        protocol: protocol?,
        family: family?,
    })
}

#[cfg(test)]
#[path = "rebuild_tests.rs"]
mod tests;
