// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Config patching for internal-port moves.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::engine::parse;

/// Rewrite every inbound whose port appears in `mapping`: listen becomes
/// `::` and the port field moves to the allocated internal port. Fields
/// the patcher does not understand pass through untouched.
///
/// Both `listen_port` (sing-box family) and `port` (xray family) are
/// recognized; whichever the inbound already uses is the one rewritten.
pub fn patch_internal_ports(
    config_text: &str,
    mapping: &BTreeMap<u16, u16>,
) -> anyhow::Result<String> {
    let mut value = parse::validate(config_text)?;

    if let Some(inbounds) = value.get_mut("inbounds").and_then(Value::as_array_mut) {
        for inbound in inbounds {
            patch_inbound(inbound, mapping);
        }
    }

    Ok(serde_json::to_string_pretty(&value)?)
}

fn patch_inbound(inbound: &mut Value, mapping: &BTreeMap<u16, u16>) {
    let port_key = if inbound.get("listen_port").is_some() {
        "listen_port"
    } else if inbound.get("port").is_some() {
        "port"
    } else {
        return;
    };

    let Some(external) = inbound.get(port_key).and_then(parse::port_of) else {
        return;
    };
    let Some(&internal) = mapping.get(&external) else {
        return;
    };

    if let Some(obj) = inbound.as_object_mut() {
        obj.insert("listen".to_owned(), json!("::"));
        obj.insert(port_key.to_owned(), json!(internal));
    }
}

#[cfg(test)]
#[path = "patch_tests.rs"]
mod tests;
