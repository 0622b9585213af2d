// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sing-box-family config parsing and user injection.

use std::path::Path;

use serde_json::{json, Value};
use tracing::debug;

use super::parse::port_of;
use super::{InboundUser, MultiplexDetails, ProtocolDetails, RealityDetails, TlsDetails};

const KNOWN_PROTOCOLS: [&str; 7] =
    ["vmess", "vless", "trojan", "shadowsocks", "hysteria2", "tuic", "naive"];

/// Protocols whose `users[]` entries carry a UUID.
const UUID_PROTOCOLS: [&str; 3] = ["vmess", "vless", "tuic"];

/// Root-shape probe: inbounds with a `type` field.
pub fn probe(value: &Value) -> bool {
    value
        .get("inbounds")
        .and_then(Value::as_array)
        .is_some_and(|inbounds| inbounds.iter().any(|i| i.get("type").is_some()))
}

/// Extract details from every known inbound.
pub fn parse_inbounds(value: &Value) -> Vec<ProtocolDetails> {
    let Some(inbounds) = value.get("inbounds").and_then(Value::as_array) else {
        return vec![];
    };

    let mut details = vec![];
    for inbound in inbounds {
        let Some(protocol) = inbound.get("type").and_then(Value::as_str) else {
            debug!("skipping inbound without type field");
            continue;
        };
        if !KNOWN_PROTOCOLS.contains(&protocol) {
            debug!(protocol, "skipping unknown inbound type");
            continue;
        }
        let Some(port) = inbound.get("listen_port").and_then(port_of) else {
            debug!(protocol, "skipping inbound without usable listen_port");
            continue;
        };

        details.push(ProtocolDetails {
            protocol: protocol.to_owned(),
            tag: inbound.get("tag").and_then(Value::as_str).map(str::to_owned),
            listen: inbound.get("listen").and_then(Value::as_str).map(str::to_owned),
            port,
            transport: inbound
                .pointer("/transport/type")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tls: parse_tls(inbound),
            multiplex: parse_multiplex(inbound),
            users: parse_users(protocol, inbound),
        });
    }
    details
}

fn parse_tls(inbound: &Value) -> TlsDetails {
    let Some(tls) = inbound.get("tls") else {
        return TlsDetails::default();
    };
    let enabled = tls.get("enabled").and_then(Value::as_bool).unwrap_or(false);
    if !enabled {
        return TlsDetails::default();
    }
    let reality = tls.get("reality").and_then(|r| {
        if !r.get("enabled").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let handshake = r.get("handshake").map(|h| {
            let server = h.get("server").and_then(Value::as_str).unwrap_or_default();
            match h.get("server_port").and_then(port_of) {
                Some(port) => format!("{server}:{port}"),
                None => server.to_owned(),
            }
        });
        Some(RealityDetails { handshake })
    });
    TlsDetails {
        enabled: true,
        server_name: tls.get("server_name").and_then(Value::as_str).map(str::to_owned),
        reality,
    }
}

fn parse_multiplex(inbound: &Value) -> MultiplexDetails {
    let Some(mux) = inbound.get("multiplex") else {
        return MultiplexDetails::default();
    };
    let enabled = mux.get("enabled").and_then(Value::as_bool).unwrap_or(false);
    let brutal = mux.get("brutal").filter(|b| {
        b.get("enabled").and_then(Value::as_bool).unwrap_or(false)
    });
    MultiplexDetails {
        enabled,
        brutal_up_mbps: brutal.and_then(|b| b.get("up_mbps")).and_then(Value::as_u64),
        brutal_down_mbps: brutal.and_then(|b| b.get("down_mbps")).and_then(Value::as_u64),
    }
}

fn parse_users(protocol: &str, inbound: &Value) -> Vec<InboundUser> {
    let Some(users) = inbound.get("users").and_then(Value::as_array) else {
        return vec![];
    };
    users
        .iter()
        .map(|user| InboundUser {
            uuid: user.get("uuid").and_then(Value::as_str).map(str::to_owned),
            email: user.get("name").and_then(Value::as_str).map(str::to_owned),
            password: if UUID_PROTOCOLS.contains(&protocol) && protocol != "tuic" {
                None
            } else {
                user.get("password").and_then(Value::as_str).map(str::to_owned)
            },
        })
        .collect()
}

/// Replace `users[]` on every UUID-bearing inbound with the panel user
/// set. Returns the number of inbounds touched.
pub fn inject_users(config: &mut Value, users: &[(String, String)]) -> usize {
    let Some(inbounds) = config.get_mut("inbounds").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut touched = 0;
    for inbound in inbounds {
        let Some(protocol) = inbound.get("type").and_then(Value::as_str).map(str::to_owned)
        else {
            continue;
        };
        if !UUID_PROTOCOLS.contains(&protocol.as_str()) {
            debug!(protocol = %protocol, "user injection skips inbound type");
            continue;
        }
        let rendered: Vec<Value> = users
            .iter()
            .map(|(uuid, email)| json!({ "name": email, "uuid": uuid }))
            .collect();
        if let Some(obj) = inbound.as_object_mut() {
            obj.insert("users".to_owned(), Value::Array(rendered));
            touched += 1;
        }
    }
    touched
}

/// Arguments for config validation: `sing-box check -c <path>`.
pub fn validate_args(config_path: &Path) -> Vec<String> {
    vec!["check".to_owned(), "-c".to_owned(), config_path.to_string_lossy().into_owned()]
}

/// Arguments for running the engine directly: `sing-box run -c <path>`.
pub fn run_args(config_path: &Path) -> Vec<String> {
    vec!["run".to_owned(), "-c".to_owned(), config_path.to_string_lossy().into_owned()]
}

#[cfg(test)]
#[path = "singbox_tests.rs"]
mod tests;
