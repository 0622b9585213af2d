// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Xray-family config parsing and user injection.

use std::path::Path;

use serde_json::{json, Value};
use tracing::debug;

use super::parse::port_of;
use super::{InboundUser, MultiplexDetails, ProtocolDetails, RealityDetails, TlsDetails};

/// Inbound protocols the agent understands. Anything else is skipped.
const KNOWN_PROTOCOLS: [&str; 6] =
    ["vmess", "vless", "trojan", "shadowsocks", "socks", "http"];

/// Protocols whose users live under `settings.clients` and carry UUIDs.
const UUID_PROTOCOLS: [&str; 2] = ["vmess", "vless"];

/// Root-shape probe: inbounds with a `protocol` field, or the `api` /
/// `policy` roots only xray-family configs carry.
pub fn probe(value: &Value) -> bool {
    if value.get("api").is_some() || value.get("policy").is_some() {
        return true;
    }
    value
        .get("inbounds")
        .and_then(Value::as_array)
        .is_some_and(|inbounds| inbounds.iter().any(|i| i.get("protocol").is_some()))
}

/// Extract details from every known inbound.
pub fn parse_inbounds(value: &Value) -> Vec<ProtocolDetails> {
    let Some(inbounds) = value.get("inbounds").and_then(Value::as_array) else {
        return vec![];
    };

    let mut details = vec![];
    for inbound in inbounds {
        let Some(protocol) = inbound.get("protocol").and_then(Value::as_str) else {
            debug!("skipping inbound without protocol field");
            continue;
        };
        if !KNOWN_PROTOCOLS.contains(&protocol) {
            debug!(protocol, "skipping unknown inbound type");
            continue;
        }
        let Some(port) = inbound.get("port").and_then(port_of) else {
            debug!(protocol, "skipping inbound without usable port");
            continue;
        };

        details.push(ProtocolDetails {
            protocol: protocol.to_owned(),
            tag: inbound.get("tag").and_then(Value::as_str).map(str::to_owned),
            listen: inbound.get("listen").and_then(Value::as_str).map(str::to_owned),
            port,
            transport: inbound
                .pointer("/streamSettings/network")
                .and_then(Value::as_str)
                .map(str::to_owned),
            tls: parse_tls(inbound),
            // Mux is negotiated client-side in the xray family.
            multiplex: MultiplexDetails::default(),
            users: parse_users(protocol, inbound),
        });
    }
    details
}

fn parse_tls(inbound: &Value) -> TlsDetails {
    let security = inbound.pointer("/streamSettings/security").and_then(Value::as_str);
    match security {
        Some("tls") => TlsDetails {
            enabled: true,
            server_name: inbound
                .pointer("/streamSettings/tlsSettings/serverName")
                .and_then(Value::as_str)
                .map(str::to_owned),
            reality: None,
        },
        Some("reality") => {
            let settings = inbound.pointer("/streamSettings/realitySettings");
            TlsDetails {
                enabled: true,
                server_name: settings
                    .and_then(|s| s.get("serverNames"))
                    .and_then(Value::as_array)
                    .and_then(|names| names.first())
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                reality: Some(RealityDetails {
                    handshake: settings
                        .and_then(|s| s.get("dest").or_else(|| s.get("target")))
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                }),
            }
        }
        _ => TlsDetails::default(),
    }
}

fn parse_users(protocol: &str, inbound: &Value) -> Vec<InboundUser> {
    let Some(clients) = inbound.pointer("/settings/clients").and_then(Value::as_array) else {
        return vec![];
    };
    clients
        .iter()
        .map(|client| InboundUser {
            uuid: client.get("id").and_then(Value::as_str).map(str::to_owned),
            email: client.get("email").and_then(Value::as_str).map(str::to_owned),
            password: if UUID_PROTOCOLS.contains(&protocol) {
                None
            } else {
                client.get("password").and_then(Value::as_str).map(str::to_owned)
            },
        })
        .collect()
}

/// Replace `settings.clients` on every UUID-bearing inbound with the
/// panel user set. Returns the number of inbounds touched.
pub fn inject_users(config: &mut Value, users: &[(String, String)]) -> usize {
    let Some(inbounds) = config.get_mut("inbounds").and_then(Value::as_array_mut) else {
        return 0;
    };

    let mut touched = 0;
    for inbound in inbounds {
        let Some(protocol) = inbound.get("protocol").and_then(Value::as_str) else {
            continue;
        };
        if !UUID_PROTOCOLS.contains(&protocol) {
            if KNOWN_PROTOCOLS.contains(&protocol) {
                debug!(protocol, "user injection skips non-uuid inbound");
            } else {
                debug!(protocol, "user injection skips unknown inbound type");
            }
            continue;
        }
        let clients: Vec<Value> = users
            .iter()
            .map(|(uuid, email)| json!({ "id": uuid, "email": email }))
            .collect();
        let settings = inbound
            .as_object_mut()
            .map(|o| o.entry("settings").or_insert_with(|| json!({})));
        if let Some(obj) = settings.and_then(Value::as_object_mut) {
            obj.insert("clients".to_owned(), Value::Array(clients));
            touched += 1;
        }
    }
    touched
}

/// Arguments for config validation: `xray run -test -c <path>`.
pub fn validate_args(config_path: &Path) -> Vec<String> {
    vec![
        "run".to_owned(),
        "-test".to_owned(),
        "-c".to_owned(),
        config_path.to_string_lossy().into_owned(),
    ]
}

/// Arguments for running the engine directly: `xray run -c <path>`.
pub fn run_args(config_path: &Path) -> Vec<String> {
    vec!["run".to_owned(), "-c".to_owned(), config_path.to_string_lossy().into_owned()]
}

#[cfg(test)]
#[path = "xray_tests.rs"]
mod tests;
