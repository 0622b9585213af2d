// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::{json, Value};

use crate::engine::singbox::{inject_users, parse_inbounds, probe};

fn sample_config() -> Value {
    json!({
        "log": {"level": "warn"},
        "inbounds": [
            {
                "type": "vless",
                "tag": "vless-in",
                "listen": "::",
                "listen_port": 443,
                "users": [{"name": "42.alice", "uuid": "9f6d7f3e-0000-4000-8000-000000000001"}],
                "tls": {
                    "enabled": true,
                    "server_name": "www.example.com",
                    "reality": {
                        "enabled": true,
                        "handshake": {"server": "www.example.com", "server_port": 443}
                    }
                },
                "multiplex": {
                    "enabled": true,
                    "brutal": {"enabled": true, "up_mbps": 100, "down_mbps": 500}
                }
            },
            {
                "type": "hysteria2",
                "tag": "hy2-in",
                "listen": "::",
                "listen_port": 8443,
                "users": [{"name": "43.bob", "password": "hunter2"}]
            },
            {"type": "tun", "tag": "tun-in"}
        ]
    })
}

#[test]
fn probes_on_type_field() {
    assert!(probe(&sample_config()));
    assert!(!probe(&json!({"inbounds": [{"protocol": "vmess"}]})));
    assert!(!probe(&json!({"outbounds": []})));
}

#[test]
fn parses_known_inbounds_and_skips_unknown() {
    let details = parse_inbounds(&sample_config());
    assert_eq!(details.len(), 2, "tun inbound must be skipped");

    let vless = &details[0];
    assert_eq!(vless.protocol, "vless");
    assert_eq!(vless.listen.as_deref(), Some("::"));
    assert_eq!(vless.port, 443);
    assert!(vless.tls.enabled);
    assert_eq!(vless.tls.server_name.as_deref(), Some("www.example.com"));
    let handshake = vless.tls.reality.as_ref().and_then(|r| r.handshake.clone());
    assert_eq!(handshake.as_deref(), Some("www.example.com:443"));
    assert!(vless.multiplex.enabled);
    assert_eq!(vless.multiplex.brutal_up_mbps, Some(100));
    assert_eq!(vless.multiplex.brutal_down_mbps, Some(500));

    let hy2 = &details[1];
    assert_eq!(hy2.protocol, "hysteria2");
    assert_eq!(hy2.users[0].email.as_deref(), Some("43.bob"));
    assert_eq!(hy2.users[0].password.as_deref(), Some("hunter2"));
}

#[test]
fn disabled_tls_is_not_reported() {
    let config = json!({"inbounds": [
        {"type": "vmess", "listen_port": 80, "tls": {"enabled": false, "server_name": "x"}}
    ]});
    let details = parse_inbounds(&config);
    assert!(!details[0].tls.enabled);
    assert!(details[0].tls.server_name.is_none());
}

#[test]
fn injects_users_into_uuid_inbounds_only() {
    let mut config = sample_config();
    let users = vec![("cccccccc-0000-4000-8000-000000000003".to_owned(), "9.erin".to_owned())];
    let touched = inject_users(&mut config, &users);
    assert_eq!(touched, 1, "hysteria2 keeps its password users");

    let rendered = config.pointer("/inbounds/0/users").and_then(Value::as_array);
    assert_eq!(rendered.map(Vec::len), Some(1));
    assert_eq!(
        config.pointer("/inbounds/0/users/0/name").and_then(Value::as_str),
        Some("9.erin")
    );
    assert_eq!(
        config.pointer("/inbounds/1/users/0/password").and_then(Value::as_str),
        Some("hunter2")
    );
}
