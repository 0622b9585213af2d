// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::engine::parse::{identify, parse_config, strip_comments, validate};
use crate::engine::EngineKind;

#[test]
fn strips_line_and_block_comments() {
    let input = r#"{
  // listen everywhere
  "listen": "::", /* default */
  "note": "https://example.com/not-a-comment"
}"#;
    let stripped = strip_comments(input);
    assert!(!stripped.contains("listen everywhere"));
    assert!(!stripped.contains("default"));
    // Slashes inside strings survive.
    assert!(stripped.contains("https://example.com/not-a-comment"));
    assert!(serde_json::from_str::<serde_json::Value>(&stripped).is_ok());
}

#[test]
fn escaped_quotes_do_not_end_strings() {
    let input = r#"{"k": "a\"b // not a comment"}"#;
    let stripped = strip_comments(input);
    assert_eq!(stripped, input);
}

#[yare::parameterized(
    empty      = { "" },
    whitespace = { "   \n " },
    not_json   = { "inbounds: []" },
    array_root = { "[1, 2]" },
)]
fn invalid_documents_are_rejected(input: &str) {
    let err = validate(input).err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("invalid config"), "unexpected: {err}");
}

#[test]
fn identifies_singbox_by_type_field() -> anyhow::Result<()> {
    let value = validate(r#"{"inbounds": [{"type": "vless", "listen_port": 443}]}"#)?;
    assert_eq!(identify(&value), Some(EngineKind::SingBox));
    Ok(())
}

#[test]
fn identifies_xray_by_protocol_field() -> anyhow::Result<()> {
    let value = validate(r#"{"inbounds": [{"protocol": "vmess", "port": 443}]}"#)?;
    assert_eq!(identify(&value), Some(EngineKind::Xray));
    Ok(())
}

#[test]
fn identifies_xray_by_api_root() -> anyhow::Result<()> {
    let value = validate(r#"{"api": {"tag": "api"}, "inbounds": []}"#)?;
    assert_eq!(identify(&value), Some(EngineKind::Xray));
    Ok(())
}

#[test]
fn unidentifiable_config_is_an_error() {
    let result = parse_config(r#"{"outbounds": []}"#);
    assert!(result.is_err());
}

#[test]
fn parse_config_returns_kind_and_details() -> anyhow::Result<()> {
    let (kind, details) = parse_config(
        r#"{
  "inbounds": [
    // panel-managed inbound
    {"type": "vless", "tag": "in-a", "listen": "::", "listen_port": 443,
     "users": [{"name": "42.alice", "uuid": "9f6d7f3e-0000-4000-8000-000000000001"}]}
  ]
}"#,
    )?;
    assert_eq!(kind, EngineKind::SingBox);
    assert_eq!(details.len(), 1);
    assert_eq!(details[0].port, 443);
    assert_eq!(details[0].users.len(), 1);
    Ok(())
}
