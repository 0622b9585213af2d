// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Engine config identification and inbound extraction.
//!
//! The registry is an ordered probe list: strip comments, require valid
//! JSON, then ask each engine parser whether the root shape is its own.

use serde_json::Value;

use super::{singbox, xray, EngineKind, ProtocolDetails};

/// Strip `//` line comments and `/* */` block comments outside strings.
///
/// Engine configs in the wild are JSONC; serde_json is not.
pub fn strip_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' => match chars.peek() {
                Some('/') => {
                    // Line comment: drop until newline (kept for line numbers).
                    for nc in chars.by_ref() {
                        if nc == '\n' {
                            out.push('\n');
                            break;
                        }
                    }
                }
                Some('*') => {
                    chars.next();
                    let mut prev = '\0';
                    for nc in chars.by_ref() {
                        if prev == '*' && nc == '/' {
                            break;
                        }
                        prev = nc;
                    }
                }
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

/// Strip comments, trim, and require a JSON object.
pub fn validate(input: &str) -> anyhow::Result<Value> {
    let stripped = strip_comments(input);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        anyhow::bail!("invalid config: empty document");
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| anyhow::anyhow!("invalid config: {e}"))?;
    if !value.is_object() {
        anyhow::bail!("invalid config: root is not an object");
    }
    Ok(value)
}

/// Identify the engine flavor of a validated config.
///
/// Probes run in registration order; the first match wins.
pub fn identify(value: &Value) -> Option<EngineKind> {
    if singbox::probe(value) {
        Some(EngineKind::SingBox)
    } else if xray::probe(value) {
        Some(EngineKind::Xray)
    } else {
        None
    }
}

/// Validate raw bytes and extract per-inbound protocol details.
pub fn parse_config(input: &str) -> anyhow::Result<(EngineKind, Vec<ProtocolDetails>)> {
    let value = validate(input)?;
    let kind = identify(&value)
        .ok_or_else(|| anyhow::anyhow!("invalid config: no engine parser matched"))?;
    let details = match kind {
        EngineKind::Xray => xray::parse_inbounds(&value),
        EngineKind::SingBox => singbox::parse_inbounds(&value),
    };
    Ok((kind, details))
}

/// Shared helper: a port value that may be a JSON number or string.
pub(crate) fn port_of(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
#[path = "parse_tests.rs"]
mod tests;
