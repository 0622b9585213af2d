// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Panel user injection into a live engine config.

use super::{parse, singbox, xray, EngineKind};

/// A user as delivered by the panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelUser {
    pub uuid: String,
    pub email: String,
    pub enabled: bool,
}

/// Inject the enabled subset of `users` into `config_text`.
///
/// Engine selection follows the config's own markers: xray-family
/// configs take users via `settings.clients` per inbound, sing-box via
/// `users[]`. Returns the rewritten document and how many inbounds were
/// touched.
pub fn inject_users(config_text: &str, users: &[PanelUser]) -> anyhow::Result<(String, usize)> {
    let mut value = parse::validate(config_text)?;
    let kind = parse::identify(&value)
        .ok_or_else(|| anyhow::anyhow!("cannot inject users: unrecognized config flavor"))?;

    let pairs: Vec<(String, String)> = users
        .iter()
        .filter(|user| user.enabled)
        .map(|user| (user.uuid.clone(), user.email.clone()))
        .collect();

    let touched = match kind {
        EngineKind::Xray => xray::inject_users(&mut value, &pairs),
        EngineKind::SingBox => singbox::inject_users(&mut value, &pairs),
    };

    let rendered = serde_json::to_string_pretty(&value)?;
    Ok((rendered, touched))
}
