// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::capability::CapabilityCache;
use crate::config::{EngineConfig, ServiceBackendKind, ServiceConfig};
use crate::engine::adapter::EngineAdapter;
use crate::engine::manager::{new_instance_id, CoreManager};
use crate::engine::registry::InstanceRegistry;
use crate::engine::EngineKind;
use crate::service::ServiceManager;

fn manager_with_xray() -> CoreManager {
    let registry = Arc::new(InstanceRegistry::new());
    let service = Arc::new(ServiceManager::detect(
        &ServiceConfig {
            backend: ServiceBackendKind::Direct,
            custom_commands: Default::default(),
            allow_kill_fallback: false,
            runit_dir: None,
        },
        std::path::Path::new("/tmp"),
    ));
    let adapter = EngineAdapter::new(
        EngineKind::Xray,
        EngineConfig {
            binary: PathBuf::from("/nonexistent/xray"),
            config_dir: std::env::temp_dir().join("xboard-manager-tests"),
            service_name: "xray".to_owned(),
            access_log: None,
            stats_command: vec![],
            pid_file: None,
        },
        service,
        Arc::clone(&registry),
        Arc::new(CapabilityCache::new(Duration::from_secs(3600))),
    );
    let mut manager = CoreManager::new(registry);
    manager.register(Arc::new(adapter));
    manager
}

#[test]
fn instance_ids_embed_engine_and_are_unique() {
    let a = new_instance_id(EngineKind::Xray);
    let b = new_instance_id(EngineKind::Xray);
    assert!(a.starts_with("xray-"));
    assert_ne!(a, b);
}

#[tokio::test]
async fn unknown_engine_kind_is_rejected() {
    let manager = manager_with_xray();
    let result = manager
        .switch_core(None, EngineKind::SingBox, r#"{"inbounds": []}"#, &[443])
        .await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("no adapter registered"), "unexpected: {err}");
}

#[tokio::test]
async fn invalid_config_is_rejected_before_any_stop() {
    let manager = manager_with_xray();
    let result = manager.switch_core(None, EngineKind::Xray, "not json", &[443]).await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("invalid config"), "unexpected: {err}");
}

#[tokio::test]
async fn empty_port_list_is_rejected() {
    let manager = manager_with_xray();
    let result = manager.switch_core(None, EngineKind::Xray, r#"{"inbounds": []}"#, &[]).await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("listen port"), "unexpected: {err}");
}

#[tokio::test]
async fn start_failure_without_backup_surfaces() {
    let manager = manager_with_xray();
    // The xray binary does not exist, so validation inside start fails.
    let result = manager
        .switch_core(None, EngineKind::Xray, r#"{"inbounds": []}"#, &[443])
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn traffic_collection_with_no_stats_commands_is_empty() {
    let manager = manager_with_xray();
    assert!(manager.collect_traffic().await.is_empty());
}

#[tokio::test]
async fn failed_rollback_is_reported_as_fatal() {
    let manager = manager_with_xray();
    // A backup instance whose engine binary is gone: stopping it is a
    // no-op (already down), but restarting it on rollback cannot work.
    manager
        .registry()
        .update("xray-old", EngineKind::Xray, |record| {
            record.state = crate::engine::InstanceState::Running;
            record.config_path = std::path::PathBuf::from("/nonexistent/backup.json");
            record.listen_ports = vec![443];
        })
        .await;

    let result = manager
        .switch_core(Some("xray-old"), EngineKind::Xray, r#"{"inbounds": []}"#, &[443])
        .await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(
        err.contains("switch failed and rollback failed"),
        "unexpected: {err}"
    );
}
