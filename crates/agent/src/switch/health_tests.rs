// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::switch::health::HealthChecker;

fn checker(timeout_ms: u64) -> HealthChecker {
    HealthChecker::new(Duration::from_millis(timeout_ms), Duration::from_millis(20))
}

#[tokio::test]
async fn listening_ports_pass() -> anyhow::Result<()> {
    let a = TcpListener::bind("127.0.0.1:0").await?;
    let b = TcpListener::bind("127.0.0.1:0").await?;
    let ports = [a.local_addr()?.port(), b.local_addr()?.port()];

    checker(2000).wait_healthy(&ports, &CancellationToken::new()).await?;
    Ok(())
}

#[tokio::test]
async fn dead_port_times_out_with_port_in_message() -> anyhow::Result<()> {
    let live = TcpListener::bind("127.0.0.1:0").await?;
    let live_port = live.local_addr()?.port();
    // A port nothing listens on: bind then drop.
    let dead_port = {
        let l = TcpListener::bind("127.0.0.1:0").await?;
        l.local_addr()?.port()
    };

    let result = checker(300)
        .wait_healthy(&[live_port, dead_port], &CancellationToken::new())
        .await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("health check timeout"), "unexpected: {err}");
    assert!(err.contains(&dead_port.to_string()));
    assert!(!err.contains(&live_port.to_string()), "healthy port must not be reported");
    Ok(())
}

#[tokio::test]
async fn late_listener_within_budget_passes() -> anyhow::Result<()> {
    let reserved = TcpListener::bind("127.0.0.1:0").await?;
    let port = reserved.local_addr()?.port();
    drop(reserved);

    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        TcpListener::bind(("127.0.0.1", port)).await
    });

    checker(2000).wait_healthy(&[port], &CancellationToken::new()).await?;
    let _ = handle.await;
    Ok(())
}

#[tokio::test]
async fn cancellation_stops_waiting() -> anyhow::Result<()> {
    let dead_port = {
        let l = TcpListener::bind("127.0.0.1:0").await?;
        l.local_addr()?.port()
    };
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let result = checker(10_000).wait_healthy(&[dead_port], &cancel).await;
    let err = result.err().map(|e| e.to_string()).unwrap_or_default();
    assert!(err.contains("cancelled"), "unexpected: {err}");
    Ok(())
}
