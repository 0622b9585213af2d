// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{counter_delta, MetricsCollector, NetIoDelta};

#[yare::parameterized(
    first_sample = { None, 1000, 0 },
    steady       = { Some(1000u64), 1500, 500 },
    unchanged    = { Some(1000u64), 1000, 0 },
    wrapped      = { Some(1000u64), 200, 0 },
)]
fn counter_delta_handles_wrap(last: Option<u64>, current: u64, expected: u64) {
    assert_eq!(counter_delta(last, current), expected);
}

#[test]
fn collect_produces_plausible_sample() {
    let mut collector = MetricsCollector::new();
    let metrics = collector.collect();

    assert!(metrics.mem_total_bytes > 0);
    assert!(metrics.mem_used_bytes <= metrics.mem_total_bytes);
    assert!(metrics.process_count > 0);
    assert!(metrics.uptime_secs > 0);
    assert!(metrics.disk_used_bytes <= metrics.disk_total_bytes);
}

#[test]
fn first_netio_sample_is_zero_delta() {
    let mut collector = MetricsCollector::new();
    assert_eq!(collector.netio_delta(), NetIoDelta { rx_bytes: 0, tx_bytes: 0 });
}

#[test]
fn netio_deltas_are_monotonic_samples() {
    let mut collector = MetricsCollector::new();
    let _ = collector.netio_delta();
    // A second sample may be zero but must never underflow.
    let second = collector.netio_delta();
    assert!(second.rx_bytes < u64::MAX / 2);
    assert!(second.tx_bytes < u64::MAX / 2);
}
