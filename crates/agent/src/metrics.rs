// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node metrics for the periodic status report.

use sysinfo::{Disks, Networks, ProcessesToUpdate, System};
use tracing::debug;

/// One sample of host-level metrics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeMetrics {
    pub cpu_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub uptime_secs: u64,
    pub process_count: u32,
    pub tcp_count: u32,
    pub udp_count: u32,
}

/// Byte deltas since the previous report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetIoDelta {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Stateful collector: CPU usage and net-IO deltas need a previous
/// sample to be meaningful.
pub struct MetricsCollector {
    system: System,
    networks: Networks,
    last_rx: Option<u64>,
    last_tx: Option<u64>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            networks: Networks::new_with_refreshed_list(),
            last_rx: None,
            last_tx: None,
        }
    }

    /// Sample host metrics. Socket counts are best-effort; a host
    /// without /proc simply reports zero.
    pub fn collect(&mut self) -> NodeMetrics {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_avail) = disks
            .iter()
            .fold((0u64, 0u64), |(t, a), d| (t + d.total_space(), a + d.available_space()));

        let load = System::load_average();
        NodeMetrics {
            cpu_percent: f64::from(self.system.global_cpu_usage()),
            mem_used_bytes: self.system.used_memory(),
            mem_total_bytes: self.system.total_memory(),
            disk_used_bytes: disk_total.saturating_sub(disk_avail),
            disk_total_bytes: disk_total,
            load1: load.one,
            load5: load.five,
            load15: load.fifteen,
            uptime_secs: System::uptime(),
            process_count: self.system.processes().len() as u32,
            tcp_count: proc_socket_count(&["/proc/net/tcp", "/proc/net/tcp6"]),
            udp_count: proc_socket_count(&["/proc/net/udp", "/proc/net/udp6"]),
        }
    }

    /// Delta of total interface bytes since the previous call.
    ///
    /// Counters are monotonic per kernel, but interface churn can make
    /// the sum go backwards; a wrapped reading reports zero.
    pub fn netio_delta(&mut self) -> NetIoDelta {
        self.networks.refresh(true);
        let (rx, tx) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(r, t), (_, data)| {
                (r + data.total_received(), t + data.total_transmitted())
            });

        let delta = NetIoDelta {
            rx_bytes: counter_delta(self.last_rx, rx),
            tx_bytes: counter_delta(self.last_tx, tx),
        };
        self.last_rx = Some(rx);
        self.last_tx = Some(tx);
        delta
    }
}

/// Wrap-safe counter delta: the first sample and backwards readings
/// both yield zero.
fn counter_delta(last: Option<u64>, current: u64) -> u64 {
    match last {
        None => 0,
        Some(last) if current < last => {
            debug!(last, current, "net counter went backwards; reporting zero delta");
            0
        }
        Some(last) => current - last,
    }
}

fn proc_socket_count(paths: &[&str]) -> u32 {
    paths
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|contents| contents.lines().count().saturating_sub(1) as u32)
        .sum()
}

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;
