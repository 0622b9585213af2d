// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-group switch serialization.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Deterministic group id: the sorted external ports joined with `-`.
pub fn group_id(external_ports: &[u16]) -> String {
    let mut ports = external_ports.to_vec();
    ports.sort_unstable();
    ports.dedup();
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join("-")
}

/// One mutex per group id. `try_lock` refuses a second in-flight switch
/// of the same group; disjoint groups proceed in parallel.
#[derive(Default)]
pub struct GroupLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl GroupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the group lock without waiting. `None` means a switch of
    /// this group is already in flight.
    pub fn try_lock(&self, group: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(group.to_owned()).or_default())
        };
        lock.try_lock_owned().ok()
    }
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
