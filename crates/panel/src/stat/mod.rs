// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory traffic accumulation ahead of the durable stat store.

pub mod job;
pub mod repo;

use std::collections::HashMap;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use parking_lot::Mutex;

/// Traffic bucket granularity; the numeric value is the persisted
/// record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    pub const ALL: [Self; 3] = [Self::Hourly, Self::Daily, Self::Monthly];

    pub fn record_type(self) -> i32 {
        match self {
            Self::Hourly => 0,
            Self::Daily => 1,
            Self::Monthly => 2,
        }
    }

    /// UTC-aligned start of the bucket containing `now`.
    pub fn bucket_start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let base = match self {
            Self::Hourly => Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0),
            Self::Daily => Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0),
            Self::Monthly => Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0),
        };
        base.single().unwrap_or(now)
    }
}

/// Accumulator key: which agent host saw which user.
pub type AccumKey = (i64, i64);

/// Pending upload/download byte deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delta {
    pub upload: u64,
    pub download: u64,
}

impl Delta {
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

/// Mutex-protected delta map for one granularity.
#[derive(Default)]
pub struct Accumulator {
    entries: Mutex<HashMap<AccumKey, Delta>>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a delta. Zero deltas are dropped at the door.
    pub fn collect(&self, host_id: i64, user_id: i64, upload: u64, download: u64) {
        if upload == 0 && download == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        let entry = entries.entry((host_id, user_id)).or_default();
        entry.upload += upload;
        entry.download += download;
    }

    /// Take everything, leaving the accumulator empty.
    pub fn snapshot_and_reset(&self) -> HashMap<AccumKey, Delta> {
        std::mem::take(&mut *self.entries.lock())
    }

    /// Return unapplied deltas after a failed flush. Additive, so
    /// traffic collected meanwhile is preserved.
    pub fn merge_back(&self, deltas: impl IntoIterator<Item = (AccumKey, Delta)>) {
        let mut entries = self.entries.lock();
        for (key, delta) in deltas {
            if delta.is_zero() {
                continue;
            }
            let entry = entries.entry(key).or_default();
            entry.upload += delta.upload;
            entry.download += delta.download;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn get(&self, host_id: i64, user_id: i64) -> Option<Delta> {
        self.entries.lock().get(&(host_id, user_id)).copied()
    }
}

/// One accumulator per granularity; every delta goes to all three.
#[derive(Default)]
pub struct MultiAccumulator {
    hourly: Accumulator,
    daily: Accumulator,
    monthly: Accumulator,
}

impl MultiAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect_with_host(&self, host_id: i64, user_id: i64, upload: u64, download: u64) {
        self.hourly.collect(host_id, user_id, upload, download);
        self.daily.collect(host_id, user_id, upload, download);
        self.monthly.collect(host_id, user_id, upload, download);
    }

    pub fn accumulator(&self, granularity: Granularity) -> &Accumulator {
        match granularity {
            Granularity::Hourly => &self.hourly,
            Granularity::Daily => &self.daily,
            Granularity::Monthly => &self.monthly,
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
