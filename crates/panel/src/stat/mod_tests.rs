// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use chrono::{TimeZone, Utc};

use crate::stat::{Accumulator, Delta, Granularity, MultiAccumulator};

#[test]
fn deltas_accumulate_additively() {
    let accumulator = Accumulator::new();
    accumulator.collect(1, 42, 1024, 0);
    accumulator.collect(1, 42, 1024, 0);
    accumulator.collect(1, 42, 1024, 0);

    assert_eq!(accumulator.get(1, 42), Some(Delta { upload: 3072, download: 0 }));
    assert_eq!(accumulator.len(), 1);
}

#[test]
fn zero_deltas_are_dropped() {
    let accumulator = Accumulator::new();
    accumulator.collect(1, 42, 0, 0);
    assert!(accumulator.is_empty());
}

#[test]
fn snapshot_resets_and_merge_back_restores() {
    let accumulator = Accumulator::new();
    accumulator.collect(1, 42, 100, 200);
    accumulator.collect(2, 43, 5, 6);

    let snapshot = accumulator.snapshot_and_reset();
    assert_eq!(snapshot.len(), 2);
    assert!(accumulator.is_empty());

    // New traffic lands while the flush is in flight.
    accumulator.collect(1, 42, 1, 1);
    accumulator.merge_back(snapshot);
    assert_eq!(accumulator.get(1, 42), Some(Delta { upload: 101, download: 201 }));
    assert_eq!(accumulator.get(2, 43), Some(Delta { upload: 5, download: 6 }));
}

#[test]
fn multi_accumulator_broadcasts_to_all_granularities() {
    let multi = MultiAccumulator::new();
    multi.collect_with_host(1, 42, 10, 20);

    for granularity in Granularity::ALL {
        assert_eq!(
            multi.accumulator(granularity).get(1, 42),
            Some(Delta { upload: 10, download: 20 }),
            "missing delta at {granularity:?}"
        );
    }
}

#[yare::parameterized(
    hourly  = { Granularity::Hourly, 2025, 11, 10, 13, 0, 0 },
    daily   = { Granularity::Daily, 2025, 11, 10, 0, 0, 0 },
    monthly = { Granularity::Monthly, 2025, 11, 1, 0, 0, 0 },
)]
fn buckets_align_to_utc(
    granularity: Granularity,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> anyhow::Result<()> {
    let now = Utc
        .with_ymd_and_hms(2025, 11, 10, 13, 37, 42)
        .single()
        .ok_or_else(|| anyhow::anyhow!("bad timestamp"))?;
    let expected = Utc
        .with_ymd_and_hms(year, month, day, hour, minute, second)
        .single()
        .ok_or_else(|| anyhow::anyhow!("bad expectation"))?;
    assert_eq!(granularity.bucket_start(now), expected);
    Ok(())
}

#[test]
fn record_types_match_storage_contract() {
    assert_eq!(Granularity::Hourly.record_type(), 0);
    assert_eq!(Granularity::Daily.record_type(), 1);
    assert_eq!(Granularity::Monthly.record_type(), 2);
}
