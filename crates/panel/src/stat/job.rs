// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flush jobs: move accumulated deltas into the durable store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::repo::StatRepository;
use super::{Accumulator, Delta, Granularity, MultiAccumulator};

/// Flush one accumulator into the store, atomic per key.
///
/// Snapshot-and-reset first so collection continues during the flush.
/// On an upsert failure every unapplied key (the failed one included)
/// merges back; applied keys must not, since the upsert is additive and
/// re-applying would double-count.
pub async fn flush<R: StatRepository>(
    accumulator: &Accumulator,
    granularity: Granularity,
    repo: &R,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let snapshot = accumulator.snapshot_and_reset();
    if snapshot.is_empty() {
        return Ok(0);
    }
    let record_at = granularity.bucket_start(now);

    let mut keys: Vec<_> = snapshot.keys().copied().collect();
    keys.sort_unstable();

    let mut applied = 0usize;
    for (index, key) in keys.iter().enumerate() {
        let (host_id, user_id) = *key;
        let delta = snapshot.get(key).copied().unwrap_or_default();
        if delta.is_zero() {
            continue;
        }
        if let Err(e) = repo
            .upsert(user_id, host_id, granularity.record_type(), record_at, delta.upload, delta.download)
            .await
        {
            let remaining: Vec<((i64, i64), Delta)> = keys[index..]
                .iter()
                .filter_map(|k| snapshot.get(k).map(|d| (*k, *d)))
                .collect();
            accumulator.merge_back(remaining);
            return Err(e.context(format!("flush of {granularity:?} bucket {record_at}")));
        }
        applied += 1;
    }
    Ok(applied)
}

/// How often each granularity flushes.
pub fn flush_cadence(granularity: Granularity) -> Duration {
    match granularity {
        // Near-real-time hourly buckets.
        Granularity::Hourly => Duration::from_secs(5 * 60),
        Granularity::Daily => Duration::from_secs(60 * 60),
        // Monthly flushes once a day at 00:05 UTC.
        Granularity::Monthly => Duration::from_secs(24 * 60 * 60),
    }
}

/// Seconds until the next daily `hh:mm` UTC mark.
pub fn until_daily_mark(now: DateTime<Utc>, hour: u32, minute: u32) -> Duration {
    let today = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let target = if today > now { today } else { today + chrono::Duration::days(1) };
    (target - now).to_std().unwrap_or(Duration::from_secs(24 * 60 * 60))
}

/// Spawn the three flush loops against a shared repository.
pub fn spawn_flush_jobs<R: StatRepository + 'static>(
    accumulators: Arc<MultiAccumulator>,
    repo: Arc<R>,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    Granularity::ALL
        .into_iter()
        .map(|granularity| {
            let accumulators = Arc::clone(&accumulators);
            let repo = Arc::clone(&repo);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let wait = match granularity {
                        Granularity::Monthly => until_daily_mark(Utc::now(), 0, 5),
                        other => flush_cadence(other),
                    };
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                    let accumulator = accumulators.accumulator(granularity);
                    match flush(accumulator, granularity, repo.as_ref(), Utc::now()).await {
                        Ok(0) => debug!(?granularity, "nothing to flush"),
                        Ok(applied) => info!(?granularity, applied, "stat flush complete"),
                        Err(e) => warn!(?granularity, "stat flush failed: {e:#}"),
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
