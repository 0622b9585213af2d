// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The durable stat store boundary.
//!
//! The panel's relational schema lives elsewhere; the core only needs an
//! additive upsert keyed by `(user, host, record type, bucket start)`.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

/// Additive upsert into the stat store: on conflict the deltas are
/// added, never replaced. Re-applying a delta double-counts, which is
/// why the flush job never retries an already-applied key.
pub trait StatRepository: Send + Sync {
    fn upsert(
        &self,
        user_id: i64,
        host_id: i64,
        record_type: i32,
        record_at: DateTime<Utc>,
        upload: u64,
        download: u64,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Persisted row total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatRow {
    pub upload: u64,
    pub download: u64,
}

type RowKey = (i64, i64, i32, i64);

/// File-backed repository: a JSON document of row totals, rewritten on
/// every upsert batch. Enough durability for a single-writer panel
/// without dragging a database into the core.
pub struct FileStatRepository {
    path: PathBuf,
    rows: Mutex<BTreeMap<RowKey, StatRow>>,
    /// Injected failure for tests: fail the Nth upsert from now.
    fail_after: AtomicI64,
}

impl FileStatRepository {
    /// Open (or create) the store at `path`.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        let rows = match std::fs::read_to_string(&path) {
            Ok(text) => parse_rows(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(anyhow::anyhow!("reading {}: {e}", path.display())),
        };
        Ok(Self { path, rows: Mutex::new(rows), fail_after: AtomicI64::new(-1) })
    }

    /// In-memory only; used by tests.
    pub fn ephemeral() -> Self {
        Self {
            path: PathBuf::new(),
            rows: Mutex::new(BTreeMap::new()),
            fail_after: AtomicI64::new(-1),
        }
    }

    /// Make the repository fail once after `n` more successful upserts.
    pub fn fail_after(&self, n: i64) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    pub async fn row(
        &self,
        user_id: i64,
        host_id: i64,
        record_type: i32,
        record_at: DateTime<Utc>,
    ) -> Option<StatRow> {
        self.rows
            .lock()
            .await
            .get(&(user_id, host_id, record_type, record_at.timestamp()))
            .copied()
    }

    pub async fn row_count(&self) -> usize {
        self.rows.lock().await.len()
    }

    /// Sum of all rows for one user across hosts and buckets of one
    /// record type.
    pub async fn user_total(&self, user_id: i64, record_type: i32) -> StatRow {
        let rows = self.rows.lock().await;
        rows.iter()
            .filter(|((u, _, t, _), _)| *u == user_id && *t == record_type)
            .fold(StatRow::default(), |acc, (_, row)| StatRow {
                upload: acc.upload + row.upload,
                download: acc.download + row.download,
            })
    }

    fn persist(&self, rows: &BTreeMap<RowKey, StatRow>) -> anyhow::Result<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let rendered: Vec<serde_json::Value> = rows
            .iter()
            .map(|((user, host, record_type, at), row)| {
                serde_json::json!({
                    "user_id": user,
                    "host_id": host,
                    "record_type": record_type,
                    "record_at": at,
                    "upload": row.upload,
                    "download": row.download,
                })
            })
            .collect();
        let text = serde_json::to_string_pretty(&rendered)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StatRepository for FileStatRepository {
    async fn upsert(
        &self,
        user_id: i64,
        host_id: i64,
        record_type: i32,
        record_at: DateTime<Utc>,
        upload: u64,
        download: u64,
    ) -> anyhow::Result<()> {
        let remaining = self.fail_after.load(Ordering::SeqCst);
        if remaining >= 0 {
            if remaining == 0 {
                self.fail_after.store(-1, Ordering::SeqCst);
                anyhow::bail!("injected upsert failure");
            }
            self.fail_after.store(remaining - 1, Ordering::SeqCst);
        }

        let mut rows = self.rows.lock().await;
        let entry = rows
            .entry((user_id, host_id, record_type, record_at.timestamp()))
            .or_default();
        entry.upload += upload;
        entry.download += download;
        self.persist(&rows)
    }
}

fn parse_rows(text: &str) -> anyhow::Result<BTreeMap<RowKey, StatRow>> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let values: Vec<serde_json::Value> = serde_json::from_str(text)?;
    let mut rows = BTreeMap::new();
    for value in values {
        let key = (
            value.get("user_id").and_then(serde_json::Value::as_i64).unwrap_or(0),
            value.get("host_id").and_then(serde_json::Value::as_i64).unwrap_or(0),
            value.get("record_type").and_then(serde_json::Value::as_i64).unwrap_or(0) as i32,
            value.get("record_at").and_then(serde_json::Value::as_i64).unwrap_or(0),
        );
        let row = StatRow {
            upload: value.get("upload").and_then(serde_json::Value::as_u64).unwrap_or(0),
            download: value.get("download").and_then(serde_json::Value::as_u64).unwrap_or(0),
        };
        rows.insert(key, row);
    }
    Ok(rows)
}

#[cfg(test)]
#[path = "repo_tests.rs"]
mod tests;
