// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Access-log collection: tail the engine's access log and batch
//! accepted-connection entries for upstream reporting.

use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One accepted connection, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub timestamp: i64,
    pub user: String,
    pub target: String,
    pub protocol: String,
}

/// Tails an engine access log from a tracked byte offset, with
/// truncation detection for log rotation.
pub struct AccessLogCollector {
    path: PathBuf,
    offset: u64,
    poll_interval: Duration,
}

impl AccessLogCollector {
    pub fn new(path: PathBuf) -> Self {
        Self { path, offset: 0, poll_interval: Duration::from_secs(5) }
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Read complete lines appended since the last read. A missing file
    /// is silence, not an error; a shrunken file resets the offset.
    pub fn read_new_entries(&mut self) -> anyhow::Result<Vec<AccessLogEntry>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        if let Ok(meta) = file.metadata() {
            if meta.len() < self.offset {
                self.offset = 0;
            }
        }

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(self.offset))?;

        let mut entries = Vec::new();
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }
            self.offset += bytes_read as u64;
            if let Some(entry) = parse_line(line.trim_end()) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Tail the log until shutdown, sending non-empty batches to
    /// `batch_tx`. Filesystem events wake the loop early; polling is the
    /// fallback.
    pub async fn run(
        mut self,
        batch_tx: mpsc::Sender<Vec<AccessLogEntry>>,
        shutdown: CancellationToken,
    ) {
        let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
        let _watcher = self.setup_notify_watcher(wake_tx);

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {}
                _ = poll.tick() => {}
            }

            match self.read_new_entries() {
                Ok(entries) if !entries.is_empty() => {
                    if batch_tx.send(entries).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(path = %self.path.display(), "access log read: {e:#}"),
            }
        }
    }

    /// Watch the log's parent directory so rotation and creation wake us.
    fn setup_notify_watcher(
        &self,
        wake_tx: mpsc::Sender<()>,
    ) -> Option<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
            let _ = wake_tx.try_send(());
        })
        .ok()?;

        let watch_path = self.path.parent().unwrap_or(self.path.as_ref());
        watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
        Some(watcher)
    }
}

/// Parse one accepted-connection line.
///
/// Both engine families log accepted connections with an
/// `accepted <proto>:<target>` token and, when the inbound has users, an
/// `email: <who>` suffix. Lines without both are dropped.
fn parse_line(line: &str) -> Option<AccessLogEntry> {
    static ACCEPTED: OnceLock<Option<Regex>> = OnceLock::new();
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    let accepted =
        ACCEPTED.get_or_init(|| Regex::new(r"accepted\s+(tcp|udp):(\S+)").ok()).as_ref()?;
    let email = EMAIL.get_or_init(|| Regex::new(r"email:\s*(\S+)").ok()).as_ref()?;

    let caps = accepted.captures(line)?;
    let protocol = caps.get(1)?.as_str().to_owned();
    let target = caps.get(2)?.as_str().to_owned();
    let user = email.captures(line)?.get(1)?.as_str().to_owned();

    Some(AccessLogEntry {
        timestamp: crate::transport::now_epoch_secs(),
        user,
        target,
        protocol,
    })
}

#[cfg(test)]
#[path = "accesslog_tests.rs"]
mod tests;
