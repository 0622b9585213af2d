// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Connection-state tracking for the panel channel.
//!
//! tonic does not surface channel state transitions directly, so the
//! tracker is fed by the transport wrapper: every RPC outcome and connect
//! attempt is noted here and folded into a four-state view.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Observable channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

type StateCallback = Arc<dyn Fn(ConnState) + Send + Sync>;

struct Inner {
    state: ConnState,
    /// Whether the channel has ever been connected; failures before the
    /// first success map to `Connecting`, after it to `Reconnecting`.
    was_connected: bool,
    last_error_log: Option<Instant>,
    callback: Option<StateCallback>,
}

/// Tracks the panel channel state and debounces error logging.
pub struct StateTracker {
    inner: Mutex<Inner>,
    error_log_interval: Duration,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConnState::Disconnected,
                was_connected: false,
                last_error_log: None,
                callback: None,
            }),
            error_log_interval: Duration::from_secs(30),
        }
    }

    #[cfg(test)]
    pub fn with_error_log_interval(mut self, interval: Duration) -> Self {
        self.error_log_interval = interval;
        self
    }

    /// Register the state-change callback.
    ///
    /// Invoked under the tracker's lock on every transition; it must not
    /// block. The orchestrator uses this to trigger an immediate
    /// sync+report on transition to `Connected`.
    pub fn on_change(&self, callback: StateCallback) {
        self.inner.lock().callback = Some(callback);
    }

    pub fn current(&self) -> ConnState {
        self.inner.lock().state
    }

    /// Note the start of a connect attempt.
    pub fn note_connecting(&self) {
        let mut inner = self.inner.lock();
        let next =
            if inner.was_connected { ConnState::Reconnecting } else { ConnState::Connecting };
        Self::transition(&mut inner, next);
    }

    /// Note a successful RPC.
    pub fn note_success(&self) {
        let mut inner = self.inner.lock();
        inner.was_connected = true;
        Self::transition(&mut inner, ConnState::Connected);
    }

    /// Note a failed RPC or connect attempt. Returns `true` when the
    /// caller should emit an error log (at most once per interval).
    pub fn note_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        let next =
            if inner.was_connected { ConnState::Reconnecting } else { ConnState::Disconnected };
        Self::transition(&mut inner, next);

        let now = Instant::now();
        match inner.last_error_log {
            Some(last) if now.duration_since(last) < self.error_log_interval => false,
            _ => {
                inner.last_error_log = Some(now);
                true
            }
        }
    }

    fn transition(inner: &mut Inner, next: ConnState) {
        if inner.state == next {
            return;
        }
        inner.state = next;
        if let Some(ref callback) = inner.callback {
            callback(next);
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
