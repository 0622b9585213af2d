// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::transport::state::{ConnState, StateTracker};

#[test]
fn failures_before_first_success_stay_disconnected() {
    let tracker = StateTracker::new();
    assert_eq!(tracker.current(), ConnState::Disconnected);
    tracker.note_connecting();
    assert_eq!(tracker.current(), ConnState::Connecting);
    tracker.note_failure();
    assert_eq!(tracker.current(), ConnState::Disconnected);
}

#[test]
fn failures_after_success_map_to_reconnecting() {
    let tracker = StateTracker::new();
    tracker.note_connecting();
    tracker.note_success();
    assert_eq!(tracker.current(), ConnState::Connected);
    tracker.note_failure();
    assert_eq!(tracker.current(), ConnState::Reconnecting);
    tracker.note_connecting();
    assert_eq!(tracker.current(), ConnState::Reconnecting);
    tracker.note_success();
    assert_eq!(tracker.current(), ConnState::Connected);
}

#[test]
fn callback_fires_on_transitions_only() {
    let tracker = StateTracker::new();
    let seen: Arc<Mutex<Vec<ConnState>>> = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&seen);
    tracker.on_change(Arc::new(move |state| sink.lock().push(state)));

    tracker.note_connecting();
    tracker.note_success();
    tracker.note_success(); // no transition
    tracker.note_failure();

    assert_eq!(
        *seen.lock(),
        vec![ConnState::Connecting, ConnState::Connected, ConnState::Reconnecting]
    );
}

#[test]
fn error_logs_are_debounced() {
    let tracker = StateTracker::new().with_error_log_interval(Duration::from_secs(3600));
    assert!(tracker.note_failure());
    assert!(!tracker.note_failure());
    assert!(!tracker.note_failure());

    let tracker = StateTracker::new().with_error_log_interval(Duration::ZERO);
    assert!(tracker.note_failure());
    assert!(tracker.note_failure());
}

#[test]
fn callback_counts_connected_transitions() {
    let tracker = StateTracker::new();
    let connects = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&connects);
    tracker.on_change(Arc::new(move |state| {
        if state == ConnState::Connected {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }));

    for _ in 0..3 {
        tracker.note_connecting();
        tracker.note_success();
        tracker.note_failure();
    }
    assert_eq!(connects.load(Ordering::SeqCst), 3);
}
