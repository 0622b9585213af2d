// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::config::RetryConfig;
use crate::transport::retry::{classify, with_retry, Backoff, CallClass, ErrorClass};

fn fast_config() -> RetryConfig {
    RetryConfig {
        enabled: true,
        max_retries: 3,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(4),
        multiplier: 2.0,
    }
}

#[yare::parameterized(
    unavailable        = { Code::Unavailable, ErrorClass::Retryable },
    deadline           = { Code::DeadlineExceeded, ErrorClass::Retryable },
    exhausted          = { Code::ResourceExhausted, ErrorClass::Retryable },
    aborted            = { Code::Aborted, ErrorClass::Retryable },
    unknown_transport  = { Code::Unknown, ErrorClass::Retryable },
    unauthenticated    = { Code::Unauthenticated, ErrorClass::Permanent },
    permission_denied  = { Code::PermissionDenied, ErrorClass::Permanent },
    invalid_argument   = { Code::InvalidArgument, ErrorClass::Permanent },
    not_found          = { Code::NotFound, ErrorClass::Permanent },
    already_exists     = { Code::AlreadyExists, ErrorClass::Permanent },
    failed_precond     = { Code::FailedPrecondition, ErrorClass::Permanent },
    out_of_range       = { Code::OutOfRange, ErrorClass::Permanent },
    unimplemented      = { Code::Unimplemented, ErrorClass::Permanent },
    data_loss          = { Code::DataLoss, ErrorClass::Fatal },
    internal           = { Code::Internal, ErrorClass::Fatal },
)]
fn classification(code: Code, expected: ErrorClass) {
    assert_eq!(classify(&Status::new(code, "x")), expected);
}

#[test]
fn backoff_doubles_and_caps() {
    let mut backoff = Backoff::new(&RetryConfig {
        enabled: true,
        max_retries: 10,
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(5),
        multiplier: 2.0,
    });
    assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    assert_eq!(backoff.next_delay(), Duration::from_millis(1000));
    assert_eq!(backoff.next_delay(), Duration::from_millis(2000));
    assert_eq!(backoff.next_delay(), Duration::from_millis(4000));
    assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    assert_eq!(backoff.next_delay(), Duration::from_secs(5));
}

#[tokio::test]
async fn unavailable_is_retried_up_to_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), Status> =
        with_retry(&fast_config(), &CancellationToken::new(), CallClass::Normal, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Status::unavailable("down"))
            }
        })
        .await;
    assert_eq!(result.err().map(|s| s.code()), Some(Code::Unavailable));
    // Initial attempt plus max_retries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn unauthenticated_is_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), Status> =
        with_retry(&fast_config(), &CancellationToken::new(), CallClass::Normal, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Status::unauthenticated("bad token"))
            }
        })
        .await;
    assert_eq!(result.err().map(|s| s.code()), Some(Code::Unauthenticated));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn critical_calls_get_a_larger_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), Status> =
        with_retry(&fast_config(), &CancellationToken::new(), CallClass::Critical, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Status::unavailable("down"))
            }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn success_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result = with_retry(&fast_config(), &CancellationToken::new(), CallClass::Normal, move || {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Status::unavailable("down"))
            } else {
                Ok(42u32)
            }
        }
    })
    .await;
    assert_eq!(result.ok(), Some(42));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn cancellation_preempts_backoff() {
    let cancel = CancellationToken::new();
    let config = RetryConfig {
        enabled: true,
        max_retries: 3,
        initial_interval: Duration::from_secs(3600),
        max_interval: Duration::from_secs(3600),
        multiplier: 2.0,
    };
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        with_retry(&config, &token, CallClass::Normal, || async {
            Err::<(), Status>(Status::unavailable("down"))
        })
        .await
    });
    // Let the first attempt fail and enter backoff, then cancel.
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    let result = handle.await.ok().and_then(|r| r.err());
    assert_eq!(result.map(|s| s.code()), Some(Code::Cancelled));
}

#[tokio::test]
async fn disabled_retry_fails_fast() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let mut config = fast_config();
    config.enabled = false;
    let result: Result<(), Status> =
        with_retry(&config, &CancellationToken::new(), CallClass::Normal, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Status::unavailable("down"))
            }
        })
        .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
