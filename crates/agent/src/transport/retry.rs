// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RPC error classification and exponential backoff.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};

use crate::config::RetryConfig;

/// Every RPC failure falls into exactly one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; safe to retry with backoff.
    Retryable,
    /// 4xx-equivalent; retrying cannot help.
    Permanent,
    /// Data loss or server-internal inconsistency; surface to the operator.
    Fatal,
}

/// Classify a gRPC status.
///
/// Non-status transport failures surface from tonic as `Unknown` and are
/// assumed transient.
pub fn classify(status: &Status) -> ErrorClass {
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Unknown
        | Code::Cancelled => ErrorClass::Retryable,
        Code::Unauthenticated
        | Code::PermissionDenied
        | Code::InvalidArgument
        | Code::NotFound
        | Code::AlreadyExists
        | Code::FailedPrecondition
        | Code::OutOfRange
        | Code::Unimplemented => ErrorClass::Permanent,
        Code::DataLoss | Code::Internal => ErrorClass::Fatal,
        Code::Ok => ErrorClass::Permanent,
    }
}

/// Exponential backoff schedule: `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_interval,
            max: config.max_interval,
            multiplier: config.multiplier,
            attempt: 0,
        }
    }

    /// Delay for the next retry, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        self.attempt = self.attempt.saturating_add(1);
        let delay = self.initial.mul_f64(factor.max(1.0));
        delay.min(self.max)
    }
}

/// How many retries a call is entitled to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Normal,
    /// Status/traffic reports that must not be dropped lightly.
    Critical,
}

impl CallClass {
    fn max_retries(self, config: &RetryConfig) -> u32 {
        match self {
            Self::Normal => config.max_retries,
            Self::Critical => config.max_retries.max(5),
        }
    }
}

/// Run `op` with classified retry.
///
/// Only [`ErrorClass::Retryable`] failures are retried, up to the class
/// budget. Cancellation short-circuits any in-flight backoff sleep.
pub async fn with_retry<T, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    class: CallClass,
    mut op: F,
) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Status>>,
{
    let max_retries = if config.enabled { class.max_retries(config) } else { 0 };
    let mut backoff = Backoff::new(config);
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Status::cancelled("agent shutting down"));
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(status) => {
                if classify(&status) != ErrorClass::Retryable || attempt >= max_retries {
                    return Err(status);
                }
                attempt += 1;
                let delay = backoff.next_delay();
                tracing::debug!(
                    code = ?status.code(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying rpc"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(Status::cancelled("agent shutting down"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
