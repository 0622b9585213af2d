// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Internal-port allocation for zero-downtime switches.

use std::collections::BTreeMap;
use std::future::Future;

use rand::Rng;
use tracing::debug;

/// Why a start attempt under allocation failed.
#[derive(Debug)]
pub enum StartError {
    /// A drawn internal port is already taken; the allocator retries.
    AddressInUse(String),
    /// Anything else bubbles up unchanged.
    Other(anyhow::Error),
}

impl StartError {
    /// Classify an engine start failure by its message.
    pub fn from_start_failure(err: anyhow::Error) -> Self {
        let text = format!("{err:#}").to_lowercase();
        if text.contains("address already in use") || text.contains("address in use") {
            Self::AddressInUse(format!("{err:#}"))
        } else {
            Self::Other(err)
        }
    }
}

/// Draws internal ports uniformly from a configured range.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    start: u16,
    end: u16,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// One uniform draw from `[start, end]`.
    pub fn draw(&self) -> u16 {
        rand::rng().random_range(self.start..=self.end)
    }

    /// Draw one internal port per external port.
    ///
    /// Draws are independent; collision with occupied ports or between
    /// the draws themselves is the caller's `start_fn` contract to
    /// reject as [`StartError::AddressInUse`].
    pub fn draw_mapping(&self, external_ports: &[u16]) -> BTreeMap<u16, u16> {
        external_ports.iter().map(|&external| (external, self.draw())).collect()
    }

    /// Repeatedly draw a mapping and run `start_fn` until it succeeds,
    /// retrying only on address-in-use, up to `max_retries` attempts
    /// beyond the first.
    pub async fn allocate_with_retry<T, F, Fut>(
        &self,
        external_ports: &[u16],
        max_retries: u32,
        mut start_fn: F,
    ) -> anyhow::Result<(BTreeMap<u16, u16>, T)>
    where
        F: FnMut(BTreeMap<u16, u16>) -> Fut,
        Fut: Future<Output = Result<T, StartError>>,
    {
        let mut last_in_use = String::new();
        for attempt in 0..=max_retries {
            let mapping = self.draw_mapping(external_ports);
            match start_fn(mapping.clone()).await {
                Ok(value) => return Ok((mapping, value)),
                Err(StartError::AddressInUse(detail)) => {
                    debug!(attempt, "allocation collided: {detail}");
                    last_in_use = detail;
                }
                Err(StartError::Other(e)) => return Err(e),
            }
        }
        anyhow::bail!(
            "no usable internal ports after {} attempts: {last_in_use}",
            max_retries + 1
        )
    }
}

#[cfg(test)]
#[path = "alloc_tests.rs"]
mod tests;
