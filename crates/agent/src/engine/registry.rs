// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared registry of supervised core instances.

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::{CoreInstance, EngineKind, InstanceState};

/// All instance records behind a single reader-writer lock.
///
/// Mutation goes through [`update`](Self::update), which atomically
/// creates the record if missing and applies the closure under the write
/// lock. Reads return clones; nothing outside this module holds a
/// reference into the map.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, CoreInstance>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create-if-missing, then mutate under the write lock. Returns a
    /// clone of the record after mutation.
    pub async fn update<F>(&self, id: &str, engine_kind: EngineKind, mutate: F) -> CoreInstance
    where
        F: FnOnce(&mut CoreInstance),
    {
        let mut instances = self.instances.write().await;
        let record = instances
            .entry(id.to_owned())
            .or_insert_with(|| CoreInstance::new(id, engine_kind));
        mutate(record);
        record.clone()
    }

    pub async fn get(&self, id: &str) -> Option<CoreInstance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<CoreInstance> {
        let mut all: Vec<CoreInstance> = self.instances.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Remove a record. Callers must only do this once the instance is
    /// stopped and its cgroup (if any) is proven empty.
    pub async fn remove(&self, id: &str) -> Option<CoreInstance> {
        self.instances.write().await.remove(id)
    }

    /// Mark an instance failed with a message.
    pub async fn mark_error(&self, id: &str, engine_kind: EngineKind, message: impl Into<String>) {
        let message = message.into();
        self.update(id, engine_kind, |record| {
            record.state = InstanceState::Error;
            record.last_error = Some(message);
        })
        .await;
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
