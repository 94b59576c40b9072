// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Per-key async locks.
//!
//! Operations on the same fileset (or the same snapshot) run one at a time;
//! different keys never contend. Entries are dropped from the table once the
//! last holder or waiter releases them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one keyed operation.
pub struct KeyGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: impl Into<String>) -> KeyGuard {
        let key = key.into();
        // clone out of the shard before awaiting
        let mutex = self
            .table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        KeyGuard {
            key,
            guard: Some(guard),
            table: self.table.clone(),
        }
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.table.remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
