// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use crate::domain::fileset::VolumeRecord;
use crate::domain::repository::VolumeRepository;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Process-local volume records. The controller is stateless across
/// restarts; the backend stays the source of truth.
#[derive(Clone, Default)]
pub struct InMemoryVolumeRepository {
    records: Arc<RwLock<HashMap<String, VolumeRecord>>>,
}

impl InMemoryVolumeRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VolumeRepository for InMemoryVolumeRepository {
    async fn save(&self, record: &VolumeRecord) {
        self.records.write().insert(record.name.clone(), record.clone());
    }

    async fn find_by_name(&self, name: &str) -> Option<VolumeRecord> {
        self.records.read().get(name).cloned()
    }

    async fn delete(&self, name: &str) {
        self.records.write().remove(name);
    }

    async fn list(&self) -> Vec<VolumeRecord> {
        let mut records: Vec<VolumeRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_find_delete() {
        let repo = InMemoryVolumeRepository::new();
        let mut record = VolumeRecord::new("pvc-1");
        repo.save(&record).await;

        record.mark_creating().unwrap();
        repo.save(&record).await;

        let found = repo.find_by_name("pvc-1").await.unwrap();
        assert_eq!(found.state, record.state);
        assert_eq!(repo.list().await.len(), 1);

        repo.delete("pvc-1").await;
        assert!(repo.find_by_name("pvc-1").await.is_none());
    }
}
