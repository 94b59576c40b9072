// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository contract for volume lifecycle records.

use async_trait::async_trait;

use crate::domain::fileset::VolumeRecord;

/// Stores the controller's view of in-flight and settled provisions, keyed
/// by the CreateVolume request name.
#[async_trait]
pub trait VolumeRepository: Send + Sync {
    async fn save(&self, record: &VolumeRecord);

    async fn find_by_name(&self, name: &str) -> Option<VolumeRecord>;

    async fn delete(&self, name: &str);

    async fn list(&self) -> Vec<VolumeRecord>;
}
