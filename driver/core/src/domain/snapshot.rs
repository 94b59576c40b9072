// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::backend::BackendVersion;
use crate::domain::volume_handle::SnapshotIdentity;

/// Oldest backend release that supports fileset snapshots through the API.
pub fn min_snapshot_version() -> BackendVersion {
    BackendVersion::new(&[5, 0, 5, 2])
}

/// Oldest backend release that can copy a snapshot into a new volume.
pub fn min_snapshot_copy_version() -> BackendVersion {
    BackendVersion::new(&[5, 0, 5, 2])
}

/// Oldest backend release supporting consistency-group snapshots.
pub fn min_group_snapshot_version() -> BackendVersion {
    BackendVersion::new(&[5, 1, 3, 0])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Requested,
    Creating,
    Ready,
    Failed,
}

/// Result of a successful snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub identity: SnapshotIdentity,
    pub filesystem: String,
    /// Handle of the volume the snapshot was taken from.
    pub source_volume_id: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub state: SnapshotState,
}

impl SnapshotRef {
    pub fn snapshot_id(&self) -> String {
        self.identity.encode()
    }

    pub fn is_ready(&self) -> bool {
        self.state == SnapshotState::Ready
    }
}

/// One snapshot of a consistency-group fileset and the members it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group: String,
    pub snapshot_name: String,
    pub members: Vec<SnapshotRef>,
}

/// Key that serialises all work on one snapshot.
pub fn snapshot_key(filesystem: &str, fileset: &str, name: &str) -> String {
    format!("snapshot/{}/{}/{}", filesystem, fileset, name)
}
