// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Domain Events
//!
//! Published on the [`crate::infrastructure::event_bus::EventBus`] by the
//! lifecycle services and the operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fileset volume lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VolumeEvent {
    VolumeProvisioned {
        name: String,
        volume_id: String,
        capacity_bytes: u64,
        provisioned_at: DateTime<Utc>,
    },
    VolumeProvisionFailed {
        name: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
    /// A failed provision was compensated by removing partial backend state.
    ProvisionRolledBack {
        name: String,
        fileset: String,
        rolled_back_at: DateTime<Utc>,
    },
    VolumeDeprovisioned {
        volume_id: String,
        deprovisioned_at: DateTime<Utc>,
    },
    VolumeExpanded {
        volume_id: String,
        old_capacity_bytes: u64,
        new_capacity_bytes: u64,
        expanded_at: DateTime<Utc>,
    },
    VolumeCloned {
        source_volume_id: String,
        volume_id: String,
        cloned_at: DateTime<Utc>,
    },
    ConsistencyGroupCollected {
        filesystem: String,
        group: String,
        collected_at: DateTime<Utc>,
    },
}

/// Snapshot lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SnapshotEvent {
    SnapshotCreated {
        snapshot_id: String,
        source_volume_id: String,
        created_at: DateTime<Utc>,
    },
    SnapshotDeleted {
        snapshot_id: String,
        deleted_at: DateTime<Utc>,
    },
    SnapshotRestored {
        snapshot_id: String,
        volume_id: String,
        restored_at: DateTime<Utc>,
    },
    SnapshotFailed {
        name: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

/// Operator reconcile events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperatorEvent {
    ChildApplied {
        owner: String,
        kind: String,
        name: String,
        applied_at: DateTime<Utc>,
    },
    ReconcileFailed {
        owner: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}
