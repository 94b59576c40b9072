// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fileset Aggregate
//!
//! A provisioned volume is tracked as a [`VolumeRecord`] moving through
//! [`FilesetState`]. The record is the controller's memory of in-flight work:
//! a retried CreateVolume finds the state left by the previous attempt.
//!
//! Fileset names encode applied storage features as suffixes, which the
//! placement rules match on: `pvc-123-COMPRESSLZ4csi-Tsilvercsi`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::error::CsiError;
use crate::domain::storage_class::StorageClassPlan;
use crate::domain::volume_handle::VolumeIdentity;

/// Comment stamped on every fileset the driver creates.
pub const FILESET_COMMENT: &str = "Fileset created by Scale CSI driver";

/// Backend limit on fileset name length.
pub const MAX_FILESET_NAME_LEN: usize = 255;

/// Fileset name for a volume: the volume name plus feature suffixes.
pub fn fileset_name(volume_name: &str, plan: &StorageClassPlan) -> String {
    let mut name = volume_name.to_string();
    if let Some(algorithm) = &plan.compression {
        name.push_str(&format!("-COMPRESS{}csi", algorithm));
    }
    if let Some(tier) = &plan.tier {
        name.push_str(&format!("-T{}csi", tier));
    }
    name
}

/// Policy partition installed for a storage feature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPartition {
    pub partition: String,
    pub rules: String,
}

/// Placement and compression rules a plan needs on the backend.
///
/// Rules match on the fileset name suffix, so one partition per tier or
/// algorithm serves every volume that uses it.
pub fn placement_policies(plan: &StorageClassPlan) -> Vec<PolicyPartition> {
    let mut policies = Vec::new();
    if let Some(tier) = &plan.tier {
        let tag = format!("T{}csi", tier);
        policies.push(PolicyPartition {
            partition: format!("csi-{}", tag),
            rules: format!(
                "RULE 'csi-{tag}' SET POOL '{tier}' WHERE FILESET_NAME LIKE '%-{tag}%'",
                tag = tag,
                tier = tier
            ),
        });
    }
    if let Some(algorithm) = &plan.compression {
        let tag = format!("COMPRESS{}csi", algorithm);
        policies.push(PolicyPartition {
            partition: format!("csi-{}", tag),
            rules: format!(
                "RULE 'csi-{tag}' MIGRATE COMPRESS('{algo}') WHERE FILESET_NAME LIKE '%-{tag}%'",
                tag = tag,
                algo = algorithm.to_ascii_lowercase()
            ),
        });
    }
    policies
}

/// Volume names become fileset names and directory names on the backend.
pub fn validate_volume_name(name: &str) -> Result<(), FilesetError> {
    if name.is_empty() {
        return Err(FilesetError::InvalidName("volume name is empty".to_string()));
    }
    if name.len() > MAX_FILESET_NAME_LEN {
        return Err(FilesetError::InvalidName(format!(
            "volume name '{}' exceeds {} characters",
            name, MAX_FILESET_NAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(FilesetError::InvalidName(format!(
            "volume name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

/// Join a mount point and a relative path.
pub fn join_path(mount_point: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if relative.is_empty() {
        return mount_point.trim_end_matches('/').to_string();
    }
    format!("{}/{}", mount_point.trim_end_matches('/'), relative)
}

/// Strip a mount point from an absolute path; `None` when outside the mount.
pub fn relative_path(mount_point: &str, absolute: &str) -> Option<String> {
    let base = mount_point.trim_end_matches('/');
    let rest = absolute.strip_prefix(base)?;
    if !(rest.is_empty() || rest.starts_with('/')) {
        return None;
    }
    Some(rest.trim_matches('/').to_string())
}

/// Provisioning state of a fileset-backed volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesetState {
    Requested,
    Creating,
    /// Created, linked and quota applied.
    LinkedWithQuota,
    /// Handed back to the orchestrator.
    Bound,
    Failed,
}

impl fmt::Display for FilesetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FilesetState::Requested => "requested",
            FilesetState::Creating => "creating",
            FilesetState::LinkedWithQuota => "linked",
            FilesetState::Bound => "bound",
            FilesetState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Result of a successful provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetRef {
    pub identity: VolumeIdentity,
    /// Filesystem name (the handle only carries its UUID).
    pub filesystem: String,
    pub capacity_bytes: u64,
}

impl FilesetRef {
    pub fn volume_id(&self) -> String {
        self.identity.encode()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub state: FilesetState,
    pub fileset: Option<FilesetRef>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VolumeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            state: FilesetState::Requested,
            fileset: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, allowed: &[FilesetState], to: FilesetState) -> Result<(), FilesetError> {
        if !allowed.contains(&self.state) {
            return Err(FilesetError::InvalidStateTransition { from: self.state, to });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_creating(&mut self) -> Result<(), FilesetError> {
        self.transition(&[FilesetState::Requested, FilesetState::Failed], FilesetState::Creating)?;
        self.last_error = None;
        Ok(())
    }

    pub fn mark_linked(&mut self, fileset: FilesetRef) -> Result<(), FilesetError> {
        self.transition(&[FilesetState::Creating], FilesetState::LinkedWithQuota)?;
        self.fileset = Some(fileset);
        Ok(())
    }

    pub fn mark_bound(&mut self) -> Result<(), FilesetError> {
        self.transition(&[FilesetState::LinkedWithQuota, FilesetState::Bound], FilesetState::Bound)
    }

    /// Any state may fail.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.state = FilesetState::Failed;
        self.last_error = Some(reason.into());
        self.updated_at = Utc::now();
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.state, FilesetState::LinkedWithQuota | FilesetState::Bound)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilesetError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: FilesetState, to: FilesetState },

    #[error("{0}")]
    InvalidName(String),
}

impl From<FilesetError> for CsiError {
    fn from(err: FilesetError) -> Self {
        match err {
            FilesetError::InvalidName(msg) => CsiError::InvalidArgument(msg),
            other => CsiError::Internal(other.to_string()),
        }
    }
}
