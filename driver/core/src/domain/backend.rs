// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Scale Backend Trait - Anti-Corruption Layer for the management REST API
//!
//! Isolates the lifecycle services from the filesystem's management API.
//! The production implementation speaks REST
//! ([`crate::infrastructure::scale::rest::ScaleRestClient`]); tests and local
//! development use [`crate::infrastructure::scale::memory::InMemoryScaleBackend`].
//!
//! # Paths
//!
//! Directory and ACL operations, and the *source* of copy operations, take
//! paths **relative to the filesystem mount point** (`"lwdir/pvc-1"`).
//! Fileset junctions passed to [`ScaleBackend::link_fileset`] and copy
//! targets are **absolute** (`"/ibm/fs1/pvc-1"`), so a copy may land on a
//! different filesystem.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::quota::QuotaLimits;

/// Dotted backend release, e.g. `5.1.9.0`.
///
/// Missing trailing components compare as zero, so `5.1.3` == `5.1.3.0`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
pub struct BackendVersion(pub Vec<u32>);

impl BackendVersion {
    pub fn new(parts: &[u32]) -> Self {
        Self(parts.to_vec())
    }

    pub fn at_least(&self, minimum: &BackendVersion) -> bool {
        self >= minimum
    }
}

impl FromStr for BackendVersion {
    type Err = BackendError;

    /// Accepts `5.1.9.0`, `5.1.9-0` and `5.1.9.0 (build 123)` forms.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let head = s.split_whitespace().next().unwrap_or_default();
        let parts = head
            .split(['.', '-'])
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| BackendError::Serialization(format!("unparseable version '{}'", s)))?;
        if parts.is_empty() {
            return Err(BackendError::Serialization(format!("unparseable version '{}'", s)));
        }
        Ok(Self(parts))
    }
}

impl PartialEq for BackendVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl PartialOrd for BackendVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackendVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", joined.join("."))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub cluster_name: String,
    pub version: BackendVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
    pub name: String,
    pub uuid: String,
    pub mount_point: String,
}

/// Where a new fileset gets its inodes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeSpace {
    /// Independent fileset with its own inode space (snapshot capable).
    New,
    /// Dependent fileset sharing the inode space of the named fileset.
    Shared(String),
}

impl InodeSpace {
    pub fn as_api_value(&self) -> &str {
        match self {
            InodeSpace::New => "new",
            InodeSpace::Shared(parent) => parent,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetSpec {
    pub name: String,
    pub inode_space: InodeSpace,
    /// Maximum inodes for an independent fileset; ignored for dependent ones.
    pub max_inodes: u64,
    /// `uid:gid` applied to the fileset root.
    pub owner: Option<String>,
    /// Octal mode applied to the fileset root, e.g. `"771"`.
    pub permissions: Option<String>,
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesetInfo {
    pub name: String,
    pub filesystem: String,
    /// Absolute junction path; `None` while unlinked.
    pub path: Option<String>,
    pub independent: bool,
    /// Inode space id; dependent filesets share their parent's.
    pub inode_space: u64,
    pub max_inodes: u64,
    pub comment: Option<String>,
}

impl FilesetInfo {
    pub fn is_linked(&self) -> bool {
        self.path.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub fileset: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectorySpec {
    /// Path relative to the filesystem mount point.
    pub path: String,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AceType {
    Allow,
    Deny,
}

/// One NFSv4 access control entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    #[serde(rename = "type")]
    pub ace_type: AceType,
    /// `special:owner@`, `special:group@`, `special:everyone@`, `user:<name>`, ...
    pub who: String,
    /// Permission letters, e.g. `"rwmxDaAnNcCos"`.
    pub permissions: String,
    #[serde(default)]
    pub flags: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub entries: Vec<AclEntry>,
}

/// Contract with the filesystem management plane
///
/// Every method is a single logical backend operation. Implementations own
/// transport concerns (retry, job polling, concurrency limits); callers own
/// orchestration and compensation.
#[async_trait]
pub trait ScaleBackend: Send + Sync {
    /// Identity and release of the cluster behind this endpoint
    async fn get_cluster_info(&self) -> Result<ClusterInfo, BackendError>;

    /// Look up a filesystem by name
    ///
    /// # Returns
    /// * `Ok(FilesystemInfo)` - name, UUID and mount point
    /// * `Err(BackendError::NotFound)` if no such filesystem exists
    async fn get_filesystem_info(&self, filesystem: &str) -> Result<FilesystemInfo, BackendError>;

    /// Resolve a filesystem UUID (as stored in a volume handle) to its name
    async fn get_filesystem_name(&self, uuid: &str) -> Result<String, BackendError>;

    /// Create a fileset
    ///
    /// # Returns
    /// * `Err(BackendError::AlreadyExists)` if a fileset of that name exists
    async fn create_fileset(&self, filesystem: &str, spec: &FilesetSpec) -> Result<FilesetInfo, BackendError>;

    async fn get_fileset(&self, filesystem: &str, name: &str) -> Result<FilesetInfo, BackendError>;

    async fn list_filesets(&self, filesystem: &str) -> Result<Vec<FilesetInfo>, BackendError>;

    /// Delete an unlinked fileset
    ///
    /// # Returns
    /// * `Err(BackendError::FilesetBusy)` if the fileset is still linked
    async fn delete_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError>;

    /// Link a fileset at an absolute junction path
    async fn link_fileset(&self, filesystem: &str, name: &str, junction: &str) -> Result<(), BackendError>;

    async fn unlink_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError>;

    async fn set_quota(&self, filesystem: &str, fileset: &str, limits: &QuotaLimits) -> Result<(), BackendError>;

    /// Current fileset limits; a fileset without a quota reports zero limits
    async fn get_quota(&self, filesystem: &str, fileset: &str) -> Result<QuotaLimits, BackendError>;

    async fn create_directory(&self, filesystem: &str, spec: &DirectorySpec) -> Result<(), BackendError>;

    /// Remove a directory tree
    async fn delete_directory(&self, filesystem: &str, path: &str) -> Result<(), BackendError>;

    async fn set_acl(&self, filesystem: &str, path: &str, acl: &Acl) -> Result<(), BackendError>;

    async fn get_acl(&self, filesystem: &str, path: &str) -> Result<Acl, BackendError>;

    /// Create a fileset snapshot
    ///
    /// # Returns
    /// * `Err(BackendError::AlreadyExists)` if the fileset already has a snapshot of that name
    async fn create_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<SnapshotInfo, BackendError>;

    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<(), BackendError>;

    async fn list_snapshots(&self, filesystem: &str, fileset: &str) -> Result<Vec<SnapshotInfo>, BackendError>;

    /// Copy `source_path` (relative to the snapshot root, empty for all of it)
    /// out of a fileset snapshot into the absolute `target_path`
    async fn copy_snapshot(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), BackendError>;

    /// Recursive server-side copy of a directory tree into the absolute `target_path`
    async fn copy_directory(&self, filesystem: &str, source_path: &str, target_path: &str) -> Result<(), BackendError>;

    /// Install placement/migration rules under a named policy partition
    async fn set_policy(&self, filesystem: &str, partition: &str, rules: &str) -> Result<(), BackendError>;

    /// Check health of the management endpoint
    async fn health_check(&self) -> Result<(), BackendError>;
}

/// Backend errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Fileset is busy: {0}")]
    FilesetBusy(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Non-retryable 4xx; `message` is the backend's own text.
    #[error("Rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Job {job_id} failed: {message}")]
    JobFailed { job_id: u64, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown backend error: {0}")]
    Unknown(String),
}

impl BackendError {
    /// Transient failures are retried by the transport; everything else is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_) | BackendError::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() {
            BackendError::Unavailable(err.to_string())
        } else if err.is_decode() {
            BackendError::Serialization(err.to_string())
        } else {
            BackendError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(err: serde_json::Error) -> Self {
        BackendError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing_and_ordering() {
        let v: BackendVersion = "5.1.9-0".parse().unwrap();
        assert_eq!(v, BackendVersion::new(&[5, 1, 9, 0]));
        assert_eq!(v.to_string(), "5.1.9.0");

        let short: BackendVersion = "5.1.3".parse().unwrap();
        assert_eq!(short, BackendVersion::new(&[5, 1, 3, 0]));
        assert!(short.at_least(&BackendVersion::new(&[5, 1, 2, 1])));
        assert!(!BackendVersion::new(&[5, 0, 5, 1]).at_least(&BackendVersion::new(&[5, 0, 5, 2])));

        let with_build: BackendVersion = "5.2.0.0 (build 42)".parse().unwrap();
        assert!(with_build > short);

        assert!("garbage".parse::<BackendVersion>().is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Unavailable("502".into()).is_transient());
        assert!(BackendError::Timeout("slow".into()).is_transient());
        assert!(!BackendError::Rejected { status: 400, message: "bad".into() }.is_transient());
        assert!(!BackendError::Unauthorized("401".into()).is_transient());
    }

    #[test]
    fn test_acl_entry_wire_shape() {
        let entry = AclEntry {
            ace_type: AceType::Allow,
            who: "special:owner@".to_string(),
            permissions: "rwmx".to_string(),
            flags: String::new(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "allow");
        assert_eq!(json["who"], "special:owner@");
    }
}
