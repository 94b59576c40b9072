// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! In-memory backend for tests and development
//!
//! Models the parts of the filesystem the driver cares about: filesystems,
//! filesets and their link state, quotas, directories, ACLs, snapshots and
//! policy partitions. Failures can be injected per operation and every call
//! is counted.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use regex::Regex;

use crate::domain::backend::{
    Acl, BackendError, BackendVersion, ClusterInfo, DirectorySpec, FilesetInfo, FilesetSpec, FilesystemInfo,
    InodeSpace, ScaleBackend, SnapshotInfo,
};
use crate::domain::fileset::relative_path;
use crate::domain::quota::QuotaLimits;
use crate::domain::storage_class::ROOT_FILESET;

type Key = (String, String);

static POOL_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"POOL '([^']+)'").expect("static regex"));

fn key(a: &str, b: &str) -> Key {
    (a.to_string(), b.to_string())
}

/// One server-side copy, recorded for assertions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRecord {
    pub filesystem: String,
    /// `snapshot:<fileset>/<snapshot>[/<path>]` or the source directory
    pub source: String,
    pub target: String,
}

#[derive(Default)]
struct State {
    filesystems: HashMap<String, FilesystemInfo>,
    filesets: HashMap<Key, FilesetInfo>,
    next_inode_space: u64,
    quotas: HashMap<Key, QuotaLimits>,
    directories: BTreeSet<Key>,
    acls: HashMap<Key, Acl>,
    snapshots: HashMap<Key, Vec<SnapshotInfo>>,
    policies: HashMap<Key, String>,
    /// Storage pools policy rules may name; `None` accepts any pool
    pools: Option<BTreeSet<String>>,
    copies: Vec<CopyRecord>,
    failures: HashMap<String, VecDeque<BackendError>>,
    calls: HashMap<String, usize>,
}

impl State {
    /// Count the call and pop an injected failure, if any
    fn enter(&mut self, operation: &str) -> Result<(), BackendError> {
        *self.calls.entry(operation.to_string()).or_default() += 1;
        match self.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn filesystem(&self, name: &str) -> Result<&FilesystemInfo, BackendError> {
        self.filesystems
            .get(name)
            .ok_or_else(|| BackendError::NotFound(format!("filesystem {}", name)))
    }

    /// Filesystem and relative path for an absolute path
    fn locate_absolute(&self, absolute: &str) -> Option<(String, String)> {
        self.filesystems
            .values()
            .filter_map(|fs| relative_path(&fs.mount_point, absolute).map(|rel| (fs.name.clone(), rel)))
            .max_by_key(|(_, rel)| std::cmp::Reverse(rel.len()))
    }

    fn absolute_exists(&self, absolute: &str) -> bool {
        self.locate_absolute(absolute)
            .is_some_and(|(fs, rel)| self.path_exists(&fs, &rel))
    }

    /// A relative path exists when it is a created directory or a linked junction
    fn path_exists(&self, filesystem: &str, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.is_empty() || self.directories.contains(&key(filesystem, path)) {
            return true;
        }
        let Some(fs) = self.filesystems.get(filesystem) else {
            return false;
        };
        self.filesets.values().any(|f| {
            f.filesystem == filesystem
                && f.path
                    .as_deref()
                    .and_then(|p| relative_path(&fs.mount_point, p))
                    .is_some_and(|rel| rel == path)
        })
    }
}

pub struct InMemoryScaleBackend {
    cluster: ClusterInfo,
    snapshot_delay: Option<Duration>,
    state: Mutex<State>,
}

impl InMemoryScaleBackend {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster: ClusterInfo {
                cluster_id: cluster_id.into(),
                cluster_name: "memory.cluster".to_string(),
                version: BackendVersion::new(&[5, 2, 0, 0]),
            },
            snapshot_delay: None,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_version(mut self, version: BackendVersion) -> Self {
        self.cluster.version = version;
        self
    }

    /// Register a filesystem and its implicit root fileset
    pub fn with_filesystem(self, name: &str, uuid: &str, mount_point: &str) -> Self {
        {
            let mut state = self.state.lock();
            state.filesystems.insert(
                name.to_string(),
                FilesystemInfo {
                    name: name.to_string(),
                    uuid: uuid.to_string(),
                    mount_point: mount_point.to_string(),
                },
            );
            state.filesets.insert(
                key(name, ROOT_FILESET),
                FilesetInfo {
                    name: ROOT_FILESET.to_string(),
                    filesystem: name.to_string(),
                    path: Some(mount_point.to_string()),
                    independent: true,
                    inode_space: 0,
                    max_inodes: 0,
                    comment: Some("root fileset".to_string()),
                },
            );
        }
        self
    }

    /// Restrict the storage pools policy rules may reference
    pub fn with_pools(self, pools: &[&str]) -> Self {
        self.state.lock().pools = Some(pools.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Delay every snapshot creation, widening race windows in tests
    pub fn with_snapshot_delay(mut self, delay: Duration) -> Self {
        self.snapshot_delay = Some(delay);
        self
    }

    /// Fail the next call to `operation` (a [`ScaleBackend`] method name)
    pub fn fail_next(&self, operation: &str, err: BackendError) {
        self.state
            .lock()
            .failures
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn fileset(&self, filesystem: &str, name: &str) -> Option<FilesetInfo> {
        self.state.lock().filesets.get(&key(filesystem, name)).cloned()
    }

    pub fn fileset_names(&self, filesystem: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .lock()
            .filesets
            .values()
            .filter(|f| f.filesystem == filesystem && f.name != ROOT_FILESET)
            .map(|f| f.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn quota(&self, filesystem: &str, fileset: &str) -> Option<QuotaLimits> {
        self.state.lock().quotas.get(&key(filesystem, fileset)).copied()
    }

    pub fn has_directory(&self, filesystem: &str, path: &str) -> bool {
        self.state.lock().directories.contains(&key(filesystem, path))
    }

    pub fn acl(&self, filesystem: &str, path: &str) -> Option<Acl> {
        self.state.lock().acls.get(&key(filesystem, path)).cloned()
    }

    pub fn snapshot_names(&self, filesystem: &str, fileset: &str) -> Vec<String> {
        self.state
            .lock()
            .snapshots
            .get(&key(filesystem, fileset))
            .map(|snaps| snaps.iter().map(|s| s.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn policy(&self, filesystem: &str, partition: &str) -> Option<String> {
        self.state.lock().policies.get(&key(filesystem, partition)).cloned()
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.state.lock().copies.clone()
    }
}

#[async_trait]
impl ScaleBackend for InMemoryScaleBackend {
    async fn get_cluster_info(&self) -> Result<ClusterInfo, BackendError> {
        self.state.lock().enter("get_cluster_info")?;
        Ok(self.cluster.clone())
    }

    async fn get_filesystem_info(&self, filesystem: &str) -> Result<FilesystemInfo, BackendError> {
        let mut state = self.state.lock();
        state.enter("get_filesystem_info")?;
        state.filesystem(filesystem).cloned()
    }

    async fn get_filesystem_name(&self, uuid: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.enter("get_filesystem_name")?;
        state
            .filesystems
            .values()
            .find(|fs| fs.uuid == uuid)
            .map(|fs| fs.name.clone())
            .ok_or_else(|| BackendError::NotFound(format!("filesystem with UUID {}", uuid)))
    }

    async fn create_fileset(&self, filesystem: &str, spec: &FilesetSpec) -> Result<FilesetInfo, BackendError> {
        let mut state = self.state.lock();
        state.enter("create_fileset")?;
        state.filesystem(filesystem)?;
        if state.filesets.contains_key(&key(filesystem, &spec.name)) {
            return Err(BackendError::AlreadyExists(format!("Fileset {} already exists.", spec.name)));
        }
        let inode_space = match &spec.inode_space {
            InodeSpace::Shared(parent) => state
                .filesets
                .get(&key(filesystem, parent))
                .map(|p| p.inode_space)
                .ok_or_else(|| BackendError::NotFound(format!("Fileset {} does not exist.", parent)))?,
            InodeSpace::New => {
                state.next_inode_space += 1;
                state.next_inode_space
            }
        };
        let info = FilesetInfo {
            name: spec.name.clone(),
            filesystem: filesystem.to_string(),
            path: None,
            independent: spec.inode_space == InodeSpace::New,
            inode_space,
            max_inodes: if spec.inode_space == InodeSpace::New { spec.max_inodes } else { 0 },
            comment: Some(spec.comment.clone()).filter(|c| !c.is_empty()),
        };
        state.filesets.insert(key(filesystem, &spec.name), info.clone());
        Ok(info)
    }

    async fn get_fileset(&self, filesystem: &str, name: &str) -> Result<FilesetInfo, BackendError> {
        let mut state = self.state.lock();
        state.enter("get_fileset")?;
        state
            .filesets
            .get(&key(filesystem, name))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("fileset {} in filesystem {}", name, filesystem)))
    }

    async fn list_filesets(&self, filesystem: &str) -> Result<Vec<FilesetInfo>, BackendError> {
        let mut state = self.state.lock();
        state.enter("list_filesets")?;
        state.filesystem(filesystem)?;
        let mut filesets: Vec<FilesetInfo> = state
            .filesets
            .values()
            .filter(|f| f.filesystem == filesystem)
            .cloned()
            .collect();
        filesets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(filesets)
    }

    async fn delete_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("delete_fileset")?;
        let k = key(filesystem, name);
        let fileset = state
            .filesets
            .get(&k)
            .ok_or_else(|| BackendError::NotFound(format!("Fileset {} does not exist.", name)))?;
        if fileset.is_linked() {
            return Err(BackendError::FilesetBusy(format!("Fileset {} is linked.", name)));
        }
        let (independent, inode_space) = (fileset.independent, fileset.inode_space);
        let has_dependents = independent
            && state
                .filesets
                .values()
                .any(|f| f.filesystem == filesystem && f.name != name && f.inode_space == inode_space);
        if has_dependents {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("Fileset {} has dependent filesets.", name),
            });
        }
        if state.snapshots.get(&k).is_some_and(|s| !s.is_empty()) {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("Fileset {} has snapshots.", name),
            });
        }
        state.filesets.remove(&k);
        state.quotas.remove(&k);
        state.snapshots.remove(&k);
        Ok(())
    }

    async fn link_fileset(&self, filesystem: &str, name: &str, junction: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("link_fileset")?;
        state.filesystem(filesystem)?;
        let fileset = state
            .filesets
            .get_mut(&key(filesystem, name))
            .ok_or_else(|| BackendError::NotFound(format!("Fileset {} does not exist.", name)))?;
        match &fileset.path {
            Some(existing) if existing == junction => Ok(()),
            Some(existing) => Err(BackendError::Rejected {
                status: 400,
                message: format!("Fileset {} is already linked at {}.", name, existing),
            }),
            None => {
                fileset.path = Some(junction.to_string());
                Ok(())
            }
        }
    }

    async fn unlink_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("unlink_fileset")?;
        let fileset = state
            .filesets
            .get_mut(&key(filesystem, name))
            .ok_or_else(|| BackendError::NotFound(format!("Fileset {} does not exist.", name)))?;
        fileset.path = None;
        Ok(())
    }

    async fn set_quota(&self, filesystem: &str, fileset: &str, limits: &QuotaLimits) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("set_quota")?;
        let k = key(filesystem, fileset);
        if !state.filesets.contains_key(&k) {
            return Err(BackendError::NotFound(format!("Fileset {} does not exist.", fileset)));
        }
        state.quotas.insert(k, *limits);
        Ok(())
    }

    async fn get_quota(&self, filesystem: &str, fileset: &str) -> Result<QuotaLimits, BackendError> {
        let mut state = self.state.lock();
        state.enter("get_quota")?;
        let k = key(filesystem, fileset);
        if !state.filesets.contains_key(&k) {
            return Err(BackendError::NotFound(format!("Fileset {} does not exist.", fileset)));
        }
        Ok(state
            .quotas
            .get(&k)
            .cloned()
            .unwrap_or(QuotaLimits { block_limit_kib: 0, inode_limit: 0 }))
    }

    async fn create_directory(&self, filesystem: &str, spec: &DirectorySpec) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("create_directory")?;
        state.filesystem(filesystem)?;
        let path = spec.path.trim_matches('/').to_string();
        if state.path_exists(filesystem, &path) {
            return Err(BackendError::AlreadyExists(format!("Directory {} already exists.", path)));
        }
        // parents are created implicitly
        let mut prefix = String::new();
        for component in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(component);
            state.directories.insert(key(filesystem, &prefix));
        }
        Ok(())
    }

    async fn delete_directory(&self, filesystem: &str, path: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("delete_directory")?;
        let path = path.trim_matches('/');
        if !state.directories.contains(&key(filesystem, path)) {
            return Err(BackendError::NotFound(format!("Directory {} does not exist.", path)));
        }
        let nested = format!("{}/", path);
        state
            .directories
            .retain(|(fs, p)| !(fs == filesystem && (p == path || p.starts_with(&nested))));
        state
            .acls
            .retain(|(fs, p), _| !(fs == filesystem && (p == path || p.starts_with(&nested))));
        Ok(())
    }

    async fn set_acl(&self, filesystem: &str, path: &str, acl: &Acl) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("set_acl")?;
        if !state.path_exists(filesystem, path) {
            return Err(BackendError::NotFound(format!("Path {} does not exist.", path)));
        }
        state.acls.insert(key(filesystem, path.trim_matches('/')), acl.clone());
        Ok(())
    }

    async fn get_acl(&self, filesystem: &str, path: &str) -> Result<Acl, BackendError> {
        let mut state = self.state.lock();
        state.enter("get_acl")?;
        if !state.path_exists(filesystem, path) {
            return Err(BackendError::NotFound(format!("Path {} does not exist.", path)));
        }
        Ok(state
            .acls
            .get(&key(filesystem, path.trim_matches('/')))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<SnapshotInfo, BackendError> {
        self.state.lock().enter("create_snapshot")?;
        if let Some(delay) = self.snapshot_delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let k = key(filesystem, fileset);
        if !state.filesets.contains_key(&k) {
            return Err(BackendError::NotFound(format!("Fileset {} does not exist.", fileset)));
        }
        let snapshots = state.snapshots.entry(k).or_default();
        if snapshots.iter().any(|s| s.name == name) {
            return Err(BackendError::AlreadyExists(format!("Snapshot {} already exists.", name)));
        }
        let info = SnapshotInfo {
            name: name.to_string(),
            fileset: fileset.to_string(),
            created_at: Some(Utc::now()),
        };
        snapshots.push(info.clone());
        Ok(info)
    }

    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("delete_snapshot")?;
        let snapshots = state
            .snapshots
            .get_mut(&key(filesystem, fileset))
            .ok_or_else(|| BackendError::NotFound(format!("Snapshot {} does not exist.", name)))?;
        let before = snapshots.len();
        snapshots.retain(|s| s.name != name);
        if snapshots.len() == before {
            return Err(BackendError::NotFound(format!("Snapshot {} does not exist.", name)));
        }
        Ok(())
    }

    async fn list_snapshots(&self, filesystem: &str, fileset: &str) -> Result<Vec<SnapshotInfo>, BackendError> {
        let mut state = self.state.lock();
        state.enter("list_snapshots")?;
        let k = key(filesystem, fileset);
        if !state.filesets.contains_key(&k) {
            return Err(BackendError::NotFound(format!("Fileset {} does not exist.", fileset)));
        }
        Ok(state.snapshots.get(&k).cloned().unwrap_or_default())
    }

    async fn copy_snapshot(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("copy_snapshot")?;
        let exists = state
            .snapshots
            .get(&key(filesystem, fileset))
            .is_some_and(|snaps| snaps.iter().any(|s| s.name == snapshot));
        if !exists {
            return Err(BackendError::NotFound(format!("Snapshot {} does not exist.", snapshot)));
        }
        if !state.absolute_exists(target_path) {
            return Err(BackendError::NotFound(format!("Target path {} does not exist.", target_path)));
        }
        let source = if source_path.is_empty() {
            format!("snapshot:{}/{}", fileset, snapshot)
        } else {
            format!("snapshot:{}/{}/{}", fileset, snapshot, source_path)
        };
        state.copies.push(CopyRecord {
            filesystem: filesystem.to_string(),
            source,
            target: target_path.to_string(),
        });
        Ok(())
    }

    async fn copy_directory(&self, filesystem: &str, source_path: &str, target_path: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("copy_directory")?;
        if !state.path_exists(filesystem, source_path) {
            return Err(BackendError::NotFound(format!("Source path {} does not exist.", source_path)));
        }
        if !state.absolute_exists(target_path) {
            return Err(BackendError::NotFound(format!("Target path {} does not exist.", target_path)));
        }
        state.copies.push(CopyRecord {
            filesystem: filesystem.to_string(),
            source: source_path.to_string(),
            target: target_path.to_string(),
        });
        Ok(())
    }

    async fn set_policy(&self, filesystem: &str, partition: &str, rules: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.enter("set_policy")?;
        state.filesystem(filesystem)?;
        if let Some(pools) = &state.pools {
            for clause in POOL_CLAUSE.captures_iter(rules) {
                let pool = &clause[1];
                if !pools.contains(pool) {
                    return Err(BackendError::Rejected {
                        status: 400,
                        message: format!("Invalid pool name '{}' in policy rule.", pool),
                    });
                }
            }
        }
        state.policies.insert(key(filesystem, partition), rules.to_string());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.state.lock().enter("health_check")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fileset::join_path;

    fn backend() -> InMemoryScaleBackend {
        InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID-1", "/ibm/fs1")
    }

    fn independent(name: &str) -> FilesetSpec {
        FilesetSpec {
            name: name.to_string(),
            inode_space: InodeSpace::New,
            max_inodes: 100_000,
            owner: None,
            permissions: None,
            comment: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_linked_fileset_cannot_be_deleted() {
        let backend = backend();
        backend.create_fileset("fs1", &independent("pvc-1")).await.unwrap();
        backend.link_fileset("fs1", "pvc-1", &join_path("/ibm/fs1", "pvc-1")).await.unwrap();

        let err = backend.delete_fileset("fs1", "pvc-1").await.unwrap_err();
        assert!(matches!(err, BackendError::FilesetBusy(_)));

        backend.unlink_fileset("fs1", "pvc-1").await.unwrap();
        backend.delete_fileset("fs1", "pvc-1").await.unwrap();
        assert!(backend.fileset("fs1", "pvc-1").is_none());
    }

    #[tokio::test]
    async fn test_duplicate_create_is_already_exists() {
        let backend = backend();
        backend.create_fileset("fs1", &independent("pvc-1")).await.unwrap();
        let err = backend.create_fileset("fs1", &independent("pvc-1")).await.unwrap_err();
        assert!(matches!(err, BackendError::AlreadyExists(_)));
        assert_eq!(backend.calls("create_fileset"), 2);
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let backend = backend();
        backend.fail_next("set_quota", BackendError::Unavailable("503".into()));
        backend.create_fileset("fs1", &independent("pvc-1")).await.unwrap();

        let limits = QuotaLimits { block_limit_kib: 1_048_576, inode_limit: 100_000 };
        assert!(backend.set_quota("fs1", "pvc-1", &limits).await.is_err());
        backend.set_quota("fs1", "pvc-1", &limits).await.unwrap();
        assert_eq!(backend.quota("fs1", "pvc-1"), Some(limits));
    }

    #[tokio::test]
    async fn test_directories_and_junctions_are_paths() {
        let backend = backend();
        backend
            .create_directory(
                "fs1",
                &DirectorySpec { path: "lw/pvc-2".to_string(), uid: None, gid: None, permissions: None },
            )
            .await
            .unwrap();
        assert!(backend.has_directory("fs1", "lw"));
        assert!(backend.get_acl("fs1", "lw/pvc-2").await.is_ok());

        backend.create_fileset("fs1", &independent("pvc-3")).await.unwrap();
        backend.link_fileset("fs1", "pvc-3", "/ibm/fs1/pvc-3").await.unwrap();
        backend.copy_directory("fs1", "lw/pvc-2", "/ibm/fs1/pvc-3").await.unwrap();
        assert_eq!(backend.copies().len(), 1);

        backend.delete_directory("fs1", "lw").await.unwrap();
        assert!(!backend.has_directory("fs1", "lw/pvc-2"));
    }
}
