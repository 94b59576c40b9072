// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Fileset Lifecycle Application Service
//!
//! Turns a validated [`StorageClassPlan`] into backend objects and back:
//! - Directory volumes: one directory under the class base path
//! - Fileset volumes: create, link, wait for the junction, quota, ACL
//! - Consistency groups: member filesets inside a shared group fileset,
//!   which is created on first use and collected when empty
//!
//! Every step after fileset creation is undone when a later step fails and
//! this call created the fileset. Work on one volume name is serialised by
//! [`KeyedLocks`]; group membership changes additionally take the group key
//! (always volume first, then group).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::application::locks::KeyedLocks;
use crate::application::{group_key, locate, volume_key};
use crate::domain::backend::{BackendError, DirectorySpec, FilesetInfo, FilesetSpec, FilesystemInfo, InodeSpace, ScaleBackend};
use crate::domain::error::CsiError;
use crate::domain::events::VolumeEvent;
use crate::domain::fileset::{
    fileset_name, join_path, placement_policies, relative_path, validate_volume_name, FilesetRef, FilesetState,
    VolumeRecord, FILESET_COMMENT, MAX_FILESET_NAME_LEN,
};
use crate::domain::permissions::{min_permissions_version, Permissions};
use crate::domain::quota::{block_limit_kib, QuotaLimits, DEFAULT_VOLUME_SIZE_BYTES};
use crate::domain::repository::VolumeRepository;
use crate::domain::snapshot::min_snapshot_copy_version;
use crate::domain::storage_class::{min_consistency_group_version, StorageClassPlan, VolumeLayout, ROOT_FILESET};
use crate::domain::volume_handle::{VolumeIdentity, LIGHTWEIGHT_FILESET};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::retry::{poll_until, RetryPolicy};
use crate::infrastructure::scale::ClusterRegistry;

pub const CLONE_CLASS_MISMATCH: &str =
    "same storage class required for cloning (use the same storage class for cloning source and target)";

// ============================================================================
// Requests
// ============================================================================

/// Initial content copied into a freshly provisioned volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSeed {
    /// Root of another volume, relative to its filesystem mount.
    Volume { filesystem: String, source_path: String },
    /// A directory inside a fileset snapshot (`""` for the fileset root).
    Snapshot {
        filesystem: String,
        fileset: String,
        snapshot: String,
        source_path: String,
    },
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub name: String,
    pub plan: StorageClassPlan,
    /// Requested capacity; `0` selects the default size.
    pub capacity_bytes: u64,
    pub seed: Option<ContentSeed>,
}

impl ProvisionRequest {
    pub fn new(name: impl Into<String>, plan: StorageClassPlan, capacity_bytes: u64) -> Self {
        Self {
            name: name.into(),
            plan,
            capacity_bytes,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: ContentSeed) -> Self {
        self.seed = Some(seed);
        self
    }

    fn capacity(&self) -> u64 {
        if self.capacity_bytes == 0 {
            DEFAULT_VOLUME_SIZE_BYTES
        } else {
            self.capacity_bytes
        }
    }

    /// Capacity the volume ends up with: the quota after the floor is
    /// applied, or the requested size for quota-less directory volumes.
    pub fn applied_capacity(&self) -> u64 {
        match self.plan.layout {
            VolumeLayout::Lightweight { .. } => self.capacity(),
            _ => QuotaLimits::for_capacity(self.capacity(), 0).capacity_bytes(),
        }
    }

    /// Name of the backend object, which is also the lock key.
    fn object_name(&self) -> String {
        match self.plan.layout {
            VolumeLayout::Lightweight { .. } => self.name.clone(),
            _ => fileset_name(&self.name, &self.plan),
        }
    }
}

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait FilesetService: Send + Sync {
    /// Create (or converge onto) the backend object for a volume
    async fn provision(&self, request: ProvisionRequest) -> Result<FilesetRef, CsiError>;

    /// Remove the backend object behind a handle; missing objects are success
    async fn deprovision(&self, volume_id: &str) -> Result<(), CsiError>;

    /// Raise the block quota; returns the capacity now in effect
    async fn expand(&self, volume_id: &str, capacity_bytes: u64) -> Result<u64, CsiError>;

    /// Provision a new volume seeded with the content of an existing one
    async fn clone_volume(&self, source_volume_id: &str, request: ProvisionRequest) -> Result<FilesetRef, CsiError>;

    /// Current state of the volume behind a handle
    async fn resolve_ref(&self, volume_id: &str) -> Result<FilesetRef, CsiError>;

    /// Delete a consistency-group fileset once it has no members and no snapshots
    async fn collect_consistency_group(&self, cluster_id: &str, filesystem: &str, group: &str) -> Result<(), CsiError>;
}

// ============================================================================
// Standard Implementation
// ============================================================================

/// What a layout-specific provision step produced
struct Provisioned {
    identity: VolumeIdentity,
    /// This call created the object (so a later failure must remove it)
    created: bool,
}

pub struct StandardFilesetService {
    registry: ClusterRegistry,
    repository: Arc<dyn VolumeRepository>,
    event_bus: Arc<EventBus>,
    locks: KeyedLocks,
    link_wait: RetryPolicy,
}

impl StandardFilesetService {
    pub fn new(
        registry: ClusterRegistry,
        repository: Arc<dyn VolumeRepository>,
        event_bus: Arc<EventBus>,
        locks: KeyedLocks,
    ) -> Self {
        Self {
            registry,
            repository,
            event_bus,
            locks,
            link_wait: RetryPolicy::new(10, Duration::from_millis(500), Duration::from_secs(2)),
        }
    }

    /// Override how long to wait for a link to become visible
    pub fn with_link_wait(mut self, policy: RetryPolicy) -> Self {
        self.link_wait = policy;
        self
    }

    pub fn registry(&self) -> &ClusterRegistry {
        &self.registry
    }

    fn target_cluster(&self, plan: &StorageClassPlan) -> String {
        self.registry.provisioning_cluster(plan.cluster_id.as_deref())
    }

    fn target_filesystem(&self, plan: &StorageClassPlan) -> String {
        plan.filesystem
            .clone()
            .unwrap_or_else(|| self.registry.primary_filesystem().to_string())
    }

    async fn run_provision(
        &self,
        cluster_id: &str,
        backend: &dyn ScaleBackend,
        request: &ProvisionRequest,
        group: Option<&str>,
    ) -> Result<FilesetRef, CsiError> {
        let plan = &request.plan;
        let capacity = request.capacity();

        let cluster = backend.get_cluster_info().await?;
        if plan.permissions.is_some() {
            CsiError::require_version("the permissions parameter", &min_permissions_version(), &cluster.version)?;
        }
        if group.is_some() {
            CsiError::require_version(
                "consistency group volumes",
                &min_consistency_group_version(),
                &cluster.version,
            )?;
        }
        if let Some(ContentSeed::Snapshot { .. }) = &request.seed {
            CsiError::require_version("restoring a snapshot", &min_snapshot_copy_version(), &cluster.version)?;
        }

        let filesystem_name = self.target_filesystem(plan);
        let fs = backend
            .get_filesystem_info(&filesystem_name)
            .await
            .map_err(|e| match e {
                BackendError::NotFound(_) => CsiError::invalid(format!(
                    "filesystem {} does not exist on cluster {}",
                    filesystem_name, cluster_id
                )),
                other => other.into(),
            })?;

        for policy in placement_policies(plan) {
            debug!(partition = %policy.partition, "Applying placement policy");
            backend.set_policy(&fs.name, &policy.partition, &policy.rules).await?;
        }

        let provisioned = match &plan.layout {
            VolumeLayout::Lightweight { base_path } => {
                self.provision_directory(cluster_id, backend, &fs, &request.name, plan, base_path)
                    .await?
            }
            _ => {
                self.provision_fileset(cluster_id, backend, &fs, request, capacity, group)
                    .await?
            }
        };

        if let Some(seed) = &request.seed {
            if let Err(err) = apply_seed(backend, seed, &provisioned.identity.path).await {
                warn!(volume = %request.name, "Seeding volume content failed: {}", err);
                if provisioned.created {
                    self.rollback(backend, &fs, &provisioned.identity, &request.name).await;
                    if let Some(group) = group {
                        let _guard = self.locks.lock(group_key(&fs.name, group)).await;
                        if let Err(e) = self.collect_group_locked(backend, &fs, group).await {
                            warn!(group, "Consistency group cleanup after rollback failed: {}", e);
                        }
                    }
                }
                return Err(err);
            }
        }

        Ok(FilesetRef {
            identity: provisioned.identity,
            filesystem: fs.name,
            capacity_bytes: request.applied_capacity(),
        })
    }

    async fn provision_directory(
        &self,
        cluster_id: &str,
        backend: &dyn ScaleBackend,
        fs: &FilesystemInfo,
        name: &str,
        plan: &StorageClassPlan,
        base_path: &str,
    ) -> Result<Provisioned, CsiError> {
        let relative = join_path(base_path, name).trim_start_matches('/').to_string();
        let mode = plan.effective_permissions().unwrap_or(Permissions::DEFAULT_DIRECTORY);
        let spec = DirectorySpec {
            path: relative.clone(),
            uid: plan.uid.clone(),
            gid: plan.gid.clone(),
            permissions: Some(mode.to_string()),
        };

        let created = match backend.create_directory(&fs.name, &spec).await {
            Ok(()) => true,
            Err(BackendError::AlreadyExists(_)) => {
                debug!(path = %relative, "Directory already exists, converging");
                false
            }
            Err(err) => return Err(err.into()),
        };

        let identity = VolumeIdentity {
            storage_class_type: plan.storage_class_type(),
            volume_type: plan.volume_type(),
            cluster_id: cluster_id.to_string(),
            filesystem_uid: fs.uuid.clone(),
            consistency_group: None,
            fileset: LIGHTWEIGHT_FILESET.to_string(),
            path: join_path(&fs.mount_point, &relative),
        };

        if let Some(mode) = plan.effective_permissions() {
            if let Err(err) = backend.set_acl(&fs.name, &relative, &mode.to_acl()).await {
                if created {
                    self.rollback(backend, fs, &identity, name).await;
                }
                return Err(err.into());
            }
        }

        Ok(Provisioned { identity, created })
    }

    async fn provision_fileset(
        &self,
        cluster_id: &str,
        backend: &dyn ScaleBackend,
        fs: &FilesystemInfo,
        request: &ProvisionRequest,
        capacity: u64,
        group: Option<&str>,
    ) -> Result<Provisioned, CsiError> {
        let plan = &request.plan;
        let fileset = fileset_name(&request.name, plan);
        if fileset.len() > MAX_FILESET_NAME_LEN {
            return Err(CsiError::invalid(format!(
                "fileset name {} exceeds {} characters",
                fileset, MAX_FILESET_NAME_LEN
            )));
        }

        let mut _group_guard = None;
        let (inode_space, parent_junction) = match &plan.layout {
            VolumeLayout::Independent => (InodeSpace::New, fs.mount_point.clone()),
            VolumeLayout::Dependent { parent } if parent == ROOT_FILESET => {
                (InodeSpace::Shared(parent.clone()), fs.mount_point.clone())
            }
            VolumeLayout::Dependent { parent } => {
                let info = backend.get_fileset(&fs.name, parent).await.map_err(|e| match e {
                    BackendError::NotFound(_) => {
                        CsiError::invalid(format!("parent fileset {} does not exist on {}", parent, fs.name))
                    }
                    other => other.into(),
                })?;
                let junction = info
                    .path
                    .ok_or_else(|| CsiError::invalid(format!("parent fileset {} is not linked", parent)))?;
                (InodeSpace::Shared(parent.clone()), junction)
            }
            VolumeLayout::ConsistencyGroup { .. } => {
                let group = group.ok_or_else(|| CsiError::internal("consistency group name missing"))?;
                _group_guard = Some(self.locks.lock(group_key(&fs.name, group)).await);
                let junction = self.ensure_group(backend, fs, group, plan).await?;
                (InodeSpace::Shared(group.to_string()), junction)
            }
            VolumeLayout::Lightweight { .. } => {
                return Err(CsiError::internal("directory volumes are not filesets"));
            }
        };

        let spec = FilesetSpec {
            name: fileset.clone(),
            inode_space,
            max_inodes: plan.inode_limit_for(capacity),
            owner: plan.owner(),
            permissions: plan.effective_permissions().map(|p| p.to_string()),
            comment: FILESET_COMMENT.to_string(),
        };

        let (info, created) = match backend.create_fileset(&fs.name, &spec).await {
            Ok(info) => {
                info!(fileset = %fileset, filesystem = %fs.name, "Created fileset");
                (info, true)
            }
            Err(BackendError::AlreadyExists(_)) => {
                let existing = backend.get_fileset(&fs.name, &fileset).await?;
                verify_existing(&existing, &spec)?;
                info!(fileset = %fileset, "Fileset already exists, converging");
                (existing, false)
            }
            Err(err) => return Err(err.into()),
        };

        let junction = join_path(&parent_junction, &fileset);
        let limits = QuotaLimits::for_capacity(capacity, spec.max_inodes);
        match self.finish_fileset(backend, fs, &info, &junction, &limits, plan, created).await {
            Ok(path) => Ok(Provisioned {
                identity: VolumeIdentity {
                    storage_class_type: plan.storage_class_type(),
                    volume_type: plan.volume_type(),
                    cluster_id: cluster_id.to_string(),
                    filesystem_uid: fs.uuid.clone(),
                    consistency_group: group.map(str::to_string),
                    fileset,
                    path,
                },
                created,
            }),
            Err(err) => {
                if created {
                    self.rollback_fileset(backend, &fs.name, &fileset, &request.name).await;
                    if let Some(group) = group {
                        if let Err(e) = self.collect_group_locked(backend, fs, group).await {
                            warn!(group, "Consistency group cleanup after rollback failed: {}", e);
                        }
                    }
                }
                Err(err)
            }
        }
    }

    /// Link, quota and ACL for a created or adopted fileset; returns the junction
    #[allow(clippy::too_many_arguments)]
    async fn finish_fileset(
        &self,
        backend: &dyn ScaleBackend,
        fs: &FilesystemInfo,
        info: &FilesetInfo,
        junction: &str,
        limits: &QuotaLimits,
        plan: &StorageClassPlan,
        created: bool,
    ) -> Result<String, CsiError> {
        let path = match &info.path {
            Some(linked) => {
                if linked != junction {
                    debug!(fileset = %info.name, linked = %linked, "Fileset already linked elsewhere, keeping junction");
                }
                linked.clone()
            }
            None => {
                backend.link_fileset(&fs.name, &info.name, junction).await?;
                self.wait_for_link(backend, &fs.name, &info.name).await?
            }
        };

        if !created {
            let current = backend.get_quota(&fs.name, &info.name).await?;
            if current.block_limit_kib != 0 && current.block_limit_kib != limits.block_limit_kib {
                return Err(CsiError::AlreadyExists(format!(
                    "fileset {} already exists with a block limit of {} KiB, requested {} KiB",
                    info.name, current.block_limit_kib, limits.block_limit_kib
                )));
            }
        }
        backend.set_quota(&fs.name, &info.name, limits).await?;

        if let Some(mode) = plan.effective_permissions() {
            let relative = relative_path(&fs.mount_point, &path).ok_or_else(|| {
                CsiError::internal(format!("junction {} is outside mount point {}", path, fs.mount_point))
            })?;
            backend.set_acl(&fs.name, &relative, &mode.to_acl()).await?;
        }

        Ok(path)
    }

    async fn wait_for_link(&self, backend: &dyn ScaleBackend, filesystem: &str, name: &str) -> Result<String, CsiError> {
        let what = format!("link of fileset {}", name);
        poll_until(&self.link_wait, &what, move || async move {
            let info = backend.get_fileset(filesystem, name).await?;
            Ok::<_, BackendError>(info.path)
        })
        .await
        .map_err(CsiError::from)
    }

    /// Create and link the consistency-group fileset if needed; returns its junction
    async fn ensure_group(
        &self,
        backend: &dyn ScaleBackend,
        fs: &FilesystemInfo,
        group: &str,
        plan: &StorageClassPlan,
    ) -> Result<String, CsiError> {
        let info = match backend.get_fileset(&fs.name, group).await {
            Ok(info) => {
                if !info.independent {
                    return Err(CsiError::invalid(format!(
                        "consistency group fileset {} exists but is not independent",
                        group
                    )));
                }
                info
            }
            Err(BackendError::NotFound(_)) => {
                info!(group, filesystem = %fs.name, "Creating consistency group fileset");
                let spec = FilesetSpec {
                    name: group.to_string(),
                    inode_space: InodeSpace::New,
                    max_inodes: plan.group_inode_limit(),
                    owner: None,
                    permissions: None,
                    comment: FILESET_COMMENT.to_string(),
                };
                match backend.create_fileset(&fs.name, &spec).await {
                    Ok(info) => info,
                    Err(BackendError::AlreadyExists(_)) => backend.get_fileset(&fs.name, group).await?,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        match info.path {
            Some(path) => Ok(path),
            None => {
                backend
                    .link_fileset(&fs.name, group, &join_path(&fs.mount_point, group))
                    .await?;
                self.wait_for_link(backend, &fs.name, group).await
            }
        }
    }

    async fn rollback(&self, backend: &dyn ScaleBackend, fs: &FilesystemInfo, identity: &VolumeIdentity, volume: &str) {
        if identity.is_lightweight() {
            let Some(relative) = relative_path(&fs.mount_point, &identity.path) else {
                return;
            };
            warn!(volume, path = %relative, "Rolling back directory");
            match backend.delete_directory(&fs.name, &relative).await {
                Ok(()) | Err(BackendError::NotFound(_)) => self.publish_rolled_back(volume, &relative),
                Err(e) => error!(volume, "Rollback of directory {} failed: {}", relative, e),
            }
        } else {
            self.rollback_fileset(backend, &fs.name, &identity.fileset, volume).await;
        }
    }

    async fn rollback_fileset(&self, backend: &dyn ScaleBackend, filesystem: &str, fileset: &str, volume: &str) {
        warn!(volume, fileset, "Rolling back fileset");
        if let Err(e) = backend.unlink_fileset(filesystem, fileset).await {
            if !e.is_not_found() {
                error!(fileset, "Unlink during rollback failed: {}", e);
            }
        }
        match backend.delete_fileset(filesystem, fileset).await {
            Ok(()) | Err(BackendError::NotFound(_)) => self.publish_rolled_back(volume, fileset),
            Err(e) => error!(fileset, "Rollback of fileset failed: {}", e),
        }
    }

    fn publish_rolled_back(&self, volume: &str, object: &str) {
        self.event_bus.publish_volume_event(VolumeEvent::ProvisionRolledBack {
            name: volume.to_string(),
            fileset: object.to_string(),
            rolled_back_at: Utc::now(),
        });
    }

    /// Unlink and delete; a fileset relinked in between is unlinked once more
    async fn remove_fileset(&self, backend: &dyn ScaleBackend, filesystem: &str, name: &str) -> Result<(), CsiError> {
        match backend.unlink_fileset(filesystem, name).await {
            Ok(()) => {}
            Err(BackendError::NotFound(_)) => {
                debug!(fileset = name, "Fileset already gone");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        match backend.delete_fileset(filesystem, name).await {
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(BackendError::FilesetBusy(msg)) => {
                warn!(fileset = name, "Fileset busy on delete ({}), unlinking again", msg);
                backend.unlink_fileset(filesystem, name).await?;
                match backend.delete_fileset(filesystem, name).await {
                    Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn collect_group(&self, backend: &dyn ScaleBackend, fs: &FilesystemInfo, group: &str) -> Result<(), CsiError> {
        let _guard = self.locks.lock(group_key(&fs.name, group)).await;
        self.collect_group_locked(backend, fs, group).await
    }

    /// Delete a consistency-group fileset that has neither members nor snapshots
    async fn collect_group_locked(&self, backend: &dyn ScaleBackend, fs: &FilesystemInfo, group: &str) -> Result<(), CsiError> {
        let group_info = match backend.get_fileset(&fs.name, group).await {
            Ok(info) => info,
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let members = backend
            .list_filesets(&fs.name)
            .await?
            .into_iter()
            .filter(|f| f.name != group && f.inode_space == group_info.inode_space)
            .count();
        if members > 0 {
            debug!(group, members, "Consistency group still has members");
            return Ok(());
        }
        if !backend.list_snapshots(&fs.name, group).await?.is_empty() {
            debug!(group, "Consistency group still has snapshots");
            return Ok(());
        }

        info!(group, filesystem = %fs.name, "Collecting empty consistency group");
        self.remove_fileset(backend, &fs.name, group).await?;
        self.event_bus.publish_volume_event(VolumeEvent::ConsistencyGroupCollected {
            filesystem: fs.name.clone(),
            group: group.to_string(),
            collected_at: Utc::now(),
        });
        Ok(())
    }

    async fn forget(&self, volume_id: &str) {
        for record in self.repository.list().await {
            if record.fileset.as_ref().is_some_and(|f| f.volume_id() == volume_id) {
                self.repository.delete(&record.name).await;
            }
        }
    }

    async fn record_capacity(&self, volume_id: &str, capacity_bytes: u64) {
        for mut record in self.repository.list().await {
            if let Some(fileset) = record.fileset.as_mut().filter(|f| f.volume_id() == volume_id) {
                fileset.capacity_bytes = capacity_bytes;
                self.repository.save(&record).await;
            }
        }
    }
}

#[async_trait]
impl FilesetService for StandardFilesetService {
    async fn provision(&self, request: ProvisionRequest) -> Result<FilesetRef, CsiError> {
        validate_volume_name(&request.name)?;
        let capacity = request.applied_capacity();
        let group = match request.plan.layout {
            VolumeLayout::ConsistencyGroup { .. } => Some(request.plan.consistency_group_name().ok_or_else(|| {
                CsiError::invalid("consistency group volumes need a consistencyGroup parameter or a PVC namespace")
            })?),
            _ => None,
        };
        let cluster_id = self.target_cluster(&request.plan);
        let backend = self.registry.backend(Some(&cluster_id))?;

        let _guard = self.locks.lock(volume_key(&request.object_name())).await;

        let existing = self.repository.find_by_name(&request.name).await;
        if let Some(fileset) = existing.as_ref().filter(|r| r.is_settled()).and_then(|r| r.fileset.clone()) {
            if fileset.capacity_bytes != capacity {
                return Err(CsiError::AlreadyExists(format!(
                    "volume {} already exists with capacity {} bytes",
                    request.name, fileset.capacity_bytes
                )));
            }
            debug!(volume = %request.name, "Volume already provisioned");
            return Ok(fileset);
        }

        let mut record = existing.unwrap_or_else(|| VolumeRecord::new(request.name.clone()));
        if record.state != FilesetState::Creating {
            record.mark_creating()?;
        }
        self.repository.save(&record).await;

        info!(
            "Provisioning volume '{}' (layout: {:?}, capacity: {} bytes, cluster: {})",
            request.name, request.plan.layout, capacity, cluster_id
        );

        match self
            .run_provision(&cluster_id, backend.as_ref(), &request, group.as_deref())
            .await
        {
            Ok(fileset) => {
                record.mark_linked(fileset.clone())?;
                record.mark_bound()?;
                self.repository.save(&record).await;

                self.event_bus.publish_volume_event(VolumeEvent::VolumeProvisioned {
                    name: request.name.clone(),
                    volume_id: fileset.volume_id(),
                    capacity_bytes: fileset.capacity_bytes,
                    provisioned_at: Utc::now(),
                });
                info!("Volume '{}' provisioned at {}", request.name, fileset.identity.path);
                Ok(fileset)
            }
            Err(err) => {
                record.mark_failed(err.to_string());
                self.repository.save(&record).await;
                self.event_bus.publish_volume_event(VolumeEvent::VolumeProvisionFailed {
                    name: request.name.clone(),
                    reason: err.to_string(),
                    failed_at: Utc::now(),
                });
                warn!("Provisioning volume '{}' failed: {}", request.name, err);
                Err(err)
            }
        }
    }

    async fn deprovision(&self, volume_id: &str) -> Result<(), CsiError> {
        let identity = match VolumeIdentity::decode(volume_id) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(volume_id, "Ignoring delete of undecodable volume handle: {}", err);
                return Ok(());
            }
        };

        let located = match locate(&self.registry, &identity).await {
            Ok(located) => located,
            Err(CsiError::NotFound(msg)) => {
                warn!(volume_id, "Filesystem of volume is gone ({}), nothing to delete", msg);
                self.forget(volume_id).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let backend = located.backend.as_ref();
        let fs = &located.filesystem;

        let object = if identity.is_lightweight() {
            identity.path.rsplit('/').next().unwrap_or_default().to_string()
        } else {
            identity.fileset.clone()
        };
        let _guard = self.locks.lock(volume_key(&object)).await;

        info!("Deprovisioning volume {}", volume_id);
        if identity.is_lightweight() {
            let relative = located.relative_path()?;
            match backend.delete_directory(&fs.name, &relative).await {
                Ok(()) => {}
                Err(BackendError::NotFound(_)) => debug!(path = %relative, "Directory already gone"),
                Err(err) => return Err(err.into()),
            }
        } else {
            self.remove_fileset(backend, &fs.name, &identity.fileset).await?;
            if let Some(group) = &identity.consistency_group {
                self.collect_group(backend, fs, group).await?;
            }
        }

        self.forget(volume_id).await;
        self.event_bus.publish_volume_event(VolumeEvent::VolumeDeprovisioned {
            volume_id: volume_id.to_string(),
            deprovisioned_at: Utc::now(),
        });
        info!("Volume {} deprovisioned", volume_id);
        Ok(())
    }

    async fn expand(&self, volume_id: &str, capacity_bytes: u64) -> Result<u64, CsiError> {
        let identity = VolumeIdentity::decode(volume_id)?;
        if identity.is_lightweight() {
            debug!(volume_id, "Directory volumes carry no quota, nothing to expand");
            return Ok(capacity_bytes);
        }

        let located = locate(&self.registry, &identity).await?;
        let fs = &located.filesystem;
        let _guard = self.locks.lock(volume_key(&identity.fileset)).await;

        let current = located.backend.get_quota(&fs.name, &identity.fileset).await?;
        let requested_kib = block_limit_kib(capacity_bytes);
        if current.block_limit_kib > requested_kib {
            return Err(CsiError::invalid(format!(
                "volume {} cannot shrink from {} KiB to {} KiB",
                identity.fileset, current.block_limit_kib, requested_kib
            )));
        }
        if current.block_limit_kib == requested_kib {
            debug!(volume_id, "Quota already at requested size");
            return Ok(current.capacity_bytes());
        }

        let limits = QuotaLimits {
            block_limit_kib: requested_kib,
            inode_limit: current.inode_limit,
        };
        located.backend.set_quota(&fs.name, &identity.fileset, &limits).await?;
        self.record_capacity(volume_id, limits.capacity_bytes()).await;

        self.event_bus.publish_volume_event(VolumeEvent::VolumeExpanded {
            volume_id: volume_id.to_string(),
            old_capacity_bytes: current.capacity_bytes(),
            new_capacity_bytes: limits.capacity_bytes(),
            expanded_at: Utc::now(),
        });
        info!(
            "Volume {} expanded from {} KiB to {} KiB",
            identity.fileset, current.block_limit_kib, limits.block_limit_kib
        );
        Ok(limits.capacity_bytes())
    }

    async fn clone_volume(&self, source_volume_id: &str, request: ProvisionRequest) -> Result<FilesetRef, CsiError> {
        let source = VolumeIdentity::decode(source_volume_id)?;
        let plan = &request.plan;

        let same_class = source.cluster_id == self.target_cluster(plan)
            && source.storage_class_type == plan.storage_class_type()
            && source.volume_type == plan.volume_type();
        if !same_class {
            return Err(CsiError::invalid(CLONE_CLASS_MISMATCH));
        }

        let located = locate(&self.registry, &source).await?;
        if located.filesystem.name != self.target_filesystem(plan) {
            return Err(CsiError::invalid(CLONE_CLASS_MISMATCH));
        }

        if !source.is_lightweight() {
            let quota = located
                .backend
                .get_quota(&located.filesystem.name, &source.fileset)
                .await?;
            if block_limit_kib(request.capacity()) < quota.block_limit_kib {
                return Err(CsiError::invalid(format!(
                    "requested capacity {} bytes is smaller than source volume capacity {} bytes",
                    request.capacity(),
                    quota.capacity_bytes()
                )));
            }
        }

        let seed = ContentSeed::Volume {
            filesystem: located.filesystem.name.clone(),
            source_path: located.relative_path()?,
        };
        let fileset = self.provision(request.with_seed(seed)).await?;

        self.event_bus.publish_volume_event(VolumeEvent::VolumeCloned {
            source_volume_id: source_volume_id.to_string(),
            volume_id: fileset.volume_id(),
            cloned_at: Utc::now(),
        });
        info!("Volume {} cloned from {}", fileset.identity.path, source.path);
        Ok(fileset)
    }

    async fn resolve_ref(&self, volume_id: &str) -> Result<FilesetRef, CsiError> {
        let identity = VolumeIdentity::decode(volume_id)?;
        let located = locate(&self.registry, &identity).await?;
        let fs = &located.filesystem;

        let capacity_bytes = if identity.is_lightweight() {
            located.backend.get_acl(&fs.name, &located.relative_path()?).await?;
            0
        } else {
            located.backend.get_fileset(&fs.name, &identity.fileset).await?;
            located
                .backend
                .get_quota(&fs.name, &identity.fileset)
                .await?
                .capacity_bytes()
        };

        Ok(FilesetRef {
            identity,
            filesystem: fs.name.clone(),
            capacity_bytes,
        })
    }

    async fn collect_consistency_group(&self, cluster_id: &str, filesystem: &str, group: &str) -> Result<(), CsiError> {
        let backend = self.registry.backend(Some(cluster_id))?;
        let fs = match backend.get_filesystem_info(filesystem).await {
            Ok(fs) => fs,
            Err(BackendError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        self.collect_group(backend.as_ref(), &fs, group).await
    }
}

async fn apply_seed(backend: &dyn ScaleBackend, seed: &ContentSeed, target_path: &str) -> Result<(), CsiError> {
    match seed {
        ContentSeed::Volume {
            filesystem,
            source_path,
        } => {
            info!(source = %source_path, target = target_path, "Copying volume content");
            backend.copy_directory(filesystem, source_path, target_path).await?;
        }
        ContentSeed::Snapshot {
            filesystem,
            fileset,
            snapshot,
            source_path,
        } => {
            info!(fileset = %fileset, snapshot = %snapshot, target = target_path, "Copying snapshot content");
            backend
                .copy_snapshot(filesystem, fileset, snapshot, source_path, target_path)
                .await?;
        }
    }
    Ok(())
}

/// An existing fileset may be adopted only if this driver made it with the same shape
fn verify_existing(existing: &FilesetInfo, spec: &FilesetSpec) -> Result<(), CsiError> {
    if existing.comment.as_deref() != Some(FILESET_COMMENT) {
        return Err(CsiError::AlreadyExists(format!(
            "fileset {} already exists and was not created by this driver",
            existing.name
        )));
    }
    let want_independent = spec.inode_space == InodeSpace::New;
    if existing.independent != want_independent {
        let kind = |independent: bool| if independent { "an independent" } else { "a dependent" };
        return Err(CsiError::AlreadyExists(format!(
            "fileset {} already exists as {} fileset, requested {}",
            existing.name,
            kind(existing.independent),
            kind(want_independent)
        )));
    }
    Ok(())
}
