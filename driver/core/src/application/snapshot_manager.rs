// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Snapshot Application Service
//!
//! Fileset snapshots and their restore into new volumes. Classic volumes
//! snapshot their own independent fileset; consistency-group members are
//! captured by a snapshot of the group fileset, and the handle remembers
//! which member directory inside it belongs to the volume.
//!
//! Creates for the same `(filesystem, fileset, name)` are coalesced behind
//! one key lock, and deletes of that snapshot wait on the same key.
//!
//! A group fileset snapshot can back several member handles. The service
//! keeps the set of live handles per backend snapshot and removes the
//! snapshot only when the last of them is deleted.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::application::fileset_manager::{ContentSeed, FilesetService, ProvisionRequest};
use crate::application::locks::KeyedLocks;
use crate::application::{locate, LocatedVolume};
use crate::domain::backend::{BackendError, SnapshotInfo};
use crate::domain::error::CsiError;
use crate::domain::events::SnapshotEvent;
use crate::domain::fileset::{validate_volume_name, FilesetRef};
use crate::domain::snapshot::{
    min_group_snapshot_version, min_snapshot_version, snapshot_key, GroupSnapshot, SnapshotRef, SnapshotState,
};
use crate::domain::storage_class::VolumeLayout;
use crate::domain::volume_handle::{SnapshotIdentity, StorageClassType, VolumeIdentity, VolumeType};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::scale::ClusterRegistry;

#[async_trait]
pub trait SnapshotService: Send + Sync {
    /// Snapshot the volume behind a handle; repeated calls return the same snapshot
    async fn create_snapshot(&self, source_volume_id: &str, name: &str) -> Result<SnapshotRef, CsiError>;

    /// Delete the snapshot behind a handle; missing snapshots are success
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError>;

    /// Provision a new volume with the content of a snapshot
    async fn restore_to_fileset(&self, snapshot_id: &str, request: ProvisionRequest) -> Result<FilesetRef, CsiError>;

    /// One snapshot of a consistency group covering the given members
    async fn create_group_snapshot(&self, member_volume_ids: &[String], name: &str) -> Result<GroupSnapshot, CsiError>;
}

pub struct StandardSnapshotService {
    registry: ClusterRegistry,
    filesets: Arc<dyn FilesetService>,
    event_bus: Arc<EventBus>,
    locks: KeyedLocks,
    /// Live member handles per group snapshot key
    group_holders: DashMap<String, HashSet<String>>,
}

impl StandardSnapshotService {
    pub fn new(
        registry: ClusterRegistry,
        filesets: Arc<dyn FilesetService>,
        event_bus: Arc<EventBus>,
        locks: KeyedLocks,
    ) -> Self {
        Self {
            registry,
            filesets,
            event_bus,
            locks,
            group_holders: DashMap::new(),
        }
    }

    fn publish_failed(&self, name: &str, err: &CsiError) {
        self.event_bus.publish_snapshot_event(SnapshotEvent::SnapshotFailed {
            name: name.to_string(),
            reason: err.to_string(),
            failed_at: Utc::now(),
        });
    }

    /// Take (or find) snapshot `name` of `fileset` under its key lock.
    ///
    /// `holders` are the group member handles that will point at it.
    async fn ensure_snapshot(
        &self,
        located: &LocatedVolume,
        fileset: &str,
        name: &str,
        holders: Vec<String>,
    ) -> Result<SnapshotInfo, CsiError> {
        let fs = &located.filesystem.name;
        let key = snapshot_key(fs, fileset, name);
        let _guard = self.locks.lock(key.clone()).await;

        let info = match find_snapshot(located, fileset, name).await? {
            Some(existing) => {
                debug!(fileset, snapshot = name, "Snapshot already exists");
                existing
            }
            None => match located.backend.create_snapshot(fs, fileset, name).await {
                Ok(info) => {
                    info!(fileset, snapshot = name, filesystem = %fs, "Created snapshot");
                    info
                }
                Err(BackendError::AlreadyExists(_)) => find_snapshot(located, fileset, name)
                    .await?
                    .ok_or_else(|| CsiError::internal(format!("snapshot {} reported as existing but not listed", name)))?,
                Err(err) => return Err(err.into()),
            },
        };

        if !holders.is_empty() {
            self.group_holders.entry(key).or_default().extend(holders);
        }
        Ok(info)
    }

    /// Drop one handle of a group snapshot; true while other handles remain
    fn release_holder(&self, key: &str, snapshot_id: &str) -> bool {
        {
            let Some(mut holders) = self.group_holders.get_mut(key) else {
                return false;
            };
            holders.remove(snapshot_id);
            if !holders.is_empty() {
                return true;
            }
        }
        self.group_holders.remove(key);
        false
    }

    fn snapshot_ref(&self, located: &LocatedVolume, info: &SnapshotInfo, size_bytes: u64) -> SnapshotRef {
        let identity = &located.identity;
        SnapshotRef {
            identity: snapshot_identity(identity, &info.name),
            filesystem: located.filesystem.name.clone(),
            source_volume_id: identity.encode(),
            created_at: info.created_at.unwrap_or_else(Utc::now),
            size_bytes,
            state: SnapshotState::Ready,
        }
    }

    async fn take_snapshot(&self, source_volume_id: &str, name: &str) -> Result<SnapshotRef, CsiError> {
        validate_volume_name(name)?;
        let identity = VolumeIdentity::decode(source_volume_id)?;
        let group = snapshot_scope(&identity)?;

        let located = locate(&self.registry, &identity).await?;
        let cluster = located.backend.get_cluster_info().await?;
        match group {
            Some(_) => CsiError::require_version(
                "consistency group snapshots",
                &min_group_snapshot_version(),
                &cluster.version,
            )?,
            None => CsiError::require_version("snapshots", &min_snapshot_version(), &cluster.version)?,
        }

        let fs = &located.filesystem.name;
        located.backend.get_fileset(fs, &identity.fileset).await?;
        let size_bytes = located.backend.get_quota(fs, &identity.fileset).await?.capacity_bytes();

        let fileset = group.unwrap_or(&identity.fileset);
        let holders = match group {
            Some(_) => vec![snapshot_identity(&identity, name).encode()],
            None => Vec::new(),
        };
        let info = self.ensure_snapshot(&located, fileset, name, holders).await?;
        Ok(self.snapshot_ref(&located, &info, size_bytes))
    }
}

#[async_trait]
impl SnapshotService for StandardSnapshotService {
    async fn create_snapshot(&self, source_volume_id: &str, name: &str) -> Result<SnapshotRef, CsiError> {
        info!("Creating snapshot '{}' of volume {}", name, source_volume_id);
        match self.take_snapshot(source_volume_id, name).await {
            Ok(snapshot) => {
                self.event_bus.publish_snapshot_event(SnapshotEvent::SnapshotCreated {
                    snapshot_id: snapshot.snapshot_id(),
                    source_volume_id: source_volume_id.to_string(),
                    created_at: snapshot.created_at,
                });
                Ok(snapshot)
            }
            Err(err) => {
                warn!("Snapshot '{}' failed: {}", name, err);
                self.publish_failed(name, &err);
                Err(err)
            }
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<(), CsiError> {
        let identity = match SnapshotIdentity::decode(snapshot_id) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(snapshot_id, "Ignoring delete of undecodable snapshot handle: {}", err);
                return Ok(());
            }
        };

        let backend = self.registry.backend(Some(&identity.cluster_id))?;
        let fs = match backend.get_filesystem_name(&identity.filesystem_uid).await {
            Ok(fs) => fs,
            Err(BackendError::NotFound(_)) => {
                warn!(snapshot_id, "Filesystem of snapshot is gone, nothing to delete");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let fileset = identity.snapshot_fileset();
        {
            let key = snapshot_key(&fs, fileset, &identity.snapshot_name);
            let _guard = self.locks.lock(key.clone()).await;
            if identity.consistency_group.is_some() && self.release_holder(&key, &identity.encode()) {
                info!(fileset, snapshot = %identity.snapshot_name, "Snapshot still backs other group members, keeping it");
            } else {
                match backend.delete_snapshot(&fs, fileset, &identity.snapshot_name).await {
                    Ok(()) => info!(fileset, snapshot = %identity.snapshot_name, "Deleted snapshot"),
                    Err(BackendError::NotFound(_)) => debug!(snapshot_id, "Snapshot already gone"),
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if let Some(group) = &identity.consistency_group {
            self.filesets
                .collect_consistency_group(&identity.cluster_id, &fs, group)
                .await?;
        }

        self.event_bus.publish_snapshot_event(SnapshotEvent::SnapshotDeleted {
            snapshot_id: snapshot_id.to_string(),
            deleted_at: Utc::now(),
        });
        Ok(())
    }

    async fn restore_to_fileset(&self, snapshot_id: &str, request: ProvisionRequest) -> Result<FilesetRef, CsiError> {
        let snapshot = SnapshotIdentity::decode(snapshot_id)?;
        let target_cluster = self.registry.provisioning_cluster(request.plan.cluster_id.as_deref());

        if matches!(request.plan.layout, VolumeLayout::Lightweight { .. }) && self.registry.is_remote(&target_cluster) {
            return Err(CsiError::unsupported(format!(
                "restoring a snapshot into a directory volume on remote cluster {} is not supported",
                target_cluster
            )));
        }
        if snapshot.cluster_id != target_cluster {
            return Err(CsiError::unsupported(format!(
                "snapshot on cluster {} cannot be restored to cluster {}",
                snapshot.cluster_id, target_cluster
            )));
        }

        let backend = self.registry.backend(Some(&snapshot.cluster_id))?;
        let fs = backend.get_filesystem_name(&snapshot.filesystem_uid).await?;
        let fileset = snapshot.snapshot_fileset().to_string();
        let exists = backend
            .list_snapshots(&fs, &fileset)
            .await?
            .iter()
            .any(|s| s.name == snapshot.snapshot_name);
        if !exists {
            return Err(CsiError::NotFound(format!(
                "snapshot {} of fileset {} does not exist",
                snapshot.snapshot_name, fileset
            )));
        }

        let source_path = match &snapshot.consistency_group {
            Some(_) => snapshot.fileset.clone(),
            None => String::new(),
        };
        let seed = ContentSeed::Snapshot {
            filesystem: fs,
            fileset,
            snapshot: snapshot.snapshot_name.clone(),
            source_path,
        };

        info!("Restoring snapshot {} into volume '{}'", snapshot.snapshot_name, request.name);
        let restored = self.filesets.provision(request.with_seed(seed)).await?;
        self.event_bus.publish_snapshot_event(SnapshotEvent::SnapshotRestored {
            snapshot_id: snapshot_id.to_string(),
            volume_id: restored.volume_id(),
            restored_at: Utc::now(),
        });
        Ok(restored)
    }

    async fn create_group_snapshot(&self, member_volume_ids: &[String], name: &str) -> Result<GroupSnapshot, CsiError> {
        validate_volume_name(name)?;
        let members = member_volume_ids
            .iter()
            .map(|id| VolumeIdentity::decode(id))
            .collect::<Result<Vec<_>, _>>()?;
        let first = members
            .first()
            .ok_or_else(|| CsiError::invalid("a group snapshot needs at least one member volume"))?;
        let group = first
            .consistency_group
            .clone()
            .ok_or_else(|| CsiError::invalid(format!("volume {} is not in a consistency group", first.fileset)))?;
        for member in &members {
            let same_group = member.consistency_group.as_deref() == Some(group.as_str())
                && member.cluster_id == first.cluster_id
                && member.filesystem_uid == first.filesystem_uid;
            if !same_group {
                return Err(CsiError::invalid(format!(
                    "volume {} is not a member of consistency group {}",
                    member.fileset, group
                )));
            }
        }

        let located = locate(&self.registry, first).await?;
        let fs = located.filesystem.name.clone();
        let cluster = located.backend.get_cluster_info().await?;
        CsiError::require_version("consistency group snapshots", &min_group_snapshot_version(), &cluster.version)?;

        // Every member must resolve before the snapshot exists
        let group_info = located.backend.get_fileset(&fs, &group).await?;
        let mut sizes = Vec::with_capacity(members.len());
        for member in &members {
            let info = located.backend.get_fileset(&fs, &member.fileset).await?;
            if info.inode_space != group_info.inode_space {
                return Err(CsiError::invalid(format!(
                    "fileset {} is not part of consistency group {}",
                    member.fileset, group
                )));
            }
            sizes.push(located.backend.get_quota(&fs, &member.fileset).await?.capacity_bytes());
        }

        let holders = members.iter().map(|m| snapshot_identity(m, name).encode()).collect();
        let info = match self.ensure_snapshot(&located, &group, name, holders).await {
            Ok(info) => info,
            Err(err) => {
                self.publish_failed(name, &err);
                return Err(err);
            }
        };

        let refs: Vec<SnapshotRef> = members
            .into_iter()
            .zip(sizes)
            .map(|(identity, size)| {
                let member = LocatedVolume {
                    identity,
                    filesystem: located.filesystem.clone(),
                    backend: located.backend.clone(),
                };
                self.snapshot_ref(&member, &info, size)
            })
            .collect();

        for snapshot in &refs {
            self.event_bus.publish_snapshot_event(SnapshotEvent::SnapshotCreated {
                snapshot_id: snapshot.snapshot_id(),
                source_volume_id: snapshot.source_volume_id.clone(),
                created_at: snapshot.created_at,
            });
        }
        info!(group = %group, snapshot = name, members = refs.len(), "Created consistency group snapshot");

        Ok(GroupSnapshot {
            group,
            snapshot_name: info.name,
            members: refs,
        })
    }
}

fn snapshot_identity(volume: &VolumeIdentity, name: &str) -> SnapshotIdentity {
    SnapshotIdentity {
        cluster_id: volume.cluster_id.clone(),
        filesystem_uid: volume.filesystem_uid.clone(),
        fileset: volume.fileset.clone(),
        snapshot_name: name.to_string(),
        path: volume.path.clone(),
        consistency_group: volume.consistency_group.clone(),
    }
}

/// Fileset that holds a volume's snapshots: `Some(group)` for group members
fn snapshot_scope(identity: &VolumeIdentity) -> Result<Option<&str>, CsiError> {
    match (identity.storage_class_type, identity.volume_type) {
        (_, VolumeType::Lightweight) => Err(CsiError::invalid(
            "snapshots are not supported for directory-based volumes",
        )),
        (StorageClassType::Advanced, _) => identity
            .consistency_group
            .as_deref()
            .map(Some)
            .ok_or_else(|| CsiError::invalid("consistency group volume handle carries no group")),
        (StorageClassType::Classic, VolumeType::DependentFileset) => Err(CsiError::invalid(
            "snapshots are not supported for dependent fileset volumes",
        )),
        (StorageClassType::Classic, VolumeType::IndependentFileset) => Ok(None),
    }
}

async fn find_snapshot(located: &LocatedVolume, fileset: &str, name: &str) -> Result<Option<SnapshotInfo>, CsiError> {
    Ok(located
        .backend
        .list_snapshots(&located.filesystem.name, fileset)
        .await?
        .into_iter()
        .find(|s| s.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fileset_manager::StandardFilesetService;
    use crate::domain::backend::BackendVersion;
    use crate::domain::storage_class::StorageClassPlan;
    use crate::infrastructure::repositories::InMemoryVolumeRepository;
    use crate::infrastructure::retry::RetryPolicy;
    use crate::infrastructure::scale::InMemoryScaleBackend;
    use maplit::hashmap;
    use std::time::Duration;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn services(backend: Arc<InMemoryScaleBackend>) -> (Arc<StandardFilesetService>, StandardSnapshotService) {
        let registry = ClusterRegistry::new("17", "fs1", backend);
        let bus = Arc::new(EventBus::new(64));
        let locks = KeyedLocks::new();
        let filesets = Arc::new(
            StandardFilesetService::new(
                registry.clone(),
                Arc::new(InMemoryVolumeRepository::new()),
                bus.clone(),
                locks.clone(),
            )
            .with_link_wait(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))),
        );
        let snapshots = StandardSnapshotService::new(registry, filesets.clone(), bus, locks);
        (filesets, snapshots)
    }

    fn independent() -> StorageClassPlan {
        StorageClassPlan::resolve(&hashmap! { "volBackendFs".to_string() => "fs1".to_string() }).unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_and_restore_independent_volume() {
        let backend = Arc::new(InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID1", "/ibm/fs1"));
        let (filesets, snapshots) = services(backend.clone());
        let source = filesets
            .provision(ProvisionRequest::new("pvc-src", independent(), GIB))
            .await
            .unwrap();

        let snap = snapshots.create_snapshot(&source.volume_id(), "snap-1").await.unwrap();
        assert!(snap.is_ready());
        assert_eq!(snap.size_bytes, GIB);
        assert_eq!(backend.snapshot_names("fs1", "pvc-src"), vec!["snap-1".to_string()]);

        let restored = snapshots
            .restore_to_fileset(&snap.snapshot_id(), ProvisionRequest::new("pvc-dst", independent(), GIB))
            .await
            .unwrap();
        assert_eq!(restored.identity.path, "/ibm/fs1/pvc-dst");
        let copies = backend.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].target, "/ibm/fs1/pvc-dst");
    }

    #[tokio::test]
    async fn test_snapshot_gate_on_old_backend() {
        let backend = Arc::new(
            InMemoryScaleBackend::new("17")
                .with_version(BackendVersion::new(&[5, 0, 4, 0]))
                .with_filesystem("fs1", "UUID1", "/ibm/fs1"),
        );
        let (filesets, snapshots) = services(backend.clone());
        let source = filesets
            .provision(ProvisionRequest::new("pvc-old", independent(), GIB))
            .await
            .unwrap();

        match snapshots.create_snapshot(&source.volume_id(), "snap").await {
            Err(CsiError::Unsupported(msg)) => assert!(msg.contains("minimum version required")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(backend.calls("create_snapshot"), 0);
    }

    #[tokio::test]
    async fn test_dependent_volume_cannot_be_snapshotted() {
        let backend = Arc::new(InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID1", "/ibm/fs1"));
        let (filesets, snapshots) = services(backend);
        let plan = StorageClassPlan::resolve(&hashmap! {
            "volBackendFs".to_string() => "fs1".to_string(),
            "filesetType".to_string() => "dependent".to_string(),
        })
        .unwrap();
        let source = filesets.provision(ProvisionRequest::new("pvc-dep", plan, GIB)).await.unwrap();

        let err = snapshots.create_snapshot(&source.volume_id(), "snap").await.unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_delete_snapshot_is_idempotent() {
        let backend = Arc::new(InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID1", "/ibm/fs1"));
        let (filesets, snapshots) = services(backend.clone());
        let source = filesets
            .provision(ProvisionRequest::new("pvc-del", independent(), GIB))
            .await
            .unwrap();
        let snap = snapshots.create_snapshot(&source.volume_id(), "snap").await.unwrap();

        snapshots.delete_snapshot(&snap.snapshot_id()).await.unwrap();
        snapshots.delete_snapshot(&snap.snapshot_id()).await.unwrap();
        snapshots.delete_snapshot("not-a-handle").await.unwrap();
        assert!(backend.snapshot_names("fs1", "pvc-del").is_empty());
    }

    #[tokio::test]
    async fn test_restore_across_clusters_is_unsupported() {
        let backend = Arc::new(InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID1", "/ibm/fs1"));
        let (_, snapshots) = services(backend);
        let handle = "99;UUID1;pvc-x;snap;path=/ibm/fs1/pvc-x";

        let err = snapshots
            .restore_to_fileset(handle, ProvisionRequest::new("pvc-y", independent(), GIB))
            .await
            .unwrap_err();
        assert!(matches!(err, CsiError::Unsupported(_)));
    }
}
