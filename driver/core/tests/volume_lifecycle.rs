// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end volume and snapshot lifecycles against the in-memory backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use maplit::hashmap;
use pretty_assertions::assert_eq;

use scale_csi_core::application::fileset_manager::{
    FilesetService, ProvisionRequest, StandardFilesetService, CLONE_CLASS_MISMATCH,
};
use scale_csi_core::application::locks::KeyedLocks;
use scale_csi_core::application::snapshot_manager::{SnapshotService, StandardSnapshotService};
use scale_csi_core::domain::error::CsiError;
use scale_csi_core::domain::quota::MIN_BLOCK_LIMIT_KIB;
use scale_csi_core::domain::storage_class::StorageClassPlan;
use scale_csi_core::infrastructure::event_bus::EventBus;
use scale_csi_core::infrastructure::repositories::InMemoryVolumeRepository;
use scale_csi_core::infrastructure::retry::RetryPolicy;
use scale_csi_core::infrastructure::scale::{ClusterRegistry, InMemoryScaleBackend};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

struct Harness {
    backend: Arc<InMemoryScaleBackend>,
    filesets: Arc<StandardFilesetService>,
    snapshots: StandardSnapshotService,
}

fn harness(backend: InMemoryScaleBackend) -> Harness {
    let backend = Arc::new(backend.with_filesystem("fs1", "UUID1", "/ibm/fs1"));
    let registry = ClusterRegistry::new("17", "fs1", backend.clone());
    let bus = Arc::new(EventBus::new(256));
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
    Harness {
        backend,
        filesets,
        snapshots,
    }
}

fn plan(params: HashMap<String, String>) -> StorageClassPlan {
    StorageClassPlan::resolve(&params).unwrap()
}

fn independent() -> StorageClassPlan {
    plan(hashmap! { "volBackendFs".to_string() => "fs1".to_string() })
}

fn consistency_group(group: &str) -> StorageClassPlan {
    plan(hashmap! {
        "volBackendFs".to_string() => "fs1".to_string(),
        "version".to_string() => "2".to_string(),
        "consistencyGroup".to_string() => group.to_string(),
    })
}

#[tokio::test]
async fn test_deprovision_is_idempotent() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let volume = h
        .filesets
        .provision(ProvisionRequest::new("pvc-gone", independent(), GIB))
        .await
        .unwrap();

    h.filesets.deprovision(&volume.volume_id()).await.unwrap();
    h.filesets.deprovision(&volume.volume_id()).await.unwrap();

    assert!(h.backend.fileset("fs1", "pvc-gone").is_none());
    assert_eq!(h.backend.calls("delete_fileset"), 1);
}

#[tokio::test]
async fn test_small_request_gets_quota_floor() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let volume = h
        .filesets
        .provision(ProvisionRequest::new("pvc-tiny", independent(), MIB))
        .await
        .unwrap();

    assert_eq!(h.backend.quota("fs1", "pvc-tiny").unwrap().block_limit_kib, MIN_BLOCK_LIMIT_KIB);
    let resolved = h.filesets.resolve_ref(&volume.volume_id()).await.unwrap();
    assert_eq!(resolved.capacity_bytes, MIN_BLOCK_LIMIT_KIB * 1024);
}

#[tokio::test]
async fn test_volume_below_floor_can_grow() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let volume = h
        .filesets
        .provision(ProvisionRequest::new("pvc-small", independent(), 500 * MIB))
        .await
        .unwrap();
    assert_eq!(volume.capacity_bytes, GIB);
    let id = volume.volume_id();

    assert_eq!(h.filesets.expand(&id, 800 * MIB).await.unwrap(), GIB);
    assert_eq!(h.filesets.expand(&id, 3 * GIB).await.unwrap(), 3 * GIB);
    assert_eq!(h.backend.quota("fs1", "pvc-small").unwrap().block_limit_kib, 3 * 1024 * 1024);
}

#[tokio::test]
async fn test_concurrent_provision_creates_once() {
    let h = harness(InMemoryScaleBackend::new("17"));

    let (first, second) = tokio::join!(
        h.filesets.provision(ProvisionRequest::new("pvc-x", independent(), GIB)),
        h.filesets.provision(ProvisionRequest::new("pvc-x", independent(), GIB)),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    assert_eq!(h.backend.calls("create_fileset"), 1);
    assert_eq!(h.backend.calls("set_quota"), 1);
}

#[tokio::test]
async fn test_repeated_provision_returns_same_volume() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let first = h
        .filesets
        .provision(ProvisionRequest::new("pvc-same", independent(), 2 * GIB))
        .await
        .unwrap();
    let second = h
        .filesets
        .provision(ProvisionRequest::new("pvc-same", independent(), 2 * GIB))
        .await
        .unwrap();
    assert_eq!(first, second);

    let err = h
        .filesets
        .provision(ProvisionRequest::new("pvc-same", independent(), 3 * GIB))
        .await
        .unwrap_err();
    assert!(matches!(err, CsiError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_consistency_group_members_share_inode_space() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let a = h
        .filesets
        .provision(ProvisionRequest::new("pvc-a", consistency_group("cg1"), GIB))
        .await
        .unwrap();
    let b = h
        .filesets
        .provision(ProvisionRequest::new("pvc-b", consistency_group("cg1"), GIB))
        .await
        .unwrap();

    let group = h.backend.fileset("fs1", "cg1").unwrap();
    assert!(group.independent);
    for member in ["pvc-a", "pvc-b"] {
        let info = h.backend.fileset("fs1", member).unwrap();
        assert!(!info.independent);
        assert_eq!(info.inode_space, group.inode_space);
        assert_eq!(info.max_inodes, 0);
    }
    assert_eq!(a.identity.path, "/ibm/fs1/cg1/pvc-a");
    assert_eq!(a.identity.consistency_group.as_deref(), Some("cg1"));

    h.filesets.deprovision(&a.volume_id()).await.unwrap();
    assert!(h.backend.fileset("fs1", "cg1").is_some());

    h.filesets.deprovision(&b.volume_id()).await.unwrap();
    assert!(h.backend.fileset("fs1", "cg1").is_none());
}

#[tokio::test]
async fn test_group_with_snapshot_survives_member_deletion() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let a = h
        .filesets
        .provision(ProvisionRequest::new("pvc-a", consistency_group("cg2"), GIB))
        .await
        .unwrap();
    let b = h
        .filesets
        .provision(ProvisionRequest::new("pvc-b", consistency_group("cg2"), GIB))
        .await
        .unwrap();

    let group = h
        .snapshots
        .create_group_snapshot(&[a.volume_id(), b.volume_id()], "cg-snap")
        .await
        .unwrap();
    assert_eq!(group.group, "cg2");
    assert_eq!(group.members.len(), 2);
    assert_eq!(h.backend.snapshot_names("fs1", "cg2"), vec!["cg-snap".to_string()]);

    h.filesets.deprovision(&a.volume_id()).await.unwrap();
    h.filesets.deprovision(&b.volume_id()).await.unwrap();
    assert!(h.backend.fileset("fs1", "cg2").is_some());

    h.snapshots
        .delete_snapshot(&group.members[0].snapshot_id())
        .await
        .unwrap();
    assert!(h.backend.fileset("fs1", "cg2").is_some());

    h.snapshots
        .delete_snapshot(&group.members[1].snapshot_id())
        .await
        .unwrap();
    assert!(h.backend.snapshot_names("fs1", "cg2").is_empty());
    assert!(h.backend.fileset("fs1", "cg2").is_none());
}

#[tokio::test]
async fn test_group_snapshot_outlives_one_member_handle() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let a = h
        .filesets
        .provision(ProvisionRequest::new("pvc-a", consistency_group("g"), GIB))
        .await
        .unwrap();
    let b = h
        .filesets
        .provision(ProvisionRequest::new("pvc-b", consistency_group("g"), GIB))
        .await
        .unwrap();
    let group = h
        .snapshots
        .create_group_snapshot(&[a.volume_id(), b.volume_id()], "gs")
        .await
        .unwrap();

    h.snapshots
        .delete_snapshot(&group.members[0].snapshot_id())
        .await
        .unwrap();
    h.snapshots
        .delete_snapshot(&group.members[0].snapshot_id())
        .await
        .unwrap();
    assert_eq!(h.backend.snapshot_names("fs1", "g"), vec!["gs".to_string()]);

    let restored = h
        .snapshots
        .restore_to_fileset(&group.members[1].snapshot_id(), ProvisionRequest::new("pvc-r", independent(), GIB))
        .await
        .unwrap();
    assert_eq!(restored.identity.path, "/ibm/fs1/pvc-r");
    assert_eq!(h.backend.calls("delete_snapshot"), 0);
}

#[tokio::test]
async fn test_expand_never_shrinks() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let volume = h
        .filesets
        .provision(ProvisionRequest::new("pvc-grow", independent(), GIB))
        .await
        .unwrap();
    let id = volume.volume_id();

    assert_eq!(h.filesets.expand(&id, 2 * GIB).await.unwrap(), 2 * GIB);
    assert_eq!(h.filesets.expand(&id, 2 * GIB).await.unwrap(), 2 * GIB);

    let err = h.filesets.expand(&id, 500 * MIB).await.unwrap_err();
    assert!(matches!(err, CsiError::InvalidArgument(_)));
    assert_eq!(h.backend.quota("fs1", "pvc-grow").unwrap().block_limit_kib, 2 * 1024 * 1024);
}

#[tokio::test]
async fn test_clone_into_other_class_is_rejected() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let source = h
        .filesets
        .provision(ProvisionRequest::new("pvc-src", independent(), GIB))
        .await
        .unwrap();
    let dependent = plan(hashmap! {
        "volBackendFs".to_string() => "fs1".to_string(),
        "filesetType".to_string() => "dependent".to_string(),
    });

    let err = h
        .filesets
        .clone_volume(&source.volume_id(), ProvisionRequest::new("pvc-dst", dependent, GIB))
        .await
        .unwrap_err();

    assert_eq!(err, CsiError::InvalidArgument(CLONE_CLASS_MISMATCH.to_string()));
    assert!(h.backend.fileset("fs1", "pvc-dst").is_none());
    assert!(h.backend.copies().is_empty());
}

#[tokio::test]
async fn test_clone_copies_source_content() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let source = h
        .filesets
        .provision(ProvisionRequest::new("pvc-src", independent(), GIB))
        .await
        .unwrap();

    let clone = h
        .filesets
        .clone_volume(&source.volume_id(), ProvisionRequest::new("pvc-copy", independent(), 2 * GIB))
        .await
        .unwrap();

    assert_eq!(clone.identity.path, "/ibm/fs1/pvc-copy");
    let copies = h.backend.copies();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].source, "pvc-src");
    assert_eq!(copies[0].target, "/ibm/fs1/pvc-copy");
}

#[tokio::test]
async fn test_concurrent_snapshot_requests_coalesce() {
    let h = harness(InMemoryScaleBackend::new("17").with_snapshot_delay(Duration::from_millis(50)));
    let source = h
        .filesets
        .provision(ProvisionRequest::new("pvc-snap", independent(), GIB))
        .await
        .unwrap();
    let id = source.volume_id();

    let (first, second) = tokio::join!(
        h.snapshots.create_snapshot(&id, "snap-1"),
        h.snapshots.create_snapshot(&id, "snap-1"),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.snapshot_id(), second.snapshot_id());
    assert_eq!(h.backend.calls("create_snapshot"), 1);
    assert_eq!(h.backend.snapshot_names("fs1", "pvc-snap"), vec!["snap-1".to_string()]);
}

#[tokio::test]
async fn test_restore_missing_snapshot_is_not_found() {
    let h = harness(InMemoryScaleBackend::new("17"));
    let source = h
        .filesets
        .provision(ProvisionRequest::new("pvc-src", independent(), GIB))
        .await
        .unwrap();
    let snapshot = h.snapshots.create_snapshot(&source.volume_id(), "snap").await.unwrap();
    h.snapshots.delete_snapshot(&snapshot.snapshot_id()).await.unwrap();

    let err = h
        .snapshots
        .restore_to_fileset(&snapshot.snapshot_id(), ProvisionRequest::new("pvc-new", independent(), GIB))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(h.backend.fileset("fs1", "pvc-new").is_none());
}
