// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CSI Controller service
//!
//! Mutating RPCs run their lifecycle call on a spawned task: if the sidecar
//! gives up and drops the request, the backend work still finishes under its
//! key lock, and the retried RPC converges onto the recorded result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, SemaphorePermit};
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use super::csi::controller_server::Controller;
use super::csi::controller_service_capability::{self, rpc};
use super::csi::volume_capability::AccessType;
use super::csi::volume_content_source::{SnapshotSource, Type as ContentType, VolumeSource};
use super::csi::*;
use super::observe;
use crate::application::fileset_manager::{FilesetService, ProvisionRequest};
use crate::application::snapshot_manager::SnapshotService;
use crate::domain::error::CsiError;
use crate::domain::fileset::FilesetRef;
use crate::domain::snapshot::SnapshotRef;
use crate::domain::storage_class::{params, StorageClassPlan};

const CREATE_PERMIT_TIMEOUT: Duration = Duration::from_secs(3);

pub struct CsiControllerService {
    filesets: Arc<dyn FilesetService>,
    snapshots: Arc<dyn SnapshotService>,
    create_limiter: Arc<Semaphore>,
}

impl CsiControllerService {
    pub fn new(filesets: Arc<dyn FilesetService>, snapshots: Arc<dyn SnapshotService>, max_concurrent_creates: usize) -> Self {
        Self {
            filesets,
            snapshots,
            create_limiter: Arc::new(Semaphore::new(max_concurrent_creates.max(1))),
        }
    }

    async fn create_permit(&self) -> Result<SemaphorePermit<'_>, Status> {
        tokio::time::timeout(CREATE_PERMIT_TIMEOUT, self.create_limiter.acquire())
            .await
            .map_err(|_| Status::aborted("too many volume creations in progress"))?
            .map_err(|_| Status::unavailable("controller is shutting down"))
    }
}

/// Run a lifecycle call to completion even if the RPC is dropped
async fn detached<T, F>(work: F) -> Result<T, Status>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CsiError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| Status::internal(format!("lifecycle task failed: {}", e)))?
        .map_err(Status::from)
}

fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{} is required", field)))
    } else {
        Ok(value)
    }
}

/// Filesets serve every access mode; only block access is refused
fn check_capabilities(capabilities: &[VolumeCapability]) -> Result<(), String> {
    if capabilities.is_empty() {
        return Err("volume capabilities are required".to_string());
    }
    for capability in capabilities {
        if capability.access_mode.is_none() {
            return Err("access mode is required".to_string());
        }
        if let Some(AccessType::Block(_)) = capability.access_type {
            return Err("block access type is not supported".to_string());
        }
    }
    Ok(())
}

fn requested_capacity(range: Option<&CapacityRange>) -> Result<u64, Status> {
    let Some(range) = range else {
        return Ok(0);
    };
    if range.required_bytes < 0 || range.limit_bytes < 0 {
        return Err(Status::invalid_argument("capacity range cannot be negative"));
    }
    if range.limit_bytes > 0 && range.limit_bytes < range.required_bytes {
        return Err(Status::invalid_argument(format!(
            "limit_bytes {} is below required_bytes {}",
            range.limit_bytes, range.required_bytes
        )));
    }
    Ok(range.required_bytes as u64)
}

/// The quota floor can raise a small request past the caller's limit
fn check_limit(range: Option<&CapacityRange>, applied_bytes: u64) -> Result<(), Status> {
    match range {
        Some(range) if range.limit_bytes > 0 && applied_bytes > range.limit_bytes as u64 => Err(Status::out_of_range(
            format!("volume would get {} bytes, above limit_bytes {}", applied_bytes, range.limit_bytes),
        )),
        _ => Ok(()),
    }
}

fn volume_response(fileset: FilesetRef, content_source: Option<VolumeContentSource>) -> CreateVolumeResponse {
    let volume_context = HashMap::from([
        (params::VOL_BACKEND_FS.to_string(), fileset.filesystem.clone()),
        (params::CLUSTER_ID.to_string(), fileset.identity.cluster_id.clone()),
    ]);
    CreateVolumeResponse {
        volume: Some(Volume {
            capacity_bytes: fileset.capacity_bytes as i64,
            volume_id: fileset.volume_id(),
            volume_context,
            content_source,
        }),
    }
}

fn snapshot_message(snapshot: &SnapshotRef) -> Snapshot {
    Snapshot {
        size_bytes: snapshot.size_bytes as i64,
        snapshot_id: snapshot.snapshot_id(),
        source_volume_id: snapshot.source_volume_id.clone(),
        creation_time: Some(prost_types::Timestamp {
            seconds: snapshot.created_at.timestamp(),
            nanos: snapshot.created_at.timestamp_subsec_nanos() as i32,
        }),
        ready_to_use: snapshot.is_ready(),
        group_snapshot_id: String::new(),
    }
}

fn capability(kind: rpc::Type) -> ControllerServiceCapability {
    ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(controller_service_capability::Rpc {
            r#type: kind as i32,
        })),
    }
}

#[tonic::async_trait]
impl Controller for CsiControllerService {
    #[instrument(err, skip(self, request), fields(volume.name = %request.get_ref().name))]
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<CreateVolumeResponse>, Status> = async {
            let name = require(&args.name, "volume name")?.to_string();
            check_capabilities(&args.volume_capabilities).map_err(Status::invalid_argument)?;
            let capacity = requested_capacity(args.capacity_range.as_ref())?;
            let plan = StorageClassPlan::resolve(&args.parameters)?;
            let provision = ProvisionRequest::new(name, plan, capacity);
            check_limit(args.capacity_range.as_ref(), provision.applied_capacity())?;

            let _permit = self.create_permit().await?;
            let source = args.volume_content_source.clone();
            let fileset = match source.as_ref().and_then(|s| s.r#type.as_ref()) {
                Some(ContentType::Snapshot(SnapshotSource { snapshot_id })) => {
                    let snapshots = self.snapshots.clone();
                    let snapshot_id = snapshot_id.clone();
                    detached(async move { snapshots.restore_to_fileset(&snapshot_id, provision).await }).await?
                }
                Some(ContentType::Volume(VolumeSource { volume_id })) => {
                    let filesets = self.filesets.clone();
                    let volume_id = volume_id.clone();
                    detached(async move { filesets.clone_volume(&volume_id, provision).await }).await?
                }
                None => {
                    let filesets = self.filesets.clone();
                    detached(async move { filesets.provision(provision).await }).await?
                }
            };

            info!(volume_id = %fileset.volume_id(), capacity = fileset.capacity_bytes, "Volume created");
            Ok(Response::new(volume_response(fileset, source)))
        }
        .await;

        observe("CreateVolume", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id))]
    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<DeleteVolumeResponse>, Status> = async {
            let volume_id = require(&args.volume_id, "volume id")?.to_string();
            let filesets = self.filesets.clone();
            detached(async move { filesets.deprovision(&volume_id).await }).await?;
            Ok(Response::new(DeleteVolumeResponse {}))
        }
        .await;

        observe("DeleteVolume", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id, node.id = %request.get_ref().node_id))]
    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<ControllerPublishVolumeResponse>, Status> = async {
            let volume_id = require(&args.volume_id, "volume id")?;
            require(&args.node_id, "node id")?;
            let capability = args
                .volume_capability
                .as_ref()
                .ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
            check_capabilities(std::slice::from_ref(capability)).map_err(Status::invalid_argument)?;

            // the fileset is cluster-wide; publishing only checks it still exists
            let fileset = self.filesets.resolve_ref(volume_id).await?;
            let publish_context = HashMap::from([(params::VOL_BACKEND_FS.to_string(), fileset.filesystem)]);
            Ok(Response::new(ControllerPublishVolumeResponse { publish_context }))
        }
        .await;

        observe("ControllerPublishVolume", started, &result);
        result
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let started = Instant::now();
        let result = require(&request.get_ref().volume_id, "volume id")
            .map(|_| Response::new(ControllerUnpublishVolumeResponse {}));
        observe("ControllerUnpublishVolume", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id))]
    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<ValidateVolumeCapabilitiesResponse>, Status> = async {
            let volume_id = require(&args.volume_id, "volume id")?;
            if args.volume_capabilities.is_empty() {
                return Err(Status::invalid_argument("volume capabilities are required"));
            }
            self.filesets.resolve_ref(volume_id).await?;

            let response = match check_capabilities(&args.volume_capabilities) {
                Ok(()) => ValidateVolumeCapabilitiesResponse {
                    confirmed: Some(validate_volume_capabilities_response::Confirmed {
                        volume_context: args.volume_context,
                        volume_capabilities: args.volume_capabilities,
                        parameters: args.parameters,
                    }),
                    message: String::new(),
                },
                Err(message) => ValidateVolumeCapabilitiesResponse {
                    confirmed: None,
                    message,
                },
            };
            Ok(Response::new(response))
        }
        .await;

        observe("ValidateVolumeCapabilities", started, &result);
        result
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        let capabilities = [
            rpc::Type::CreateDeleteVolume,
            rpc::Type::PublishUnpublishVolume,
            rpc::Type::CreateDeleteSnapshot,
            rpc::Type::CloneVolume,
            rpc::Type::ExpandVolume,
        ]
        .into_iter()
        .map(capability)
        .collect();
        Ok(Response::new(ControllerGetCapabilitiesResponse { capabilities }))
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().source_volume_id, snapshot.name = %request.get_ref().name))]
    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<CreateSnapshotResponse>, Status> = async {
            let source = require(&args.source_volume_id, "source volume id")?.to_string();
            let name = require(&args.name, "snapshot name")?.to_string();
            let snapshots = self.snapshots.clone();
            let snapshot = detached(async move { snapshots.create_snapshot(&source, &name).await }).await?;
            info!(snapshot_id = %snapshot.snapshot_id(), "Snapshot created");
            Ok(Response::new(CreateSnapshotResponse {
                snapshot: Some(snapshot_message(&snapshot)),
            }))
        }
        .await;

        observe("CreateSnapshot", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(snapshot.id = %request.get_ref().snapshot_id))]
    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<DeleteSnapshotResponse>, Status> = async {
            let snapshot_id = require(&args.snapshot_id, "snapshot id")?.to_string();
            let snapshots = self.snapshots.clone();
            detached(async move { snapshots.delete_snapshot(&snapshot_id).await }).await?;
            Ok(Response::new(DeleteSnapshotResponse {}))
        }
        .await;

        observe("DeleteSnapshot", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id))]
    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<ControllerExpandVolumeResponse>, Status> = async {
            let volume_id = require(&args.volume_id, "volume id")?.to_string();
            if args.capacity_range.is_none() {
                return Err(Status::invalid_argument("capacity range is required"));
            }
            let capacity = requested_capacity(args.capacity_range.as_ref())?;
            let filesets = self.filesets.clone();
            let capacity_bytes = detached(async move { filesets.expand(&volume_id, capacity).await }).await?;
            Ok(Response::new(ControllerExpandVolumeResponse {
                capacity_bytes: capacity_bytes as i64,
                node_expansion_required: false,
            }))
        }
        .await;

        observe("ControllerExpandVolume", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fileset_manager::StandardFilesetService;
    use crate::application::locks::KeyedLocks;
    use crate::application::snapshot_manager::StandardSnapshotService;
    use crate::infrastructure::event_bus::EventBus;
    use crate::infrastructure::repositories::InMemoryVolumeRepository;
    use crate::infrastructure::retry::RetryPolicy;
    use crate::infrastructure::scale::{ClusterRegistry, InMemoryScaleBackend};
    use crate::presentation::grpc::csi::volume_capability::{access_mode, AccessMode, BlockVolume, MountVolume};
    use tonic::Code;

    const MIB: i64 = 1024 * 1024;
    const GIB: i64 = 1024 * MIB;

    fn controller(backend: Arc<InMemoryScaleBackend>) -> CsiControllerService {
        let registry = ClusterRegistry::new("17", "fs1", backend);
        let bus = Arc::new(EventBus::new(64));
        let locks = KeyedLocks::new();
        let filesets = Arc::new(
            StandardFilesetService::new(registry.clone(), Arc::new(InMemoryVolumeRepository::new()), bus.clone(), locks.clone())
                .with_link_wait(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))),
        );
        let snapshots = Arc::new(StandardSnapshotService::new(registry, filesets.clone(), bus, locks));
        CsiControllerService::new(filesets, snapshots, 4)
    }

    fn mount_capability() -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode {
                mode: access_mode::Mode::MultiNodeMultiWriter as i32,
            }),
        }
    }

    fn create_request(name: &str) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(CapacityRange {
                required_bytes: 2 * GIB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability()],
            parameters: HashMap::from([(params::VOL_BACKEND_FS.to_string(), "fs1".to_string())]),
            ..Default::default()
        }
    }

    fn backend() -> Arc<InMemoryScaleBackend> {
        Arc::new(InMemoryScaleBackend::new("17").with_filesystem("fs1", "UUID1", "/ibm/fs1"))
    }

    #[tokio::test]
    async fn test_create_volume_is_idempotent() {
        let backend = backend();
        let svc = controller(backend.clone());

        let first = svc.create_volume(Request::new(create_request("pvc-1"))).await.unwrap().into_inner();
        let second = svc.create_volume(Request::new(create_request("pvc-1"))).await.unwrap().into_inner();

        let first = first.volume.unwrap();
        assert_eq!(first.volume_id, second.volume.unwrap().volume_id);
        assert_eq!(first.capacity_bytes, 2 * GIB);
        assert_eq!(first.volume_context.get("volBackendFs").map(String::as_str), Some("fs1"));
        assert!(backend.fileset("fs1", "pvc-1").is_some());
    }

    #[tokio::test]
    async fn test_block_volumes_rejected_before_backend() {
        let backend = backend();
        let svc = controller(backend.clone());
        let mut request = create_request("pvc-2");
        request.volume_capabilities[0].access_type = Some(AccessType::Block(BlockVolume {}));

        let status = svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(backend.calls("create_fileset"), 0);
    }

    #[tokio::test]
    async fn test_delete_volume_twice() {
        let svc = controller(backend());
        let volume = svc
            .create_volume(Request::new(create_request("pvc-3")))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        for _ in 0..2 {
            svc.delete_volume(Request::new(DeleteVolumeRequest {
                volume_id: volume.volume_id.clone(),
                ..Default::default()
            }))
            .await
            .unwrap();
        }

        let status = svc
            .validate_volume_capabilities(Request::new(ValidateVolumeCapabilitiesRequest {
                volume_id: volume.volume_id,
                volume_capabilities: vec![mount_capability()],
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_snapshot_then_restore_through_content_source() {
        let backend = backend();
        let svc = controller(backend.clone());
        let source = svc
            .create_volume(Request::new(create_request("pvc-src")))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        let snapshot = svc
            .create_snapshot(Request::new(CreateSnapshotRequest {
                source_volume_id: source.volume_id.clone(),
                name: "snap-1".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();
        assert!(snapshot.ready_to_use);
        assert_eq!(snapshot.source_volume_id, source.volume_id);

        let mut request = create_request("pvc-restored");
        request.volume_content_source = Some(VolumeContentSource {
            r#type: Some(ContentType::Snapshot(SnapshotSource {
                snapshot_id: snapshot.snapshot_id.clone(),
            })),
        });
        let restored = svc.create_volume(Request::new(request)).await.unwrap().into_inner().volume.unwrap();
        assert!(restored.content_source.is_some());
        assert_eq!(backend.copies().len(), 1);

        svc.delete_snapshot(Request::new(DeleteSnapshotRequest {
            snapshot_id: snapshot.snapshot_id,
            ..Default::default()
        }))
        .await
        .unwrap();
        assert!(backend.snapshot_names("fs1", "pvc-src").is_empty());
    }

    #[tokio::test]
    async fn test_expand_rejects_shrink() {
        let svc = controller(backend());
        let volume = svc
            .create_volume(Request::new(create_request("pvc-4")))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        let grown = svc
            .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
                volume_id: volume.volume_id.clone(),
                capacity_range: Some(CapacityRange {
                    required_bytes: 4 * GIB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(grown.capacity_bytes, 4 * GIB);
        assert!(!grown.node_expansion_required);

        let status = svc
            .controller_expand_volume(Request::new(ControllerExpandVolumeRequest {
                volume_id: volume.volume_id,
                capacity_range: Some(CapacityRange {
                    required_bytes: GIB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_quota_floor_above_limit_is_out_of_range() {
        let backend = backend();
        let svc = controller(backend.clone());
        let mut request = create_request("pvc-5");
        request.capacity_range = Some(CapacityRange {
            required_bytes: 500 * MIB,
            limit_bytes: 600 * MIB,
        });

        let status = svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(status.code(), Code::OutOfRange);
        assert_eq!(backend.calls("create_fileset"), 0);
    }

    #[tokio::test]
    async fn test_small_volume_reports_floored_capacity() {
        let svc = controller(backend());
        let mut request = create_request("pvc-6");
        request.capacity_range = Some(CapacityRange {
            required_bytes: 500 * MIB,
            limit_bytes: 0,
        });

        let volume = svc.create_volume(Request::new(request)).await.unwrap().into_inner().volume.unwrap();
        assert_eq!(volume.capacity_bytes, GIB);
    }

    #[tokio::test]
    async fn test_missing_fields_are_invalid() {
        let svc = controller(backend());
        let status = svc
            .delete_volume(Request::new(DeleteVolumeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = svc
            .controller_publish_volume(Request::new(ControllerPublishVolumeRequest {
                volume_id: "0;2;17;UUID1;;pvc-x;path=/ibm/fs1/pvc-x".to_string(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
    }
}
