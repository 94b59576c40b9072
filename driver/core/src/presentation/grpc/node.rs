// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CSI Node service
//!
//! The clustered filesystem is mounted on every node, so a volume is made
//! available to a pod by bind mounting its root (taken from the handle) onto
//! the kubelet target path. Staging has nothing to do and is accepted as-is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use super::csi::node_server::Node;
use super::csi::volume_capability::AccessType;
use super::csi::*;
use super::observe;
use crate::domain::error::CsiError;
use crate::domain::volume_handle::VolumeIdentity;
use crate::infrastructure::mount::{MountError, Mounter};

pub struct CsiNodeService {
    node_id: String,
    mounter: Arc<dyn Mounter>,
}

impl CsiNodeService {
    pub fn new(node_id: impl Into<String>, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            node_id: node_id.into(),
            mounter,
        }
    }
}

fn mount_status(err: MountError) -> Status {
    Status::internal(err.to_string())
}

fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{} is required", field)))
    } else {
        Ok(value)
    }
}

fn require_mount_capability(capability: Option<&VolumeCapability>) -> Result<(), Status> {
    let capability = capability.ok_or_else(|| Status::invalid_argument("volume capability is required"))?;
    if let Some(AccessType::Block(_)) = capability.access_type {
        return Err(Status::invalid_argument("block access type is not supported"));
    }
    Ok(())
}

fn decode(volume_id: &str) -> Result<VolumeIdentity, Status> {
    VolumeIdentity::decode(volume_id).map_err(|e| Status::from(CsiError::from(e)))
}

#[tonic::async_trait]
impl Node for CsiNodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let args = request.get_ref();
        decode(require(&args.volume_id, "volume id")?)?;
        require(&args.staging_target_path, "staging target path")?;
        require_mount_capability(args.volume_capability.as_ref())?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let args = request.get_ref();
        require(&args.volume_id, "volume id")?;
        require(&args.staging_target_path, "staging target path")?;
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id, target = %request.get_ref().target_path))]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<NodePublishVolumeResponse>, Status> = async {
            let identity = decode(require(&args.volume_id, "volume id")?)?;
            let target = PathBuf::from(require(&args.target_path, "target path")?);
            require_mount_capability(args.volume_capability.as_ref())?;

            let source = PathBuf::from(&identity.path);
            if tokio::fs::metadata(&source).await.is_err() {
                return Err(Status::not_found(format!(
                    "volume path {} is not available on node {}",
                    source.display(),
                    self.node_id
                )));
            }

            if self.mounter.is_mounted(&target).await.map_err(mount_status)? {
                return Ok(Response::new(NodePublishVolumeResponse {}));
            }
            tokio::fs::create_dir_all(&target)
                .await
                .map_err(|e| Status::internal(format!("failed to create {}: {}", target.display(), e)))?;
            self.mounter
                .bind_mount(&source, &target, args.readonly)
                .await
                .map_err(mount_status)?;

            info!(source = %source.display(), readonly = args.readonly, "Volume published");
            Ok(Response::new(NodePublishVolumeResponse {}))
        }
        .await;

        observe("NodePublishVolume", started, &result);
        result
    }

    #[instrument(err, skip(self, request), fields(volume.id = %request.get_ref().volume_id, target = %request.get_ref().target_path))]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let started = Instant::now();
        let args = request.into_inner();

        let result: Result<Response<NodeUnpublishVolumeResponse>, Status> = async {
            require(&args.volume_id, "volume id")?;
            let target = Path::new(require(&args.target_path, "target path")?);

            if self.mounter.is_mounted(target).await.map_err(mount_status)? {
                self.mounter.unmount(target).await.map_err(mount_status)?;
            }
            match tokio::fs::remove_dir(target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(Status::internal(format!("failed to remove {}: {}", target.display(), e)));
                }
            }
            Ok(Response::new(NodeUnpublishVolumeResponse {}))
        }
        .await;

        observe("NodeUnpublishVolume", started, &result);
        result
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse { capabilities: vec![] }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presentation::grpc::csi::volume_capability::{access_mode, AccessMode, BlockVolume, MountVolume};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tonic::Code;

    /// Records mounts instead of calling the kernel
    #[derive(Default)]
    struct RecordingMounter {
        mounts: Mutex<HashMap<PathBuf, (PathBuf, bool)>>,
    }

    #[async_trait]
    impl Mounter for RecordingMounter {
        async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
            Ok(self.mounts.lock().contains_key(target))
        }

        async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError> {
            self.mounts
                .lock()
                .insert(target.to_path_buf(), (source.to_path_buf(), readonly));
            Ok(())
        }

        async fn unmount(&self, target: &Path) -> Result<(), MountError> {
            self.mounts.lock().remove(target);
            Ok(())
        }
    }

    fn capability() -> VolumeCapability {
        VolumeCapability {
            access_type: Some(AccessType::Mount(MountVolume::default())),
            access_mode: Some(AccessMode {
                mode: access_mode::Mode::SingleNodeWriter as i32,
            }),
        }
    }

    fn handle(path: &Path) -> String {
        format!("0;2;17;UUID1;;pvc-a;path={}", path.display())
    }

    #[tokio::test]
    async fn test_publish_and_unpublish_are_idempotent() {
        let fs = tempfile::tempdir().unwrap();
        let volume_root = fs.path().join("pvc-a");
        std::fs::create_dir(&volume_root).unwrap();
        let target = fs.path().join("pods/abc/mount");

        let mounter = Arc::new(RecordingMounter::default());
        let svc = CsiNodeService::new("node-1", mounter.clone());
        let publish = NodePublishVolumeRequest {
            volume_id: handle(&volume_root),
            target_path: target.display().to_string(),
            volume_capability: Some(capability()),
            readonly: true,
            ..Default::default()
        };

        svc.node_publish_volume(Request::new(publish.clone())).await.unwrap();
        svc.node_publish_volume(Request::new(publish)).await.unwrap();
        assert_eq!(mounter.mounts.lock().get(&target), Some(&(volume_root.clone(), true)));

        let unpublish = NodeUnpublishVolumeRequest {
            volume_id: handle(&volume_root),
            target_path: target.display().to_string(),
        };
        svc.node_unpublish_volume(Request::new(unpublish.clone())).await.unwrap();
        svc.node_unpublish_volume(Request::new(unpublish)).await.unwrap();
        assert!(mounter.mounts.lock().is_empty());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_publish_missing_volume_path() {
        let fs = tempfile::tempdir().unwrap();
        let svc = CsiNodeService::new("node-1", Arc::new(RecordingMounter::default()));
        let status = svc
            .node_publish_volume(Request::new(NodePublishVolumeRequest {
                volume_id: handle(&fs.path().join("gone")),
                target_path: fs.path().join("target").display().to_string(),
                volume_capability: Some(capability()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_block_and_garbage_handles_rejected() {
        let svc = CsiNodeService::new("node-1", Arc::new(RecordingMounter::default()));
        let mut block = capability();
        block.access_type = Some(AccessType::Block(BlockVolume {}));

        let status = svc
            .node_stage_volume(Request::new(NodeStageVolumeRequest {
                volume_id: "0;2;17;UUID1;;pvc-a;path=/ibm/fs1/pvc-a".to_string(),
                staging_target_path: "/staging".to_string(),
                volume_capability: Some(block),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = svc
            .node_publish_volume(Request::new(NodePublishVolumeRequest {
                volume_id: "not-a-handle".to_string(),
                target_path: "/target".to_string(),
                volume_capability: Some(capability()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);

        let info = svc.node_get_info(Request::new(NodeGetInfoRequest {})).await.unwrap().into_inner();
        assert_eq!(info.node_id, "node-1");
    }
}
