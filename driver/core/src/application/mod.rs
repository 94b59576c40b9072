// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod fileset_manager;
pub mod locks;
pub mod operator;
pub mod snapshot_manager;

use std::sync::Arc;

use crate::domain::backend::{FilesystemInfo, ScaleBackend};
use crate::domain::error::CsiError;
use crate::domain::fileset::relative_path;
use crate::domain::volume_handle::VolumeIdentity;
use crate::infrastructure::scale::ClusterRegistry;

/// A decoded volume handle resolved against its cluster
#[derive(Clone)]
pub struct LocatedVolume {
    pub identity: VolumeIdentity,
    pub filesystem: FilesystemInfo,
    pub backend: Arc<dyn ScaleBackend>,
}

impl LocatedVolume {
    /// Volume root relative to the filesystem mount point
    pub fn relative_path(&self) -> Result<String, CsiError> {
        relative_path(&self.filesystem.mount_point, &self.identity.path).ok_or_else(|| {
            CsiError::internal(format!(
                "volume path {} is outside filesystem {} mounted at {}",
                self.identity.path, self.filesystem.name, self.filesystem.mount_point
            ))
        })
    }
}

/// Find the backend and filesystem a handle refers to
pub async fn locate(registry: &ClusterRegistry, identity: &VolumeIdentity) -> Result<LocatedVolume, CsiError> {
    let backend = registry.backend(Some(&identity.cluster_id))?;
    let name = backend.get_filesystem_name(&identity.filesystem_uid).await?;
    let filesystem = backend.get_filesystem_info(&name).await?;
    Ok(LocatedVolume {
        identity: identity.clone(),
        filesystem,
        backend,
    })
}

/// Lock key serialising all work on one volume
pub fn volume_key(name: &str) -> String {
    format!("volume/{}", name)
}

/// Lock key serialising membership changes of one consistency group
pub fn group_key(filesystem: &str, group: &str) -> String {
    format!("group/{}/{}", filesystem, group)
}
