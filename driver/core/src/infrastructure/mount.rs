// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bind mounts for the Node service.
//!
//! Volumes are directories of an already-mounted clustered filesystem, so
//! publishing is a bind mount of the volume root onto the kubelet target
//! (remounted read-only when requested).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use thiserror::Error;
use tracing::debug;

const MOUNTINFO: &str = "/proc/self/mountinfo";

#[derive(Debug, Error)]
pub enum MountError {
    #[error("failed to {operation} {path}: {source}")]
    Sys {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: Errno,
    },

    #[error("failed to read mount table: {0}")]
    Table(#[from] std::io::Error),

    #[error("mount task failed: {0}")]
    Task(String),
}

#[async_trait]
pub trait Mounter: Send + Sync {
    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError>;

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError>;

    /// Unmount `target`; a target that is not mounted is not an error
    async fn unmount(&self, target: &Path) -> Result<(), MountError>;
}

/// Mounts through the kernel on the local node
#[derive(Debug, Default, Clone)]
pub struct SystemMounter;

impl SystemMounter {
    pub fn new() -> Self {
        Self
    }
}

async fn blocking<T, F>(work: F) -> Result<T, MountError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, MountError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| MountError::Task(e.to_string()))?
}

#[async_trait]
impl Mounter for SystemMounter {
    async fn is_mounted(&self, target: &Path) -> Result<bool, MountError> {
        let table = tokio::fs::read_to_string(MOUNTINFO).await?;
        let mounted = mount_points(&table).any(|point| point == target);
        Ok(mounted)
    }

    async fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<(), MountError> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        blocking(move || {
            mount(Some(&source), &target, None::<&str>, MsFlags::MS_BIND, None::<&str>).map_err(|e| {
                MountError::Sys {
                    operation: "bind mount",
                    path: target.clone(),
                    source: e,
                }
            })?;
            if readonly {
                let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY;
                if let Err(e) = mount(None::<&str>, &target, None::<&str>, flags, None::<&str>) {
                    let _ = umount2(&target, MntFlags::MNT_DETACH);
                    return Err(MountError::Sys {
                        operation: "remount read-only",
                        path: target,
                        source: e,
                    });
                }
            }
            debug!(source = %source.display(), target = %target.display(), readonly, "Bind mounted");
            Ok(())
        })
        .await
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let target = target.to_path_buf();
        blocking(move || match umount2(&target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(MountError::Sys {
                operation: "unmount",
                path: target,
                source: e,
            }),
        })
        .await
    }
}

/// Mount points listed in a `/proc/<pid>/mountinfo` table
pub fn mount_points(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
}

/// Undo the kernel's octal escaping (`\040` for a space)
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b)) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 0:52 / /ibm/fs1 rw,relatime shared:40 - gpfs fs1 rw
120 22 0:52 /pvc-a /var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc\\040a/mount rw - gpfs fs1 rw
";

    #[test]
    fn test_mount_points_unescaped() {
        let points: Vec<PathBuf> = mount_points(TABLE).collect();
        assert_eq!(points.len(), 3);
        assert_eq!(points[1], PathBuf::from("/ibm/fs1"));
        assert_eq!(
            points[2],
            PathBuf::from("/var/lib/kubelet/pods/abc/volumes/kubernetes.io~csi/pvc a/mount")
        );
    }
}
