// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume and Snapshot Handles
//!
//! The opaque strings handed to Kubernetes as `volume_id` / `snapshot_id`.
//! They must survive driver upgrades, so decoding accepts every shape ever
//! emitted while encoding always produces the current 7-field shape.
//!
//! # Volume handle shapes
//!
//! | fields | layout                                                                 |
//! |--------|------------------------------------------------------------------------|
//! | 3      | `clusterId;fsUID;path=<dir>` (lightweight)                            |
//! | 4      | `clusterId;fsUID;fileset=<name>;path=<dir>`                           |
//! | 5      | `clusterId;fsUID;fileset=<name>;cg=<group>;path=<dir>`                |
//! | 7      | `scType;volType;clusterId;fsUID;cgFileset;fileset;path=<dir>`         |
//!
//! In the 7-field form an empty fileset field means a lightweight
//! (directory) volume and decodes to [`LIGHTWEIGHT_FILESET`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FIELD_SEPARATOR: char = ';';

/// Fileset name reported for lightweight (directory-backed) volumes.
pub const LIGHTWEIGHT_FILESET: &str = "LW";

const PATH_PREFIX: &str = "path=";
const FILESET_PREFIX: &str = "fileset=";
const CG_PREFIX: &str = "cg=";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandleError {
    #[error("malformed handle '{input}': expected one of {expected} fields, found {found}")]
    FieldCount { input: String, expected: &'static str, found: usize },

    #[error("malformed handle '{input}': {field} is empty")]
    EmptyField { input: String, field: &'static str },

    #[error("malformed handle '{input}': {field} has unexpected value '{value}'")]
    InvalidField { input: String, field: &'static str, value: String },
}

/// Storage class generation that produced a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClassType {
    /// `version: "1"` classes: one fileset or directory per volume.
    Classic,
    /// `version: "2"` classes: dependent filesets inside a consistency group.
    Advanced,
}

impl StorageClassType {
    fn code(&self) -> &'static str {
        match self {
            StorageClassType::Classic => "0",
            StorageClassType::Advanced => "1",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(StorageClassType::Classic),
            "1" => Some(StorageClassType::Advanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    Lightweight,
    DependentFileset,
    IndependentFileset,
}

impl VolumeType {
    fn code(&self) -> &'static str {
        match self {
            VolumeType::Lightweight => "0",
            VolumeType::DependentFileset => "1",
            VolumeType::IndependentFileset => "2",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(VolumeType::Lightweight),
            "1" => Some(VolumeType::DependentFileset),
            "2" => Some(VolumeType::IndependentFileset),
            _ => None,
        }
    }
}

/// Decoded volume handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeIdentity {
    pub storage_class_type: StorageClassType,
    pub volume_type: VolumeType,
    pub cluster_id: String,
    pub filesystem_uid: String,
    pub consistency_group: Option<String>,
    /// Fileset name, or [`LIGHTWEIGHT_FILESET`] for directory volumes.
    pub fileset: String,
    /// Absolute path of the volume root.
    pub path: String,
}

impl VolumeIdentity {
    pub fn is_lightweight(&self) -> bool {
        self.volume_type == VolumeType::Lightweight || self.fileset == LIGHTWEIGHT_FILESET
    }

    /// Canonical 7-field encoding.
    pub fn encode(&self) -> String {
        let fileset = if self.fileset == LIGHTWEIGHT_FILESET { "" } else { self.fileset.as_str() };
        [
            self.storage_class_type.code(),
            self.volume_type.code(),
            self.cluster_id.as_str(),
            self.filesystem_uid.as_str(),
            self.consistency_group.as_deref().unwrap_or(""),
            fileset,
            &format!("{}{}", PATH_PREFIX, self.path),
        ]
        .join(";")
    }

    pub fn decode(handle: &str) -> Result<Self, HandleError> {
        let fields: Vec<&str> = handle.split(FIELD_SEPARATOR).collect();
        let identity = match fields.as_slice() {
            [cluster, fs_uid, path] => VolumeIdentity {
                storage_class_type: StorageClassType::Classic,
                volume_type: VolumeType::Lightweight,
                cluster_id: required(handle, "clusterId", cluster)?,
                filesystem_uid: required(handle, "fsUID", fs_uid)?,
                consistency_group: None,
                fileset: LIGHTWEIGHT_FILESET.to_string(),
                path: prefixed(handle, "path", PATH_PREFIX, path)?,
            },
            [cluster, fs_uid, fileset, path] => VolumeIdentity {
                storage_class_type: StorageClassType::Classic,
                volume_type: VolumeType::IndependentFileset,
                cluster_id: required(handle, "clusterId", cluster)?,
                filesystem_uid: required(handle, "fsUID", fs_uid)?,
                consistency_group: None,
                fileset: prefixed(handle, "fileset", FILESET_PREFIX, fileset)?,
                path: prefixed(handle, "path", PATH_PREFIX, path)?,
            },
            [cluster, fs_uid, fileset, cg, path] => VolumeIdentity {
                storage_class_type: StorageClassType::Advanced,
                volume_type: VolumeType::DependentFileset,
                cluster_id: required(handle, "clusterId", cluster)?,
                filesystem_uid: required(handle, "fsUID", fs_uid)?,
                consistency_group: Some(prefixed(handle, "cg", CG_PREFIX, cg)?),
                fileset: prefixed(handle, "fileset", FILESET_PREFIX, fileset)?,
                path: prefixed(handle, "path", PATH_PREFIX, path)?,
            },
            [sc_type, vol_type, cluster, fs_uid, cg, fileset, path] => {
                let storage_class_type = StorageClassType::from_code(sc_type).ok_or_else(|| HandleError::InvalidField {
                    input: handle.to_string(),
                    field: "storage class type",
                    value: sc_type.to_string(),
                })?;
                let volume_type = VolumeType::from_code(vol_type).ok_or_else(|| HandleError::InvalidField {
                    input: handle.to_string(),
                    field: "volume type",
                    value: vol_type.to_string(),
                })?;
                VolumeIdentity {
                    storage_class_type,
                    volume_type,
                    cluster_id: required(handle, "clusterId", cluster)?,
                    filesystem_uid: required(handle, "fsUID", fs_uid)?,
                    consistency_group: (!cg.is_empty()).then(|| cg.to_string()),
                    fileset: if fileset.is_empty() { LIGHTWEIGHT_FILESET.to_string() } else { fileset.to_string() },
                    path: prefixed(handle, "path", PATH_PREFIX, path)?,
                }
            }
            other => {
                return Err(HandleError::FieldCount {
                    input: handle.to_string(),
                    expected: "3, 4, 5 or 7",
                    found: other.len(),
                })
            }
        };
        Ok(identity)
    }
}

impl fmt::Display for VolumeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for VolumeIdentity {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

/// Decoded snapshot handle: `clusterId;fsUID;fileset;snapshot;path=<dir>[;cg=<group>]`.
///
/// For consistency-group snapshots the snapshot lives on the group fileset
/// and `fileset` names the member whose content the handle refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotIdentity {
    pub cluster_id: String,
    pub filesystem_uid: String,
    pub fileset: String,
    pub snapshot_name: String,
    /// Absolute path of the source volume root.
    pub path: String,
    pub consistency_group: Option<String>,
}

impl SnapshotIdentity {
    /// Fileset that actually owns the snapshot on the backend.
    pub fn snapshot_fileset(&self) -> &str {
        self.consistency_group.as_deref().unwrap_or(&self.fileset)
    }

    pub fn encode(&self) -> String {
        let mut encoded = format!(
            "{};{};{};{};{}{}",
            self.cluster_id, self.filesystem_uid, self.fileset, self.snapshot_name, PATH_PREFIX, self.path
        );
        if let Some(group) = &self.consistency_group {
            encoded.push(FIELD_SEPARATOR);
            encoded.push_str(CG_PREFIX);
            encoded.push_str(group);
        }
        encoded
    }

    pub fn decode(handle: &str) -> Result<Self, HandleError> {
        let fields: Vec<&str> = handle.split(FIELD_SEPARATOR).collect();
        let (base, group) = match fields.as_slice() {
            [a, b, c, d, e] => ([*a, *b, *c, *d, *e], None),
            [a, b, c, d, e, g] => ([*a, *b, *c, *d, *e], Some(prefixed(handle, "cg", CG_PREFIX, g)?)),
            other => {
                return Err(HandleError::FieldCount {
                    input: handle.to_string(),
                    expected: "5 or 6",
                    found: other.len(),
                })
            }
        };
        let [cluster, fs_uid, fileset, snapshot, path] = base;
        Ok(SnapshotIdentity {
            cluster_id: required(handle, "clusterId", cluster)?,
            filesystem_uid: required(handle, "fsUID", fs_uid)?,
            fileset: required(handle, "fileset", fileset)?,
            snapshot_name: required(handle, "snapshot", snapshot)?,
            path: prefixed(handle, "path", PATH_PREFIX, path)?,
            consistency_group: group,
        })
    }
}

impl fmt::Display for SnapshotIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for SnapshotIdentity {
    type Err = HandleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

fn required(input: &str, field: &'static str, value: &str) -> Result<String, HandleError> {
    if value.is_empty() {
        return Err(HandleError::EmptyField { input: input.to_string(), field });
    }
    Ok(value.to_string())
}

fn prefixed(input: &str, field: &'static str, prefix: &str, value: &str) -> Result<String, HandleError> {
    let stripped = value.strip_prefix(prefix).ok_or_else(|| HandleError::InvalidField {
        input: input.to_string(),
        field,
        value: value.to_string(),
    })?;
    required(input, field, stripped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn independent() -> VolumeIdentity {
        VolumeIdentity {
            storage_class_type: StorageClassType::Classic,
            volume_type: VolumeType::IndependentFileset,
            cluster_id: "7118073361626808055".to_string(),
            filesystem_uid: "0A1B2C3D:5F6E7D8C".to_string(),
            consistency_group: None,
            fileset: "pvc-42".to_string(),
            path: "/ibm/fs1/pvc-42".to_string(),
        }
    }

    #[test]
    fn test_encode_seven_fields() {
        assert_eq!(
            independent().encode(),
            "0;2;7118073361626808055;0A1B2C3D:5F6E7D8C;;pvc-42;path=/ibm/fs1/pvc-42"
        );
    }

    #[test]
    fn test_round_trip_all_volume_types() {
        let mut advanced = independent();
        advanced.storage_class_type = StorageClassType::Advanced;
        advanced.volume_type = VolumeType::DependentFileset;
        advanced.consistency_group = Some("cg-default".to_string());
        advanced.path = "/ibm/fs1/cg-default/pvc-42".to_string();

        let mut lightweight = independent();
        lightweight.volume_type = VolumeType::Lightweight;
        lightweight.fileset = LIGHTWEIGHT_FILESET.to_string();
        lightweight.path = "/ibm/fs1/lwdir/pvc-42".to_string();

        for identity in [independent(), advanced, lightweight] {
            assert_eq!(VolumeIdentity::decode(&identity.encode()).unwrap(), identity);
        }
    }

    #[test]
    fn test_empty_fileset_field_is_lightweight() {
        let decoded = VolumeIdentity::decode("0;0;c1;fsuid;;;path=/ibm/fs1/dir/pvc-1").unwrap();
        assert_eq!(decoded.fileset, "LW");
        assert!(decoded.is_lightweight());
        assert_eq!(decoded.encode(), "0;0;c1;fsuid;;;path=/ibm/fs1/dir/pvc-1");
    }

    #[test]
    fn test_legacy_shapes() {
        let three = VolumeIdentity::decode("c1;fsuid;path=/ibm/fs1/lw/pvc-1").unwrap();
        assert_eq!(three.fileset, LIGHTWEIGHT_FILESET);
        assert_eq!(three.volume_type, VolumeType::Lightweight);

        let four = VolumeIdentity::decode("c1;fsuid;fileset=pvc-2;path=/ibm/fs1/pvc-2").unwrap();
        assert_eq!(four.fileset, "pvc-2");
        assert_eq!(four.storage_class_type, StorageClassType::Classic);

        let five = VolumeIdentity::decode("c1;fsuid;fileset=pvc-3;cg=grp;path=/ibm/fs1/grp/pvc-3").unwrap();
        assert_eq!(five.consistency_group.as_deref(), Some("grp"));
        assert_eq!(five.storage_class_type, StorageClassType::Advanced);

        // re-encoding a legacy handle yields the canonical shape, which decodes identically
        for legacy in [three, four, five] {
            let canonical = legacy.encode();
            assert_eq!(canonical.split(';').count(), 7);
            assert_eq!(VolumeIdentity::decode(&canonical).unwrap(), legacy);
        }
    }

    #[test]
    fn test_malformed_handles() {
        assert!(matches!(
            VolumeIdentity::decode("just-one-field"),
            Err(HandleError::FieldCount { found: 1, .. })
        ));
        assert!(matches!(
            VolumeIdentity::decode("a;b;c;d;e;f"),
            Err(HandleError::FieldCount { found: 6, .. })
        ));
        assert!(matches!(
            VolumeIdentity::decode("c1;fsuid;/no/prefix"),
            Err(HandleError::InvalidField { field: "path", .. })
        ));
        assert!(matches!(
            VolumeIdentity::decode("9;2;c1;fsuid;;fset;path=/x"),
            Err(HandleError::InvalidField { field: "storage class type", .. })
        ));
        assert!(matches!(
            VolumeIdentity::decode(";fsuid;path=/x"),
            Err(HandleError::EmptyField { field: "clusterId", .. })
        ));
    }

    #[test]
    fn test_snapshot_handle_round_trip() {
        let plain = SnapshotIdentity {
            cluster_id: "c1".to_string(),
            filesystem_uid: "fsuid".to_string(),
            fileset: "pvc-1".to_string(),
            snapshot_name: "snapshot-abc".to_string(),
            path: "/ibm/fs1/pvc-1".to_string(),
            consistency_group: None,
        };
        assert_eq!(plain.encode(), "c1;fsuid;pvc-1;snapshot-abc;path=/ibm/fs1/pvc-1");
        assert_eq!(SnapshotIdentity::decode(&plain.encode()).unwrap(), plain);
        assert_eq!(plain.snapshot_fileset(), "pvc-1");

        let mut grouped = plain.clone();
        grouped.consistency_group = Some("grp".to_string());
        assert_eq!(SnapshotIdentity::decode(&grouped.encode()).unwrap(), grouped);
        assert_eq!(grouped.snapshot_fileset(), "grp");

        assert!(SnapshotIdentity::decode("c1;fsuid;pvc-1").is_err());
    }
}
