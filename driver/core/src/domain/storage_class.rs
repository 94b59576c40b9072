// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! StorageClass Parameter Resolution
//!
//! Turns the free-form `parameters` map of a Kubernetes StorageClass into a
//! validated [`StorageClassPlan`]. Resolution is pure: it never talks to the
//! backend, so conflicting or malformed classes fail before any mutation.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::backend::BackendVersion;
use crate::domain::error::CsiError;
use crate::domain::permissions::Permissions;
use crate::domain::quota::{default_inode_limit, parse_size};
use crate::domain::volume_handle::{StorageClassType, VolumeType};

/// Parameter keys understood by the resolver.
pub mod params {
    pub const VOL_BACKEND_FS: &str = "volBackendFs";
    pub const CLUSTER_ID: &str = "clusterId";
    pub const VOL_DIR_BASE_PATH: &str = "volDirBasePath";
    pub const FILESET_TYPE: &str = "filesetType";
    pub const PARENT_FILESET: &str = "parentFileset";
    pub const INODE_LIMIT: &str = "inodeLimit";
    pub const UID: &str = "uid";
    pub const GID: &str = "gid";
    pub const PERMISSIONS: &str = "permissions";
    pub const COMPRESSION: &str = "compression";
    pub const TIER: &str = "tier";
    pub const CONSISTENCY_GROUP: &str = "consistencyGroup";
    pub const VERSION: &str = "version";
    pub const SHARED: &str = "shared";
    pub const NODE_CLASS: &str = "nodeClass";

    /// Injected by the external-provisioner with `--extra-create-metadata`.
    pub const PVC_NAMESPACE: &str = "csi.storage.k8s.io/pvc/namespace";
    pub const PVC_NAME: &str = "csi.storage.k8s.io/pvc/name";
    pub const PV_NAME: &str = "csi.storage.k8s.io/pv/name";

    /// Keys under this prefix are sidecar metadata and never rejected.
    pub const SIDECAR_PREFIX: &str = "csi.storage.k8s.io/";

    pub const KNOWN: &[&str] = &[
        VOL_BACKEND_FS,
        CLUSTER_ID,
        VOL_DIR_BASE_PATH,
        FILESET_TYPE,
        PARENT_FILESET,
        INODE_LIMIT,
        UID,
        GID,
        PERMISSIONS,
        COMPRESSION,
        TIER,
        CONSISTENCY_GROUP,
        VERSION,
        SHARED,
        NODE_CLASS,
    ];
}

pub const ROOT_FILESET: &str = "root";

/// Inode cap applied to a consistency-group fileset when the class sets none.
pub const DEFAULT_CONSISTENCY_GROUP_INODE_LIMIT: u64 = 1_000_000;

/// Oldest backend release supporting consistency-group (version 2) volumes.
pub fn min_consistency_group_version() -> BackendVersion {
    BackendVersion::new(&[5, 1, 3, 0])
}

const COMPRESSION_ALGORITHMS: &[&str] = &["z", "lz4", "zfast", "alphae", "alphaeht"];

static OWNER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("static regex"));
// tier lands in fileset names and policy rule text
static TIER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex"));

/// Shape of the backend object a volume maps onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeLayout {
    /// Plain directory under an existing base path.
    Lightweight { base_path: String },
    /// One independent fileset per volume.
    Independent,
    /// Dependent fileset sharing the parent's inode space.
    Dependent { parent: String },
    /// Dependent fileset inside a consistency-group fileset.
    ConsistencyGroup { group: Option<String> },
}

/// Validated storage class parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClassPlan {
    pub filesystem: Option<String>,
    pub cluster_id: Option<String>,
    pub layout: VolumeLayout,
    pub inode_limit: Option<u64>,
    pub uid: Option<String>,
    pub gid: Option<String>,
    pub permissions: Option<Permissions>,
    /// Upper-case algorithm tag (`Z`, `LZ4`, ...).
    pub compression: Option<String>,
    pub tier: Option<String>,
    pub shared: bool,
    pub node_class: Option<String>,
    pub pvc_namespace: Option<String>,
}

impl StorageClassPlan {
    pub fn resolve(parameters: &HashMap<String, String>) -> Result<Self, CsiError> {
        for key in parameters.keys() {
            if !params::KNOWN.contains(&key.as_str()) && !key.starts_with(params::SIDECAR_PREFIX) {
                return Err(CsiError::invalid(format!("unknown storage class parameter '{}'", key)));
            }
        }

        let get = |key: &str| param(parameters, key);

        let advanced = match get(params::VERSION) {
            None | Some("1") => false,
            Some("2") => true,
            Some(other) => {
                return Err(CsiError::invalid(format!("invalid version '{}': must be 1 or 2", other)));
            }
        };

        let dependent = match get(params::FILESET_TYPE) {
            None => None,
            Some("independent") => Some(false),
            Some("dependent") => Some(true),
            Some(other) => {
                return Err(CsiError::invalid(format!(
                    "invalid filesetType '{}': must be independent or dependent",
                    other
                )));
            }
        };

        let base_path = get(params::VOL_DIR_BASE_PATH);
        let parent = get(params::PARENT_FILESET);
        let group = get(params::CONSISTENCY_GROUP);

        let inode_limit = get(params::INODE_LIMIT)
            .map(|raw| {
                parse_size(raw)
                    .ok()
                    .filter(|v| *v > 0)
                    .ok_or_else(|| CsiError::invalid(format!("invalid inodeLimit '{}'", raw)))
            })
            .transpose()?;

        let compression = match get(params::COMPRESSION).map(str::to_ascii_lowercase) {
            None => None,
            Some(v) if v == "false" => None,
            Some(v) if v == "true" => Some("Z".to_string()),
            Some(v) if COMPRESSION_ALGORITHMS.contains(&v.as_str()) => Some(v.to_ascii_uppercase()),
            Some(v) => {
                return Err(CsiError::invalid(format!(
                    "invalid compression '{}': must be one of true, false, {}",
                    v,
                    COMPRESSION_ALGORITHMS.join(", ")
                )));
            }
        };

        let tier = match get(params::TIER) {
            Some(v) if TIER_RE.is_match(v) => Some(v.to_string()),
            Some(v) => {
                return Err(CsiError::invalid(format!(
                    "invalid tier '{}': pool names may only contain letters, digits and underscores",
                    v
                )));
            }
            None => None,
        };

        if advanced {
            if base_path.is_some() {
                return Err(CsiError::invalid(
                    "volDirBasePath and version=2 cannot be specified together",
                ));
            }
            if parent.is_some() {
                return Err(CsiError::invalid("parentFileset and version=2 cannot be specified together"));
            }
            if dependent.is_some() {
                return Err(CsiError::invalid("filesetType and version=2 cannot be specified together"));
            }
        } else if group.is_some() {
            return Err(CsiError::invalid("consistencyGroup requires version=2"));
        }

        if base_path.is_some() {
            for (key, present) in [
                (params::FILESET_TYPE, dependent.is_some()),
                (params::PARENT_FILESET, parent.is_some()),
                (params::INODE_LIMIT, inode_limit.is_some()),
                (params::COMPRESSION, compression.is_some()),
                (params::TIER, tier.is_some()),
            ] {
                if present {
                    return Err(CsiError::invalid(format!(
                        "{} cannot be specified together with volDirBasePath",
                        key
                    )));
                }
            }
        }

        let layout = if advanced {
            VolumeLayout::ConsistencyGroup { group: group.map(str::to_string) }
        } else if let Some(base) = base_path {
            VolumeLayout::Lightweight { base_path: base.trim_matches('/').to_string() }
        } else if dependent == Some(true) {
            if inode_limit.is_some() {
                return Err(CsiError::invalid("inodeLimit cannot be specified for dependent filesets"));
            }
            VolumeLayout::Dependent { parent: parent.unwrap_or(ROOT_FILESET).to_string() }
        } else {
            if parent.is_some() {
                return Err(CsiError::invalid(
                    "parentFileset can only be specified with filesetType=dependent",
                ));
            }
            VolumeLayout::Independent
        };

        let uid = get(params::UID).map(|v| validate_owner(params::UID, v)).transpose()?;
        let gid = get(params::GID).map(|v| validate_owner(params::GID, v)).transpose()?;
        let permissions = get(params::PERMISSIONS).map(str::parse::<Permissions>).transpose()?;

        let shared = match get(params::SHARED).map(str::to_ascii_lowercase).as_deref() {
            None | Some("false") => false,
            Some("true") => true,
            Some(other) => {
                return Err(CsiError::invalid(format!("invalid shared '{}': must be true or false", other)));
            }
        };

        Ok(StorageClassPlan {
            filesystem: get(params::VOL_BACKEND_FS).map(str::to_string),
            cluster_id: get(params::CLUSTER_ID).map(str::to_string),
            layout,
            inode_limit,
            uid,
            gid,
            permissions,
            compression,
            tier,
            shared,
            node_class: get(params::NODE_CLASS).map(str::to_string),
            pvc_namespace: get(params::PVC_NAMESPACE).map(str::to_string),
        })
    }

    pub fn storage_class_type(&self) -> StorageClassType {
        match self.layout {
            VolumeLayout::ConsistencyGroup { .. } => StorageClassType::Advanced,
            _ => StorageClassType::Classic,
        }
    }

    pub fn volume_type(&self) -> VolumeType {
        match self.layout {
            VolumeLayout::Lightweight { .. } => VolumeType::Lightweight,
            VolumeLayout::Independent => VolumeType::IndependentFileset,
            VolumeLayout::Dependent { .. } | VolumeLayout::ConsistencyGroup { .. } => VolumeType::DependentFileset,
        }
    }

    /// Inode limit for the volume's own fileset.
    ///
    /// Only independent filesets carry one; consistency-group members and
    /// dependent filesets share their parent's inode space and get `0`.
    pub fn inode_limit_for(&self, capacity_bytes: u64) -> u64 {
        match self.layout {
            VolumeLayout::Independent => self.inode_limit.unwrap_or_else(|| default_inode_limit(capacity_bytes)),
            _ => 0,
        }
    }

    /// Inode limit for the consistency-group fileset itself.
    pub fn group_inode_limit(&self) -> u64 {
        self.inode_limit.unwrap_or(DEFAULT_CONSISTENCY_GROUP_INODE_LIMIT)
    }

    /// Consistency group a volume joins: explicit, else derived from the PVC namespace.
    pub fn consistency_group_name(&self) -> Option<String> {
        match &self.layout {
            VolumeLayout::ConsistencyGroup { group: Some(group) } => Some(group.clone()),
            VolumeLayout::ConsistencyGroup { group: None } => {
                self.pvc_namespace.as_ref().map(|ns| format!("{}-cg", ns))
            }
            _ => None,
        }
    }

    /// `uid:gid` owner string, when either half was configured.
    pub fn owner(&self) -> Option<String> {
        match (&self.uid, &self.gid) {
            (None, None) => None,
            (uid, gid) => Some(format!(
                "{}:{}",
                uid.as_deref().unwrap_or("root"),
                gid.as_deref().unwrap_or("root")
            )),
        }
    }

    /// Mode applied to the volume root: `shared` wins, then explicit permissions.
    pub fn effective_permissions(&self) -> Option<Permissions> {
        if self.shared {
            Some(Permissions::SHARED)
        } else {
            self.permissions
        }
    }
}

fn param<'a>(parameters: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    parameters.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn validate_owner(key: &str, value: &str) -> Result<String, CsiError> {
    if OWNER_RE.is_match(value) {
        Ok(value.to_string())
    } else {
        Err(CsiError::invalid(format!("invalid {} '{}'", key, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn resolve(map: HashMap<&str, &str>) -> Result<StorageClassPlan, CsiError> {
        let owned = map.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        StorageClassPlan::resolve(&owned)
    }

    #[test]
    fn test_default_is_independent_classic() {
        let plan = resolve(hashmap! { "volBackendFs" => "fs1" }).unwrap();
        assert_eq!(plan.layout, VolumeLayout::Independent);
        assert_eq!(plan.storage_class_type(), StorageClassType::Classic);
        assert_eq!(plan.volume_type(), VolumeType::IndependentFileset);
        assert_eq!(plan.filesystem.as_deref(), Some("fs1"));
    }

    #[test]
    fn test_version_two_excludes_base_path() {
        let err = resolve(hashmap! { "version" => "2", "volDirBasePath" => "x" }).unwrap_err();
        assert!(matches!(err, CsiError::InvalidArgument(_)));
        assert!(err.to_string().contains("volDirBasePath"));

        assert!(resolve(hashmap! { "version" => "2", "parentFileset" => "p" }).is_err());
        assert!(resolve(hashmap! { "version" => "2", "filesetType" => "dependent" }).is_err());
        assert!(resolve(hashmap! { "consistencyGroup" => "g" }).is_err());
    }

    #[test]
    fn test_consistency_group_inode_limit_is_zero() {
        let plan = resolve(hashmap! { "version" => "2" }).unwrap();
        assert_eq!(plan.inode_limit_for(parse_size("1Gi").unwrap()), 0);
        assert_eq!(plan.group_inode_limit(), DEFAULT_CONSISTENCY_GROUP_INODE_LIMIT);
        assert_eq!(plan.volume_type(), VolumeType::DependentFileset);
    }

    #[test]
    fn test_default_consistency_group_from_namespace() {
        let plan = resolve(hashmap! {
            "version" => "2",
            "csi.storage.k8s.io/pvc/namespace" => "team-a",
        })
        .unwrap();
        assert_eq!(plan.consistency_group_name().as_deref(), Some("team-a-cg"));

        let explicit = resolve(hashmap! { "version" => "2", "consistencyGroup" => "db" }).unwrap();
        assert_eq!(explicit.consistency_group_name().as_deref(), Some("db"));
    }

    #[test]
    fn test_inode_defaults_by_size() {
        let plan = resolve(hashmap! {}).unwrap();
        assert_eq!(plan.inode_limit_for(parse_size("5Gi").unwrap()), 100_000);
        assert_eq!(plan.inode_limit_for(parse_size("20Gi").unwrap()), 200_000);

        let explicit = resolve(hashmap! { "inodeLimit" => "500000" }).unwrap();
        assert_eq!(explicit.inode_limit_for(parse_size("20Gi").unwrap()), 500_000);
    }

    #[test]
    fn test_enumerated_values() {
        assert!(resolve(hashmap! { "version" => "3" }).is_err());
        assert!(resolve(hashmap! { "filesetType" => "sparse" }).is_err());
        assert!(resolve(hashmap! { "compression" => "zstd" }).is_err());
        assert!(resolve(hashmap! { "shared" => "maybe" }).is_err());

        let plan = resolve(hashmap! { "compression" => "LZ4" }).unwrap();
        assert_eq!(plan.compression.as_deref(), Some("LZ4"));
        let plan = resolve(hashmap! { "compression" => "true" }).unwrap();
        assert_eq!(plan.compression.as_deref(), Some("Z"));
        let plan = resolve(hashmap! { "compression" => "false" }).unwrap();
        assert_eq!(plan.compression, None);
    }

    #[test]
    fn test_tier_passes_through() {
        let plan = resolve(hashmap! { "tier" => "not_a_real_pool" }).unwrap();
        assert_eq!(plan.tier.as_deref(), Some("not_a_real_pool"));
    }

    #[test]
    fn test_tier_rejects_rule_syntax() {
        for tier in ["gold' WHERE 1=1 OR 'x", "gold-pool", "pool;rm"] {
            let err = resolve(hashmap! { "tier" => tier }).unwrap_err();
            assert!(matches!(err, CsiError::InvalidArgument(_)), "{}", tier);
        }
    }

    #[test]
    fn test_lightweight_conflicts() {
        let plan = resolve(hashmap! { "volDirBasePath" => "/lwdir/" }).unwrap();
        assert_eq!(plan.layout, VolumeLayout::Lightweight { base_path: "lwdir".to_string() });
        assert_eq!(plan.inode_limit_for(parse_size("1Gi").unwrap()), 0);

        assert!(resolve(hashmap! { "volDirBasePath" => "lw", "inodeLimit" => "1000" }).is_err());
        assert!(resolve(hashmap! { "volDirBasePath" => "lw", "tier" => "silver" }).is_err());
    }

    #[test]
    fn test_dependent_rules() {
        let plan = resolve(hashmap! { "filesetType" => "dependent", "parentFileset" => "parent1" }).unwrap();
        assert_eq!(plan.layout, VolumeLayout::Dependent { parent: "parent1".to_string() });

        let plan = resolve(hashmap! { "filesetType" => "dependent" }).unwrap();
        assert_eq!(plan.layout, VolumeLayout::Dependent { parent: ROOT_FILESET.to_string() });

        assert!(resolve(hashmap! { "parentFileset" => "parent1" }).is_err());
        assert!(resolve(hashmap! { "filesetType" => "dependent", "inodeLimit" => "100" }).is_err());
    }

    #[test]
    fn test_ownership_and_permissions() {
        let plan = resolve(hashmap! { "uid" => "1000", "gid" => "1000", "permissions" => "750" }).unwrap();
        assert_eq!(plan.owner().as_deref(), Some("1000:1000"));
        assert_eq!(plan.effective_permissions().map(|p| p.mode()), Some(0o750));

        let shared = resolve(hashmap! { "shared" => "true", "permissions" => "750" }).unwrap();
        assert_eq!(shared.effective_permissions(), Some(Permissions::SHARED));

        assert!(resolve(hashmap! { "uid" => "bad user" }).is_err());
        assert!(resolve(hashmap! { "permissions" => "999" }).is_err());
    }

    #[test]
    fn test_unknown_parameters_rejected_but_sidecar_metadata_allowed() {
        assert!(resolve(hashmap! { "volBackendFS" => "fs1" }).is_err());
        assert!(resolve(hashmap! { "csi.storage.k8s.io/pv/name" => "pvc-1" }).is_ok());
    }
}
