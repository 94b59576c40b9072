// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Custom Resource Definitions for the driver operator

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const DEFAULT_DRIVER_IMAGE: &str = "quay.io/ibm-spectrum-scale/ibm-spectrum-scale-csi-driver:v2.10.0";
pub const DEFAULT_REGISTRAR_IMAGE: &str = "registry.k8s.io/sig-storage/csi-node-driver-registrar:v2.10.0";
pub const DEFAULT_ATTACHER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-attacher:v4.5.0";
pub const DEFAULT_PROVISIONER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-provisioner:v4.0.0";
pub const DEFAULT_SNAPSHOTTER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-snapshotter:v7.0.1";
pub const DEFAULT_RESIZER_IMAGE: &str = "registry.k8s.io/sig-storage/csi-resizer:v1.10.0";
pub const DEFAULT_LIVENESSPROBE_IMAGE: &str = "registry.k8s.io/sig-storage/livenessprobe:v2.12.0";

pub const DEFAULT_KUBELET_ROOT_DIR: &str = "/var/lib/kubelet";

/// CSIScaleOperator deploys and configures the driver in one namespace
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "csi.ibm.com",
    version = "v1",
    kind = "CSIScaleOperator",
    plural = "csiscaleoperators",
    status = "CSIScaleOperatorStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CSIScaleOperatorSpec {
    /// Clusters the driver talks to; exactly one must be primary
    pub clusters: Vec<OperatorCluster>,

    #[serde(default)]
    pub attacher_node_selector: Vec<NodeSelectorTerm>,

    #[serde(default)]
    pub provisioner_node_selector: Vec<NodeSelectorTerm>,

    #[serde(default)]
    pub plugin_node_selector: Vec<NodeSelectorTerm>,

    #[serde(default)]
    pub snapshotter_node_selector: Vec<NodeSelectorTerm>,

    #[serde(default)]
    pub resizer_node_selector: Vec<NodeSelectorTerm>,

    /// Image overrides, by component
    #[serde(default)]
    pub images: ImageOverrides,

    /// Registry mirror prepended to every image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_registry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet_root_dir_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCluster {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<OperatorPrimary>,

    pub rest_api: Vec<OperatorRestApi>,

    #[serde(default)]
    pub secure_ssl_mode: bool,

    /// ConfigMap holding the CA bundle under key `ca.crt`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<String>,

    /// Secret holding `username` and `password` for the management API
    pub secrets: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorPrimary {
    pub primary_fs: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_fset: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cluster: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperatorRestApi {
    pub gui_host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gui_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NodeSelectorTerm {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_driver_registrar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attacher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshotter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resizer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub livenessprobe: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CSIScaleOperatorStatus {
    /// Running, Failed or Pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl CSIScaleOperatorSpec {
    pub fn kubelet_root_dir(&self) -> &str {
        self.kubelet_root_dir_path.as_deref().unwrap_or(DEFAULT_KUBELET_ROOT_DIR)
    }

    pub fn selector_map(terms: &[NodeSelectorTerm]) -> BTreeMap<String, String> {
        terms.iter().map(|t| (t.key.clone(), t.value.clone())).collect()
    }
}
