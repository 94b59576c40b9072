// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Operator Application Service
//!
//! Reconciles a [`CSIScaleOperator`] into the objects that run the driver.
//! Each child object is a [`ChildResource`] variant with its own validator
//! and renderer; the [`ChildApplier`] seam talks to the API server.
//!
//! All children are validated before anything is applied, so an invalid
//! spec never leaves a half-updated deployment behind.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docker_image::DockerImage;
use k8s_openapi::api::apps::v1::{DaemonSet, StatefulSet};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use metrics::counter;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::config::{
    ClusterConfig, ConfigError, Credentials, DriverConfigManifest, PrimaryConfig, RestEndpoint, DEFAULT_DRIVER_NAME,
    DEFAULT_GUI_PORT,
};
use crate::domain::events::OperatorEvent;
use crate::domain::operator::{
    CSIScaleOperator, CSIScaleOperatorSpec, CSIScaleOperatorStatus, DEFAULT_ATTACHER_IMAGE, DEFAULT_DRIVER_IMAGE,
    DEFAULT_LIVENESSPROBE_IMAGE, DEFAULT_PROVISIONER_IMAGE, DEFAULT_REGISTRAR_IMAGE, DEFAULT_RESIZER_IMAGE,
    DEFAULT_SNAPSHOTTER_IMAGE,
};
use crate::infrastructure::event_bus::EventBus;

/// Key of the driver manifest inside the rendered ConfigMap
pub const CONFIG_KEY: &str = "config.yaml";
pub const CONFIG_MOUNT: &str = "/etc/scale-csi";
pub const SECRETS_MOUNT: &str = "/var/lib/scale-csi/secrets";
pub const CACERT_MOUNT: &str = "/var/lib/scale-csi/cacert";
/// Keys every cluster credential Secret must carry
pub const SECRET_KEYS: [&str; 2] = ["username", "password"];

const SOCKET_DIR: &str = "/csi";
const MANAGED_BY: &str = "scale-csi-operator";

static DNS_SUBDOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("static regex"));

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("invalid CSIScaleOperator spec: {0}")]
    InvalidSpec(String),

    #[error("secret {namespace}/{name} is not usable: {reason}")]
    Secret {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("invalid image reference: {0}")]
    Image(#[from] docker_image::DockerImageError),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl OperatorError {
    /// Errors that only a spec edit can fix
    pub fn is_permanent(&self) -> bool {
        matches!(self, OperatorError::InvalidSpec(_) | OperatorError::Image(_))
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::Serialization(err.to_string())
    }
}

impl From<ConfigError> for OperatorError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Parse(e) => OperatorError::Serialization(e.to_string()),
            other => OperatorError::InvalidSpec(other.to_string()),
        }
    }
}

// ============================================================================
// Child Resources
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarKind {
    Attacher,
    Provisioner,
    Snapshotter,
    Resizer,
}

impl SidecarKind {
    pub const ALL: [SidecarKind; 4] = [
        SidecarKind::Attacher,
        SidecarKind::Provisioner,
        SidecarKind::Snapshotter,
        SidecarKind::Resizer,
    ];

    pub fn component(&self) -> &'static str {
        match self {
            SidecarKind::Attacher => "attacher",
            SidecarKind::Provisioner => "provisioner",
            SidecarKind::Snapshotter => "snapshotter",
            SidecarKind::Resizer => "resizer",
        }
    }

    fn image<'a>(&self, spec: &'a CSIScaleOperatorSpec) -> (Option<&'a str>, &'static str) {
        let images = &spec.images;
        match self {
            SidecarKind::Attacher => (images.attacher.as_deref(), DEFAULT_ATTACHER_IMAGE),
            SidecarKind::Provisioner => (images.provisioner.as_deref(), DEFAULT_PROVISIONER_IMAGE),
            SidecarKind::Snapshotter => (images.snapshotter.as_deref(), DEFAULT_SNAPSHOTTER_IMAGE),
            SidecarKind::Resizer => (images.resizer.as_deref(), DEFAULT_RESIZER_IMAGE),
        }
    }

    fn node_selector(&self, spec: &CSIScaleOperatorSpec) -> BTreeMap<String, String> {
        let terms = match self {
            SidecarKind::Attacher => &spec.attacher_node_selector,
            SidecarKind::Provisioner => &spec.provisioner_node_selector,
            SidecarKind::Snapshotter => &spec.snapshotter_node_selector,
            SidecarKind::Resizer => &spec.resizer_node_selector,
        };
        CSIScaleOperatorSpec::selector_map(terms)
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--csi-address={}/csi.sock", SOCKET_DIR),
            "--v=5".to_string(),
            "--timeout=2m".to_string(),
            "--leader-election".to_string(),
        ];
        match self {
            // PVC namespace names the default consistency group
            SidecarKind::Provisioner => args.push("--extra-create-metadata".to_string()),
            SidecarKind::Resizer => args.push("--handle-volume-inuse-error=false".to_string()),
            SidecarKind::Attacher | SidecarKind::Snapshotter => {}
        }
        args
    }
}

/// One object the operator owns (or, for secrets, checks)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildResource {
    ConfigMap,
    /// Credential Secret referenced by a cluster; validated, never created
    Secret(String),
    Plugin,
    Sidecar(SidecarKind),
}

/// A rendered object ready to be applied
#[derive(Debug, Clone)]
pub enum RenderedChild {
    ConfigMap(ConfigMap),
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
}

impl RenderedChild {
    pub fn name(&self) -> String {
        match self {
            RenderedChild::ConfigMap(o) => o.name_any(),
            RenderedChild::DaemonSet(o) => o.name_any(),
            RenderedChild::StatefulSet(o) => o.name_any(),
        }
    }
}

impl ChildResource {
    /// Children in apply order: secrets first so a missing one stops the rollout early
    pub fn for_spec(spec: &CSIScaleOperatorSpec) -> Vec<ChildResource> {
        let mut secrets: Vec<String> = spec.clusters.iter().map(|c| c.secrets.clone()).collect();
        secrets.sort();
        secrets.dedup();

        let mut children: Vec<ChildResource> = secrets.into_iter().map(ChildResource::Secret).collect();
        children.push(ChildResource::ConfigMap);
        children.push(ChildResource::Plugin);
        children.extend(SidecarKind::ALL.iter().copied().map(ChildResource::Sidecar));
        children
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChildResource::ConfigMap => "ConfigMap",
            ChildResource::Secret(_) => "Secret",
            ChildResource::Plugin => "DaemonSet",
            ChildResource::Sidecar(_) => "StatefulSet",
        }
    }

    pub fn name(&self, owner: &str) -> String {
        match self {
            ChildResource::ConfigMap => format!("{}-config", owner),
            ChildResource::Secret(name) => name.clone(),
            ChildResource::Plugin => format!("{}-plugin", owner),
            ChildResource::Sidecar(kind) => format!("{}-{}", owner, kind.component()),
        }
    }

    pub fn validate(&self, cr: &CSIScaleOperator) -> Result<(), OperatorError> {
        let spec = &cr.spec;
        match self {
            ChildResource::ConfigMap => {
                for cluster in &spec.clusters {
                    if cluster.secrets.is_empty() {
                        return Err(OperatorError::InvalidSpec(format!(
                            "cluster {}: secrets cannot be empty",
                            cluster.id
                        )));
                    }
                }
                driver_config(cr).validate()?;
                Ok(())
            }
            ChildResource::Secret(name) => {
                if name.len() > 253 || !DNS_SUBDOMAIN.is_match(name) {
                    return Err(OperatorError::InvalidSpec(format!("invalid secret name '{}'", name)));
                }
                Ok(())
            }
            ChildResource::Plugin => {
                if !spec.kubelet_root_dir().starts_with('/') {
                    return Err(OperatorError::InvalidSpec(format!(
                        "kubeletRootDirPath must be absolute, got '{}'",
                        spec.kubelet_root_dir()
                    )));
                }
                resolve_image(spec.images.driver.as_deref(), DEFAULT_DRIVER_IMAGE, &spec.image_registry)?;
                resolve_image(
                    spec.images.node_driver_registrar.as_deref(),
                    DEFAULT_REGISTRAR_IMAGE,
                    &spec.image_registry,
                )?;
                resolve_image(
                    spec.images.livenessprobe.as_deref(),
                    DEFAULT_LIVENESSPROBE_IMAGE,
                    &spec.image_registry,
                )?;
                validate_selector(&spec.plugin_node_selector)
            }
            ChildResource::Sidecar(kind) => {
                let (custom, default) = kind.image(spec);
                resolve_image(custom, default, &spec.image_registry)?;
                let terms = match kind {
                    SidecarKind::Attacher => &spec.attacher_node_selector,
                    SidecarKind::Provisioner => &spec.provisioner_node_selector,
                    SidecarKind::Snapshotter => &spec.snapshotter_node_selector,
                    SidecarKind::Resizer => &spec.resizer_node_selector,
                };
                validate_selector(terms)
            }
        }
    }

    /// Render the object; `None` for children that are only checked
    pub fn render(&self, cr: &CSIScaleOperator) -> Result<Option<RenderedChild>, OperatorError> {
        let owner = cr.name_any();
        let name = self.name(&owner);
        let namespace = cr.namespace();
        let spec = &cr.spec;

        let rendered = match self {
            ChildResource::Secret(_) => return Ok(None),
            ChildResource::ConfigMap => {
                let manifest = driver_config(cr).to_yaml_string()?;
                let mut config_map: ConfigMap = serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": name, "namespace": namespace, "labels": labels(&owner, "config") },
                    "data": { CONFIG_KEY: manifest },
                }))?;
                config_map.metadata.owner_references = cr.controller_owner_ref(&()).map(|o| vec![o]);
                RenderedChild::ConfigMap(config_map)
            }
            ChildResource::Plugin => {
                let mut daemon_set: DaemonSet = serde_json::from_value(plugin_daemon_set(cr, &name)?)?;
                daemon_set.metadata.owner_references = cr.controller_owner_ref(&()).map(|o| vec![o]);
                RenderedChild::DaemonSet(daemon_set)
            }
            ChildResource::Sidecar(kind) => {
                let (custom, default) = kind.image(spec);
                let image = resolve_image(custom, default, &spec.image_registry)?;
                let labels = labels(&owner, kind.component());
                let mut stateful_set: StatefulSet = serde_json::from_value(json!({
                    "apiVersion": "apps/v1",
                    "kind": "StatefulSet",
                    "metadata": { "name": name, "namespace": namespace, "labels": labels },
                    "spec": {
                        "replicas": 1,
                        "serviceName": name,
                        "selector": { "matchLabels": labels },
                        "template": {
                            "metadata": { "labels": labels },
                            "spec": {
                                "nodeSelector": kind.node_selector(spec),
                                "containers": [{
                                    "name": kind.component(),
                                    "image": image,
                                    "args": kind.args(),
                                    "volumeMounts": [{ "name": "socket-dir", "mountPath": SOCKET_DIR }],
                                }],
                                "volumes": [{
                                    "name": "socket-dir",
                                    "hostPath": { "path": plugin_dir(spec), "type": "DirectoryOrCreate" },
                                }],
                            },
                        },
                    },
                }))?;
                stateful_set.metadata.owner_references = cr.controller_owner_ref(&()).map(|o| vec![o]);
                RenderedChild::StatefulSet(stateful_set)
            }
        };
        Ok(Some(rendered))
    }
}

fn validate_selector(terms: &[crate::domain::operator::NodeSelectorTerm]) -> Result<(), OperatorError> {
    match terms.iter().find(|t| t.key.trim().is_empty()) {
        Some(term) => Err(OperatorError::InvalidSpec(format!(
            "node selector with value '{}' has an empty key",
            term.value
        ))),
        None => Ok(()),
    }
}

fn labels(owner: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "scale-csi".to_string()),
        ("app.kubernetes.io/instance".to_string(), owner.to_string()),
        ("app.kubernetes.io/component".to_string(), component.to_string()),
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
    ])
}

fn driver_name(spec: &CSIScaleOperatorSpec) -> &str {
    spec.driver_name.as_deref().unwrap_or(DEFAULT_DRIVER_NAME)
}

fn plugin_dir(spec: &CSIScaleOperatorSpec) -> String {
    format!("{}/plugins/{}", spec.kubelet_root_dir().trim_end_matches('/'), driver_name(spec))
}

/// Image reference for a component, rewritten onto the mirror registry when one is set
pub fn resolve_image(custom: Option<&str>, default: &str, registry: &Option<String>) -> Result<String, OperatorError> {
    let reference = custom.unwrap_or(default);
    let image = DockerImage::parse(reference)?;
    Ok(mirrored_image_name(&image, reference, registry))
}

fn mirrored_image_name(image: &DockerImage, reference: &str, registry: &Option<String>) -> String {
    match registry {
        Some(registry) => {
            let short = image.name.rsplit('/').next().unwrap_or(&image.name);
            let mut mirrored = format!("{}/{}", registry.trim_end_matches('/'), short);
            if let Some(tag) = &image.tag {
                mirrored.push(':');
                mirrored.push_str(tag);
            }
            if let Some(digest) = &image.digest {
                mirrored.push('@');
                mirrored.push_str(digest);
            }
            mirrored
        }
        None => reference.to_string(),
    }
}

/// The driver manifest the plugin reads, with credentials and CA bundles
/// pointing at the volumes the DaemonSet mounts
pub fn driver_config(cr: &CSIScaleOperator) -> DriverConfigManifest {
    let spec = &cr.spec;
    let mut manifest = DriverConfigManifest::default();
    manifest.metadata.name = cr.name_any();
    manifest.spec.driver.name = driver_name(spec).to_string();
    manifest.spec.clusters = spec
        .clusters
        .iter()
        .map(|cluster| ClusterConfig {
            id: cluster.id.clone(),
            primary: cluster.primary.as_ref().map(|p| PrimaryConfig {
                primary_fs: p.primary_fs.clone(),
                primary_fset: p.primary_fset.clone(),
                remote_cluster: p.remote_cluster.clone(),
            }),
            rest_api: cluster
                .rest_api
                .iter()
                .map(|r| RestEndpoint {
                    gui_host: r.gui_host.clone(),
                    gui_port: r.gui_port.unwrap_or(DEFAULT_GUI_PORT),
                })
                .collect(),
            secure_ssl_mode: cluster.secure_ssl_mode,
            cacert: cluster
                .cacert
                .as_ref()
                .map(|cm| PathBuf::from(format!("{}/{}/ca.crt", CACERT_MOUNT, cm))),
            credentials: Credentials {
                username: format!("file:{}/{}/username", SECRETS_MOUNT, cluster.secrets),
                password: format!("file:{}/{}/password", SECRETS_MOUNT, cluster.secrets),
            },
        })
        .collect();
    manifest
}

fn plugin_daemon_set(cr: &CSIScaleOperator, name: &str) -> Result<Value, OperatorError> {
    let spec = &cr.spec;
    let owner = cr.name_any();
    let kubelet = spec.kubelet_root_dir().trim_end_matches('/');
    let plugin_dir = plugin_dir(spec);
    let registry = &spec.image_registry;

    let driver_image = resolve_image(spec.images.driver.as_deref(), DEFAULT_DRIVER_IMAGE, registry)?;
    let registrar_image = resolve_image(
        spec.images.node_driver_registrar.as_deref(),
        DEFAULT_REGISTRAR_IMAGE,
        registry,
    )?;
    let probe_image = resolve_image(spec.images.livenessprobe.as_deref(), DEFAULT_LIVENESSPROBE_IMAGE, registry)?;

    let mut driver_mounts = vec![
        json!({ "name": "plugin-dir", "mountPath": SOCKET_DIR }),
        json!({ "name": "pods-mount-dir", "mountPath": format!("{}/pods", kubelet), "mountPropagation": "Bidirectional" }),
        json!({ "name": "config", "mountPath": CONFIG_MOUNT, "readOnly": true }),
    ];
    let mut volumes = vec![
        json!({ "name": "plugin-dir", "hostPath": { "path": plugin_dir, "type": "DirectoryOrCreate" } }),
        json!({ "name": "registration-dir", "hostPath": { "path": format!("{}/plugins_registry", kubelet), "type": "Directory" } }),
        json!({ "name": "pods-mount-dir", "hostPath": { "path": format!("{}/pods", kubelet), "type": "Directory" } }),
        json!({ "name": "config", "configMap": { "name": ChildResource::ConfigMap.name(&owner) } }),
    ];

    let mut secrets: Vec<&str> = spec.clusters.iter().map(|c| c.secrets.as_str()).collect();
    secrets.sort_unstable();
    secrets.dedup();
    for secret in secrets {
        let volume = format!("secret-{}", secret);
        driver_mounts.push(json!({ "name": volume, "mountPath": format!("{}/{}", SECRETS_MOUNT, secret), "readOnly": true }));
        volumes.push(json!({ "name": volume, "secret": { "secretName": secret } }));
    }
    let mut cacerts: Vec<&str> = spec.clusters.iter().filter_map(|c| c.cacert.as_deref()).collect();
    cacerts.sort_unstable();
    cacerts.dedup();
    for cacert in cacerts {
        let volume = format!("cacert-{}", cacert);
        driver_mounts.push(json!({ "name": volume, "mountPath": format!("{}/{}", CACERT_MOUNT, cacert), "readOnly": true }));
        volumes.push(json!({ "name": volume, "configMap": { "name": cacert } }));
    }

    let labels = labels(&owner, "plugin");
    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "DaemonSet",
        "metadata": { "name": name, "namespace": cr.namespace(), "labels": labels },
        "spec": {
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "hostNetwork": true,
                    "nodeSelector": CSIScaleOperatorSpec::selector_map(&spec.plugin_node_selector),
                    "containers": [
                        {
                            "name": "driver",
                            "image": driver_image,
                            "args": [
                                "plugin",
                                "--endpoint", format!("unix://{}/csi.sock", SOCKET_DIR),
                                "--config", format!("{}/{}", CONFIG_MOUNT, CONFIG_KEY),
                            ],
                            "env": [{
                                "name": "SCALE_CSI_NODE_ID",
                                "valueFrom": { "fieldRef": { "fieldPath": "spec.nodeName" } },
                            }],
                            "securityContext": { "privileged": true },
                            "volumeMounts": driver_mounts,
                        },
                        {
                            "name": "registrar",
                            "image": registrar_image,
                            "args": [
                                format!("--csi-address={}/csi.sock", SOCKET_DIR),
                                format!("--kubelet-registration-path={}/csi.sock", plugin_dir),
                                "--v=5",
                            ],
                            "volumeMounts": [
                                { "name": "plugin-dir", "mountPath": SOCKET_DIR },
                                { "name": "registration-dir", "mountPath": "/registration" },
                            ],
                        },
                        {
                            "name": "liveness-probe",
                            "image": probe_image,
                            "args": [format!("--csi-address={}/csi.sock", SOCKET_DIR)],
                            "volumeMounts": [{ "name": "plugin-dir", "mountPath": SOCKET_DIR }],
                        },
                    ],
                    "volumes": volumes,
                },
            },
        },
    }))
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Writes rendered children to the cluster
#[async_trait]
pub trait ChildApplier: Send + Sync {
    /// Check that a credential Secret exists and carries [`SECRET_KEYS`]
    async fn verify_secret(&self, namespace: &str, name: &str) -> Result<(), OperatorError>;

    /// Create or update one child object
    async fn apply(&self, namespace: &str, child: RenderedChild) -> Result<(), OperatorError>;

    async fn update_status(
        &self,
        namespace: &str,
        name: &str,
        status: CSIScaleOperatorStatus,
    ) -> Result<(), OperatorError>;
}

/// Context injected into every reconcile and error-policy invocation
pub struct OperatorContext {
    pub applier: Arc<dyn ChildApplier>,
    pub event_bus: Arc<EventBus>,
    pub requeue_after: Duration,
}

impl OperatorContext {
    pub fn new(applier: Arc<dyn ChildApplier>, event_bus: Arc<EventBus>) -> Self {
        Self {
            applier,
            event_bus,
            requeue_after: Duration::from_secs(300),
        }
    }
}

fn owner_key(cr: &CSIScaleOperator) -> String {
    format!("{}/{}", cr.namespace().unwrap_or_default(), cr.name_any())
}

pub async fn reconcile(cr: Arc<CSIScaleOperator>, ctx: Arc<OperatorContext>) -> Result<Action, OperatorError> {
    let namespace = cr
        .namespace()
        .ok_or_else(|| OperatorError::InvalidSpec("CSIScaleOperator must be namespaced".to_string()))?;
    let name = cr.name_any();
    let owner = owner_key(&cr);
    info!(%owner, "Reconciling CSIScaleOperator");

    let children = ChildResource::for_spec(&cr.spec);
    for child in &children {
        child.validate(&cr)?;
    }

    for child in &children {
        let child_name = child.name(&name);
        match child {
            ChildResource::Secret(secret) => ctx.applier.verify_secret(&namespace, secret).await?,
            _ => {
                if let Some(rendered) = child.render(&cr)? {
                    ctx.applier.apply(&namespace, rendered).await?;
                }
            }
        }
        debug!(%owner, kind = child.kind(), name = %child_name, "Child reconciled");
        ctx.event_bus.publish_operator_event(OperatorEvent::ChildApplied {
            owner: owner.clone(),
            kind: child.kind().to_string(),
            name: child_name,
            applied_at: Utc::now(),
        });
    }

    let status = CSIScaleOperatorStatus {
        phase: Some("Running".to_string()),
        message: None,
        observed_generation: cr.metadata.generation,
    };
    ctx.applier.update_status(&namespace, &name, status).await?;

    counter!("scale_csi_operator_reconciles_total", "outcome" => "success").increment(1);
    info!(%owner, children = children.len(), "CSIScaleOperator reconciled");
    Ok(Action::requeue(ctx.requeue_after))
}

pub fn error_policy(cr: Arc<CSIScaleOperator>, err: &OperatorError, ctx: Arc<OperatorContext>) -> Action {
    let owner = owner_key(&cr);
    warn!(%owner, "Reconcile failed: {}", err);
    counter!("scale_csi_operator_reconciles_total", "outcome" => "error").increment(1);

    ctx.event_bus.publish_operator_event(OperatorEvent::ReconcileFailed {
        owner,
        reason: err.to_string(),
        failed_at: Utc::now(),
    });

    if let Some(namespace) = cr.namespace() {
        let applier = ctx.applier.clone();
        let name = cr.name_any();
        let status = CSIScaleOperatorStatus {
            phase: Some("Failed".to_string()),
            message: Some(err.to_string()),
            observed_generation: cr.metadata.generation,
        };
        tokio::spawn(async move {
            if let Err(e) = applier.update_status(&namespace, &name, status).await {
                warn!("Failed to record reconcile failure on {}/{}: {}", namespace, name, e);
            }
        });
    }

    if err.is_permanent() {
        Action::requeue(ctx.requeue_after)
    } else {
        Action::requeue(Duration::from_secs(30))
    }
}
