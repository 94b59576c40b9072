// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Scale Backend Infrastructure Module
//!
//! Concrete [`ScaleBackend`] implementations and the registry that maps
//! cluster ids (as carried in volume handles) onto them.

pub mod memory;
pub mod rest;

pub use memory::InMemoryScaleBackend;
pub use rest::ScaleRestClient;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::domain::backend::{BackendError, ScaleBackend};
use crate::domain::config::{BackendMode, BackendSettings, ClusterConfig, DriverConfigManifest, RetryConfig};
use crate::domain::error::CsiError;

/// Filesystem and mount the in-memory backend exposes when no cluster is configured
pub const DEV_CLUSTER_ID: &str = "0";
pub const DEV_FILESYSTEM: &str = "fs1";
pub const DEV_MOUNT_POINT: &str = "/ibm/fs1";

/// Factory function to create a backend for one configured cluster
pub fn create_backend(
    cluster: &ClusterConfig,
    settings: &BackendSettings,
    retry: &RetryConfig,
) -> Result<Arc<dyn ScaleBackend>, BackendError> {
    match settings.mode {
        BackendMode::Rest => Ok(Arc::new(ScaleRestClient::new(cluster, settings, retry)?)),
        BackendMode::InMemory => Ok(Arc::new(
            InMemoryScaleBackend::new(cluster.id.clone()).with_filesystem(
                cluster
                    .primary
                    .as_ref()
                    .map(|p| p.primary_fs.as_str())
                    .unwrap_or(DEV_FILESYSTEM),
                &format!("{}-uuid", cluster.id),
                DEV_MOUNT_POINT,
            ),
        )),
    }
}

/// Backends by cluster id, plus the primary cluster's defaults
#[derive(Clone)]
pub struct ClusterRegistry {
    backends: HashMap<String, Arc<dyn ScaleBackend>>,
    primary_id: String,
    primary_filesystem: String,
    /// Cluster that owns the primary filesystem when it is remotely mounted
    owning_cluster: Option<String>,
}

impl ClusterRegistry {
    pub fn new(
        primary_id: impl Into<String>,
        primary_filesystem: impl Into<String>,
        primary: Arc<dyn ScaleBackend>,
    ) -> Self {
        let primary_id = primary_id.into();
        let mut backends = HashMap::new();
        backends.insert(primary_id.clone(), primary);
        Self {
            backends,
            primary_id,
            primary_filesystem: primary_filesystem.into(),
            owning_cluster: None,
        }
    }

    pub fn with_cluster(mut self, id: impl Into<String>, backend: Arc<dyn ScaleBackend>) -> Self {
        self.backends.insert(id.into(), backend);
        self
    }

    pub fn with_owning_cluster(mut self, id: impl Into<String>) -> Self {
        self.owning_cluster = Some(id.into());
        self
    }

    /// Build one backend per configured cluster
    pub fn from_config(config: &DriverConfigManifest) -> Result<Self, BackendError> {
        let spec = &config.spec;

        if spec.clusters.is_empty() && spec.backend.mode == BackendMode::InMemory {
            info!("No clusters configured; using the in-memory backend");
            let backend = InMemoryScaleBackend::new(DEV_CLUSTER_ID).with_filesystem(
                DEV_FILESYSTEM,
                &format!("{}-uuid", DEV_FILESYSTEM),
                DEV_MOUNT_POINT,
            );
            return Ok(Self::new(DEV_CLUSTER_ID, DEV_FILESYSTEM, Arc::new(backend)));
        }

        let primary = config
            .primary_cluster()
            .ok_or_else(|| BackendError::Configuration("no primary cluster configured".to_string()))?;
        let primary_settings = primary
            .primary
            .as_ref()
            .ok_or_else(|| BackendError::Configuration("primary cluster has no primary section".to_string()))?;

        let mut backends = HashMap::new();
        for cluster in &spec.clusters {
            info!(cluster = %cluster.id, mode = ?spec.backend.mode, "Creating backend client");
            backends.insert(cluster.id.clone(), create_backend(cluster, &spec.backend, &spec.retry)?);
        }

        Ok(Self {
            backends,
            primary_id: primary.id.clone(),
            primary_filesystem: primary_settings.primary_fs.clone(),
            owning_cluster: primary_settings.remote_cluster.clone(),
        })
    }

    pub fn primary_id(&self) -> &str {
        &self.primary_id
    }

    pub fn primary_filesystem(&self) -> &str {
        &self.primary_filesystem
    }

    /// Cluster whose management API owns the primary filesystem
    pub fn owning_cluster_id(&self) -> &str {
        self.owning_cluster.as_deref().unwrap_or(&self.primary_id)
    }

    /// Cluster a new volume lands on: the class's `clusterId`, else the owning cluster
    pub fn provisioning_cluster(&self, requested: Option<&str>) -> String {
        requested.unwrap_or_else(|| self.owning_cluster_id()).to_string()
    }

    /// Backend for a cluster id; `None` selects the primary
    pub fn backend(&self, cluster_id: Option<&str>) -> Result<Arc<dyn ScaleBackend>, CsiError> {
        let id = cluster_id.unwrap_or(&self.primary_id);
        self.backends
            .get(id)
            .cloned()
            .ok_or_else(|| CsiError::invalid(format!("cluster {} is not configured", id)))
    }

    pub fn is_remote(&self, cluster_id: &str) -> bool {
        cluster_id != self.primary_id
    }

    pub fn cluster_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Health of every configured backend
    pub async fn probe(&self) -> Result<(), CsiError> {
        for (id, backend) in &self.backends {
            backend
                .health_check()
                .await
                .map_err(|e| CsiError::BackendUnavailable(format!("cluster {}: {}", id, e)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_registry_without_clusters() {
        let mut config = DriverConfigManifest::default();
        config.spec.backend.mode = BackendMode::InMemory;
        let registry = ClusterRegistry::from_config(&config).unwrap();
        assert_eq!(registry.primary_id(), DEV_CLUSTER_ID);
        assert_eq!(registry.primary_filesystem(), DEV_FILESYSTEM);
        assert!(registry.backend(None).is_ok());
        assert!(registry.backend(Some("nope")).is_err());
        assert_eq!(registry.provisioning_cluster(None), DEV_CLUSTER_ID);
        assert_eq!(registry.provisioning_cluster(Some("9")), "9");
    }

    #[test]
    fn test_secure_mode_without_cacert_fails_before_network() {
        let yaml = r#"
apiVersion: scale-csi.io/v1
kind: DriverConfig
metadata:
  name: scale-csi
spec:
  clusters:
    - id: "17"
      primary:
        primaryFs: fs1
      restApi:
        - guiHost: gui.invalid
      secureSslMode: true
      credentials:
        username: admin
        password: admin
"#;
        let config = DriverConfigManifest::from_yaml_str(yaml).unwrap();
        match ClusterRegistry::from_config(&config) {
            Err(BackendError::Configuration(msg)) => assert!(msg.contains("cacert")),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("expected a configuration error"),
        }
    }

    #[tokio::test]
    async fn test_probe_reports_unhealthy_cluster() {
        let healthy = Arc::new(InMemoryScaleBackend::new("1"));
        let sick = InMemoryScaleBackend::new("2");
        sick.fail_next("health_check", BackendError::Unavailable("down".into()));

        let registry = ClusterRegistry::new("1", "fs1", healthy).with_cluster("2", Arc::new(sick));
        assert!(registry.is_remote("2"));
        assert!(matches!(registry.probe().await, Err(CsiError::BackendUnavailable(_))));
        assert!(registry.probe().await.is_ok());
    }
}
