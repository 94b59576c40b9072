// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Driver Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) read by every
// driver process. The operator renders this same document into the driver
// ConfigMap, so field names follow the operator CR (camelCase).

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const API_VERSION: &str = "scale-csi.io/v1";
pub const KIND: &str = "DriverConfig";
pub const DEFAULT_DRIVER_NAME: &str = "spectrumscale.csi.ibm.com";
pub const DEFAULT_GUI_PORT: u16 = 443;

/// Top-level driver configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfigManifest {
    /// API version (must be "scale-csi.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "DriverConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: DriverConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfigSpec {
    #[serde(default)]
    pub driver: DriverSettings,

    /// Every cluster the driver may provision on; exactly one is primary.
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub backend: BackendSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSettings {
    /// CSI driver name reported by GetPluginInfo
    #[serde(default = "default_driver_name")]
    pub name: String,

    /// Node identity reported by NodeGetInfo; usually set from the downward API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub id: String,

    /// Present on the primary (local) cluster only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PrimaryConfig>,

    pub rest_api: Vec<RestEndpoint>,

    #[serde(default)]
    pub secure_ssl_mode: bool,

    /// PEM bundle used to verify the management endpoint when `secureSslMode` is set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cacert: Option<PathBuf>,

    pub credentials: Credentials,
}

impl ClusterConfig {
    pub fn is_primary(&self) -> bool {
        self.primary.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConfig {
    /// Filesystem used when a StorageClass does not name one
    pub primary_fs: String,

    /// Fileset holding driver bookkeeping, when configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_fset: Option<String>,

    /// Cluster that owns `primaryFs` when it is remotely mounted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_cluster: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestEndpoint {
    pub gui_host: String,

    #[serde(default = "default_gui_port")]
    pub gui_port: u16,
}

impl RestEndpoint {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}/scalemgmt/v2/", self.gui_host, self.gui_port)
    }
}

/// Management API credentials
///
/// Both fields accept `env:VAR_NAME` and `file:/path` indirection so secrets
/// can come from the environment or a mounted Kubernetes Secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn resolve(&self) -> Result<(String, String), ConfigError> {
        Ok((resolve_secret(&self.username)?, resolve_secret(&self.password)?))
    }
}

/// Resolve a value that may be `env:VAR`, `file:/path` or a literal.
pub fn resolve_secret(value: &str) -> Result<String, ConfigError> {
    if let Some(var) = value.strip_prefix("env:") {
        return std::env::var(var).map_err(|_| ConfigError::MissingSecret(format!("environment variable {}", var)));
    }
    if let Some(path) = value.strip_prefix("file:") {
        return std::fs::read_to_string(path)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| ConfigError::MissingSecret(format!("{}: {}", path, e)));
    }
    Ok(value.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_interval", with = "humantime_serde")]
    pub initial_interval: Duration,

    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    /// Attempts when polling an asynchronous backend job
    #[serde(default = "default_job_poll_attempts")]
    pub job_poll_attempts: u32,

    #[serde(default = "default_job_poll_interval", with = "humantime_serde")]
    pub job_poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    #[default]
    Rest,
    /// Process-local backend for development; nothing reaches a cluster.
    InMemory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSettings {
    #[serde(default)]
    pub mode: BackendMode,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Cap on concurrently in-flight REST requests per process
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_driver_name() -> String {
    DEFAULT_DRIVER_NAME.to_string()
}

fn default_gui_port() -> u16 {
    DEFAULT_GUI_PORT
}

fn default_max_attempts() -> u32 {
    12
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_job_poll_attempts() -> u32 {
    150
}

fn default_job_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_max_concurrent_requests() -> usize {
    16
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            name: default_driver_name(),
            node_id: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            job_poll_attempts: default_job_poll_attempts(),
            job_poll_interval: default_job_poll_interval(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            mode: BackendMode::default(),
            request_timeout: default_request_timeout(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for DriverConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "scale-csi".to_string(),
                labels: None,
            },
            spec: DriverConfigSpec::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cluster {cluster}: secureSslMode requires a cacert")]
    MissingCaCert { cluster: String },

    #[error("secret not available: {0}")]
    MissingSecret(String),
}

impl DriverConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Load, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        tracing::info!("Loading driver configuration from {:?}", path);
        let mut config = Self::from_yaml_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(node_id) = std::env::var("SCALE_CSI_NODE_ID") {
            if !node_id.is_empty() {
                tracing::info!("Environment override: SCALE_CSI_NODE_ID={}", node_id);
                self.spec.driver.node_id = Some(node_id);
            }
        }
        if let Ok(val) = std::env::var("SCALE_CSI_MAX_CONCURRENT_REQUESTS") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => self.spec.backend.max_concurrent_requests = n,
                _ => tracing::warn!(
                    "Invalid value for SCALE_CSI_MAX_CONCURRENT_REQUESTS: '{}'. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "invalid apiVersion '{}', must be '{}'",
                self.api_version, API_VERSION
            )));
        }
        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!("invalid kind '{}', must be '{}'", self.kind, KIND)));
        }
        if self.spec.driver.name.is_empty() {
            return Err(ConfigError::Invalid("spec.driver.name cannot be empty".to_string()));
        }
        if self.spec.retry.max_attempts == 0 || self.spec.retry.job_poll_attempts == 0 {
            return Err(ConfigError::Invalid("retry attempts must be at least 1".to_string()));
        }
        if self.spec.backend.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "spec.backend.maxConcurrentRequests must be at least 1".to_string(),
            ));
        }

        if self.spec.backend.mode == BackendMode::InMemory {
            return Ok(());
        }

        if self.spec.clusters.is_empty() {
            return Err(ConfigError::Invalid("at least one cluster must be configured".to_string()));
        }

        let primaries = self.spec.clusters.iter().filter(|c| c.is_primary()).count();
        if primaries != 1 {
            return Err(ConfigError::Invalid(format!(
                "exactly one cluster must be primary, found {}",
                primaries
            )));
        }

        let mut seen = HashSet::new();
        for cluster in &self.spec.clusters {
            if cluster.id.is_empty() {
                return Err(ConfigError::Invalid("cluster id cannot be empty".to_string()));
            }
            if !seen.insert(cluster.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate cluster id '{}'", cluster.id)));
            }
            if cluster.rest_api.is_empty() {
                return Err(ConfigError::Invalid(format!("cluster {}: restApi cannot be empty", cluster.id)));
            }
            if cluster.secure_ssl_mode && cluster.cacert.is_none() {
                return Err(ConfigError::MissingCaCert { cluster: cluster.id.clone() });
            }
            if let Some(primary) = &cluster.primary {
                if primary.primary_fs.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "cluster {}: primary.primaryFs cannot be empty",
                        cluster.id
                    )));
                }
                if let Some(remote) = &primary.remote_cluster {
                    if !self.spec.clusters.iter().any(|c| &c.id == remote) {
                        return Err(ConfigError::Invalid(format!(
                            "cluster {}: remoteCluster '{}' is not configured",
                            cluster.id, remote
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn primary_cluster(&self) -> Option<&ClusterConfig> {
        self.spec.clusters.iter().find(|c| c.is_primary())
    }
}
