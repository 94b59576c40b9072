// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Management REST API client
//!
//! Implements [`ScaleBackend`] over the filesystem's `/scalemgmt/v2` API.
//!
//! # Transport
//!
//! - Basic authentication on every request
//! - TLS verified against a configured CA bundle when `secureSslMode` is set,
//!   unverified otherwise
//! - Transient failures (connect errors, timeouts, 5xx, 429) retried with
//!   bounded exponential backoff; 4xx surface immediately as typed errors
//! - Mutations return an asynchronous job which is polled on `/jobs/{id}`
//! - A semaphore caps concurrently in-flight requests
//! - Several GUI endpoints may be configured; a connect failure rotates to
//!   the next one
//!
//! # API Endpoints
//!
//! - `GET  cluster`, `GET info`
//! - `GET  filesystems[/{fs}]`
//! - `POST|GET|DELETE filesystems/{fs}/filesets[/{name}]`
//! - `POST|DELETE filesystems/{fs}/filesets/{name}/link`
//! - `POST|GET filesystems/{fs}/quotas`
//! - `POST|DELETE filesystems/{fs}/directory/{path}`
//! - `PUT|GET filesystems/{fs}/acl/{path}`
//! - `POST|GET|DELETE filesystems/{fs}/filesets/{name}/snapshots[/{snap}]`
//! - `PUT  filesystems/{fs}/filesets/{name}/snapshotCopy/{snap}[/path/{path}]`
//! - `PUT  filesystems/{fs}/directoryCopy/{path}`
//! - `POST filesystems/{fs}/policies`
//! - `GET  jobs/{id}`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Certificate, Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

use crate::domain::backend::{
    Acl, AclEntry, BackendError, ClusterInfo, DirectorySpec, FilesetInfo, FilesetSpec, FilesystemInfo,
    InodeSpace, ScaleBackend, SnapshotInfo,
};
use crate::domain::config::{BackendSettings, ClusterConfig, RetryConfig};
use crate::domain::quota::QuotaLimits;
use crate::infrastructure::retry::{poll_until, retry_transient, RetryPolicy};

const UNLINKED_PATH: &str = "--";

/// REST adapter for one cluster's management endpoint(s)
pub struct ScaleRestClient {
    client: Client,
    endpoints: Vec<Url>,
    active_endpoint: AtomicUsize,
    username: String,
    password: String,
    limiter: Arc<Semaphore>,
    retry: RetryPolicy,
    job_poll: RetryPolicy,
}

impl ScaleRestClient {
    /// Build a client for a configured cluster
    ///
    /// Fails with [`BackendError::Configuration`] before any network traffic
    /// when TLS verification is requested without a CA bundle, or when the
    /// bundle cannot be read.
    pub fn new(cluster: &ClusterConfig, settings: &BackendSettings, retry: &RetryConfig) -> Result<Self, BackendError> {
        let mut builder = Client::builder().timeout(settings.request_timeout);

        if cluster.secure_ssl_mode {
            let path = cluster.cacert.as_ref().ok_or_else(|| {
                BackendError::Configuration(format!(
                    "cluster {}: secureSslMode requires a cacert",
                    cluster.id
                ))
            })?;
            let pem = std::fs::read(path).map_err(|e| {
                BackendError::Configuration(format!("cluster {}: cannot read cacert {:?}: {}", cluster.id, path, e))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                BackendError::Configuration(format!("cluster {}: invalid cacert {:?}: {}", cluster.id, path, e))
            })?;
            builder = builder.add_root_certificate(cert);
        } else {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {}", e)))?;

        let endpoints = cluster
            .rest_api
            .iter()
            .map(|endpoint| {
                Url::parse(&endpoint.base_url())
                    .map_err(|e| BackendError::Configuration(format!("invalid restApi endpoint {}: {}", endpoint.gui_host, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if endpoints.is_empty() {
            return Err(BackendError::Configuration(format!("cluster {}: no restApi endpoints", cluster.id)));
        }

        let (username, password) = cluster
            .credentials
            .resolve()
            .map_err(|e| BackendError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            endpoints,
            active_endpoint: AtomicUsize::new(0),
            username,
            password,
            limiter: Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1))),
            retry: RetryPolicy::requests(retry),
            job_poll: RetryPolicy::job_polling(retry),
        })
    }

    /// Client against an explicit base URL (plain HTTP allowed)
    pub fn with_endpoint(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        retry: RetryPolicy,
        job_poll: RetryPolicy,
    ) -> Result<Self, BackendError> {
        let endpoint = Url::parse(base_url)
            .map_err(|e| BackendError::Configuration(format!("invalid endpoint {}: {}", base_url, e)))?;
        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoints: vec![endpoint],
            active_endpoint: AtomicUsize::new(0),
            username: username.into(),
            password: password.into(),
            limiter: Arc::new(Semaphore::new(BackendSettings::default().max_concurrent_requests)),
            retry,
            job_poll,
        })
    }

    fn build_url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let index = self.active_endpoint.load(Ordering::Relaxed) % self.endpoints.len();
        let mut url = self.endpoints[index].clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Configuration(format!("endpoint {} cannot be a base", self.endpoints[index])))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn rotate_endpoint(&self) {
        if self.endpoints.len() > 1 {
            let next = self.active_endpoint.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "Switching management endpoint to {}",
                self.endpoints[next % self.endpoints.len()]
            );
        }
    }

    /// One HTTP exchange, no retry
    async fn send_once(
        &self,
        method: &Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Value, BackendError> {
        let url = self.build_url(segments)?;
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| BackendError::Unknown("request limiter closed".to_string()))?;

        debug!(%method, %url, "Management API request");
        let started = Instant::now();

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .basic_auth(&self.username, Some(&self.password))
            .header("Accept", "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let err = BackendError::from(err);
                if matches!(err, BackendError::Unavailable(_)) {
                    self.rotate_endpoint();
                }
                metrics::counter!("scale_backend_requests_total", "method" => method.to_string(), "outcome" => "transport_error").increment(1);
                return Err(err);
            }
        };

        let status = response.status();
        let text = response.text().await?;
        metrics::histogram!("scale_backend_request_duration_seconds", "method" => method.to_string())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!("scale_backend_requests_total", "method" => method.to_string(), "outcome" => status.as_u16().to_string()).increment(1);

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return Ok(serde_json::from_str(&text)?);
        }

        Err(classify_status(status, &text))
    }

    /// Retried request returning the decoded body
    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, BackendError> {
        let operation = format!("{} {}", method, segments.join("/"));
        retry_transient(&self.retry, &operation, || {
            self.send_once(&method, segments, query, body.as_ref())
        })
        .await
    }

    async fn get(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Value, BackendError> {
        self.request(Method::GET, segments, query, None).await
    }

    /// Submit a mutation and wait for the job it spawns
    async fn mutate(&self, method: Method, segments: &[&str], query: &[(&str, &str)], body: Option<Value>) -> Result<(), BackendError> {
        let response = self.request(method, segments, query, body).await?;
        let accepted: JobsResponse = serde_json::from_value(response).unwrap_or_default();
        match accepted.jobs.into_iter().next() {
            Some(job) if job.is_done() => job.into_result(),
            Some(job) => self.wait_for_job(job.job_id).await,
            None => Ok(()),
        }
    }

    async fn wait_for_job(&self, job_id: u64) -> Result<(), BackendError> {
        let id = job_id.to_string();
        let job = poll_until(&self.job_poll, &format!("job {}", job_id), || async {
            let value = self.get(&["jobs", &id], &[]).await?;
            let jobs: JobsResponse = serde_json::from_value(value)?;
            Ok::<_, BackendError>(jobs.jobs.into_iter().find(|j| j.job_id == job_id).filter(|j| j.is_done()))
        })
        .await?;
        job.into_result()
    }

    async fn find_fileset(&self, filesystem: &str, name: &str) -> Result<FilesetInfo, BackendError> {
        let value = self.get(&["filesystems", filesystem, "filesets", name], &[]).await?;
        let filesets: FilesetsResponse = serde_json::from_value(value)?;
        filesets
            .filesets
            .into_iter()
            .find(|f| f.fileset_name == name)
            .map(|f| f.into_info(filesystem))
            .ok_or_else(|| BackendError::NotFound(format!("fileset {} in filesystem {}", name, filesystem)))
    }
}

#[async_trait]
impl ScaleBackend for ScaleRestClient {
    async fn get_cluster_info(&self) -> Result<ClusterInfo, BackendError> {
        let cluster: ClusterResponse = serde_json::from_value(self.get(&["cluster"], &[]).await?)?;
        let info: InfoResponse = serde_json::from_value(self.get(&["info"], &[]).await?)?;
        let cluster_id = match cluster.cluster.cluster_summary.cluster_id {
            Value::String(s) => s,
            other => other.to_string(),
        };
        Ok(ClusterInfo {
            cluster_id,
            cluster_name: cluster.cluster.cluster_summary.cluster_name,
            version: info.info.server_version.parse()?,
        })
    }

    async fn get_filesystem_info(&self, filesystem: &str) -> Result<FilesystemInfo, BackendError> {
        let value = self.get(&["filesystems", filesystem], &[]).await?;
        let response: FilesystemsResponse = serde_json::from_value(value)?;
        response
            .filesystems
            .into_iter()
            .find(|fs| fs.name == filesystem)
            .map(FilesystemBody::into_info)
            .ok_or_else(|| BackendError::NotFound(format!("filesystem {}", filesystem)))
    }

    async fn get_filesystem_name(&self, uuid: &str) -> Result<String, BackendError> {
        let value = self.get(&["filesystems"], &[("fields", ":all:")]).await?;
        let response: FilesystemsResponse = serde_json::from_value(value)?;
        response
            .filesystems
            .into_iter()
            .find(|fs| fs.uuid.as_deref() == Some(uuid))
            .map(|fs| fs.name)
            .ok_or_else(|| BackendError::NotFound(format!("filesystem with UUID {}", uuid)))
    }

    async fn create_fileset(&self, filesystem: &str, spec: &FilesetSpec) -> Result<FilesetInfo, BackendError> {
        let mut body = json!({
            "filesetName": spec.name,
            "inodeSpace": spec.inode_space.as_api_value(),
            "comment": spec.comment,
        });
        if spec.inode_space == InodeSpace::New && spec.max_inodes > 0 {
            body["maxNumInodes"] = json!(spec.max_inodes);
            body["allocInodes"] = json!(spec.max_inodes.min(1024));
        }
        if let Some(owner) = &spec.owner {
            body["owner"] = json!(owner);
        }
        if let Some(permissions) = &spec.permissions {
            body["permissions"] = json!(permissions);
        }

        info!(filesystem, fileset = %spec.name, "Creating fileset");
        self.mutate(Method::POST, &["filesystems", filesystem, "filesets"], &[], Some(body))
            .await?;
        self.find_fileset(filesystem, &spec.name).await
    }

    async fn get_fileset(&self, filesystem: &str, name: &str) -> Result<FilesetInfo, BackendError> {
        self.find_fileset(filesystem, name).await
    }

    async fn list_filesets(&self, filesystem: &str) -> Result<Vec<FilesetInfo>, BackendError> {
        let value = self
            .get(&["filesystems", filesystem, "filesets"], &[("fields", ":all:")])
            .await?;
        let response: FilesetsResponse = serde_json::from_value(value)?;
        Ok(response.filesets.into_iter().map(|f| f.into_info(filesystem)).collect())
    }

    async fn delete_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError> {
        info!(filesystem, fileset = name, "Deleting fileset");
        self.mutate(Method::DELETE, &["filesystems", filesystem, "filesets", name], &[], None)
            .await
    }

    async fn link_fileset(&self, filesystem: &str, name: &str, junction: &str) -> Result<(), BackendError> {
        debug!(filesystem, fileset = name, junction, "Linking fileset");
        self.mutate(
            Method::POST,
            &["filesystems", filesystem, "filesets", name, "link"],
            &[],
            Some(json!({ "path": junction })),
        )
        .await
    }

    async fn unlink_fileset(&self, filesystem: &str, name: &str) -> Result<(), BackendError> {
        debug!(filesystem, fileset = name, "Unlinking fileset");
        self.mutate(
            Method::DELETE,
            &["filesystems", filesystem, "filesets", name, "link"],
            &[("force", "True")],
            None,
        )
        .await
    }

    async fn set_quota(&self, filesystem: &str, fileset: &str, limits: &QuotaLimits) -> Result<(), BackendError> {
        let block = format!("{}K", limits.block_limit_kib);
        let body = json!({
            "operationType": "setQuota",
            "quotaType": "FILESET",
            "objectName": fileset,
            "blockSoftLimit": block,
            "blockHardLimit": block,
            "filesSoftLimit": limits.inode_limit.to_string(),
            "filesHardLimit": limits.inode_limit.to_string(),
        });
        debug!(filesystem, fileset, block_limit_kib = limits.block_limit_kib, "Setting fileset quota");
        self.mutate(Method::POST, &["filesystems", filesystem, "quotas"], &[], Some(body))
            .await
    }

    async fn get_quota(&self, filesystem: &str, fileset: &str) -> Result<QuotaLimits, BackendError> {
        let filter = format!("objectName={},quotaType=FILESET", fileset);
        let value = self
            .get(&["filesystems", filesystem, "quotas"], &[("filter", &filter)])
            .await?;
        let response: QuotasResponse = serde_json::from_value(value)?;
        let quota = response
            .quotas
            .into_iter()
            .find(|q| q.object_name.as_deref().is_none_or(|n| n == fileset));
        Ok(quota
            .map(|q| QuotaLimits {
                block_limit_kib: q.block_limit.unwrap_or(0),
                inode_limit: q.files_limit.unwrap_or(0),
            })
            .unwrap_or(QuotaLimits { block_limit_kib: 0, inode_limit: 0 }))
    }

    async fn create_directory(&self, filesystem: &str, spec: &DirectorySpec) -> Result<(), BackendError> {
        let mut body = json!({});
        if let Some(uid) = &spec.uid {
            body["user"] = owner_field("uid", "name", uid);
        }
        if let Some(gid) = &spec.gid {
            body["group"] = owner_field("gid", "name", gid);
        }
        if let Some(permissions) = &spec.permissions {
            body["permissions"] = json!(permissions);
        }
        info!(filesystem, path = %spec.path, "Creating directory");
        self.mutate(
            Method::POST,
            &["filesystems", filesystem, "directory", &spec.path],
            &[],
            Some(body),
        )
        .await
    }

    async fn delete_directory(&self, filesystem: &str, path: &str) -> Result<(), BackendError> {
        info!(filesystem, path, "Deleting directory");
        self.mutate(Method::DELETE, &["filesystems", filesystem, "directory", path], &[], None)
            .await
    }

    async fn set_acl(&self, filesystem: &str, path: &str, acl: &Acl) -> Result<(), BackendError> {
        let body = json!({ "type": "NFSv4", "entries": acl.entries });
        self.mutate(Method::PUT, &["filesystems", filesystem, "acl", path], &[], Some(body))
            .await
    }

    async fn get_acl(&self, filesystem: &str, path: &str) -> Result<Acl, BackendError> {
        let value = self.get(&["filesystems", filesystem, "acl", path], &[]).await?;
        let response: AclResponse = serde_json::from_value(value)?;
        Ok(Acl { entries: response.acl.entries })
    }

    async fn create_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<SnapshotInfo, BackendError> {
        info!(filesystem, fileset, snapshot = name, "Creating snapshot");
        self.mutate(
            Method::POST,
            &["filesystems", filesystem, "filesets", fileset, "snapshots"],
            &[],
            Some(json!({ "snapshotName": name })),
        )
        .await?;
        self.list_snapshots(filesystem, fileset)
            .await?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BackendError::NotFound(format!("snapshot {} of fileset {}", name, fileset)))
    }

    async fn delete_snapshot(&self, filesystem: &str, fileset: &str, name: &str) -> Result<(), BackendError> {
        info!(filesystem, fileset, snapshot = name, "Deleting snapshot");
        self.mutate(
            Method::DELETE,
            &["filesystems", filesystem, "filesets", fileset, "snapshots", name],
            &[],
            None,
        )
        .await
    }

    async fn list_snapshots(&self, filesystem: &str, fileset: &str) -> Result<Vec<SnapshotInfo>, BackendError> {
        let value = self
            .get(&["filesystems", filesystem, "filesets", fileset, "snapshots"], &[])
            .await?;
        let response: SnapshotsResponse = serde_json::from_value(value)?;
        Ok(response
            .snapshots
            .into_iter()
            .map(|s| SnapshotInfo {
                created_at: s.created.as_deref().and_then(parse_timestamp),
                fileset: s.fileset_name.unwrap_or_else(|| fileset.to_string()),
                name: s.snapshot_name,
            })
            .collect())
    }

    async fn copy_snapshot(
        &self,
        filesystem: &str,
        fileset: &str,
        snapshot: &str,
        source_path: &str,
        target_path: &str,
    ) -> Result<(), BackendError> {
        let mut segments = vec!["filesystems", filesystem, "filesets", fileset, "snapshotCopy", snapshot];
        if !source_path.is_empty() {
            segments.push("path");
            segments.push(source_path);
        }
        info!(filesystem, fileset, snapshot, target_path, "Copying snapshot");
        self.mutate(Method::PUT, &segments, &[], Some(json!({ "targetPath": target_path })))
            .await
    }

    async fn copy_directory(&self, filesystem: &str, source_path: &str, target_path: &str) -> Result<(), BackendError> {
        info!(filesystem, source_path, target_path, "Copying directory");
        self.mutate(
            Method::PUT,
            &["filesystems", filesystem, "directoryCopy", source_path],
            &[],
            Some(json!({ "targetPath": target_path })),
        )
        .await
    }

    async fn set_policy(&self, filesystem: &str, partition: &str, rules: &str) -> Result<(), BackendError> {
        info!(filesystem, partition, "Installing policy partition");
        self.mutate(
            Method::POST,
            &["filesystems", filesystem, "policies"],
            &[],
            Some(json!({ "partition": partition, "policy": rules })),
        )
        .await
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        self.get(&["info"], &[]).await.map(|_| ())
    }
}

/// Map a non-success HTTP status onto a typed error
fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = extract_message(body).unwrap_or_else(|| {
        status.canonical_reason().unwrap_or("unknown error").to_string()
    });
    let lowered = message.to_lowercase();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(message),
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::CONFLICT => BackendError::AlreadyExists(message),
        StatusCode::TOO_MANY_REQUESTS => BackendError::Unavailable(format!("HTTP {}: {}", status.as_u16(), message)),
        s if s.is_server_error() => BackendError::Unavailable(format!("HTTP {}: {}", s.as_u16(), message)),
        _ if lowered.contains("already exists") => BackendError::AlreadyExists(message),
        _ if lowered.contains("does not exist") || lowered.contains("not found") => BackendError::NotFound(message),
        s => BackendError::Rejected { status: s.as_u16(), message },
    }
}

/// Classify a FAILED job by its message
fn classify_job_failure(job_id: u64, message: String) -> BackendError {
    let lowered = message.to_lowercase();
    if lowered.contains("already exists") {
        BackendError::AlreadyExists(message)
    } else if lowered.contains("does not exist") || lowered.contains("not found") {
        BackendError::NotFound(message)
    } else if lowered.contains("is linked") || lowered.contains("busy") {
        BackendError::FilesetBusy(message)
    } else {
        BackendError::JobFailed { job_id, message }
    }
}

fn extract_message(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(value) => value
            .pointer("/status/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(body.trim().to_string())),
        Err(_) => Some(body.trim().to_string()),
    }
}

fn owner_field(numeric_key: &str, name_key: &str, value: &str) -> Value {
    if value.chars().all(|c| c.is_ascii_digit()) {
        json!({ numeric_key: value })
    } else {
        json!({ name_key: value })
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S,%3f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// --- wire types ---

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    cluster: ClusterBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterBody {
    cluster_summary: ClusterSummary,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSummary {
    cluster_id: Value,
    #[serde(default)]
    cluster_name: String,
}

#[derive(Debug, Deserialize)]
struct InfoResponse {
    info: InfoBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InfoBody {
    server_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct FilesystemsResponse {
    #[serde(default)]
    filesystems: Vec<FilesystemBody>,
}

#[derive(Debug, Deserialize)]
struct FilesystemBody {
    name: String,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    mount: Option<MountBody>,
}

impl FilesystemBody {
    fn into_info(self) -> FilesystemInfo {
        let mount_point = self
            .mount
            .and_then(|m| m.mount_point)
            .unwrap_or_else(|| format!("/{}", self.name));
        FilesystemInfo {
            uuid: self.uuid.unwrap_or_default(),
            name: self.name,
            mount_point,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountBody {
    #[serde(default)]
    mount_point: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FilesetsResponse {
    #[serde(default)]
    filesets: Vec<FilesetBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesetBody {
    fileset_name: String,
    #[serde(default)]
    config: FilesetConfigBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesetConfigBody {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    is_inode_space_owner: Option<bool>,
    #[serde(default)]
    inode_space: Option<u64>,
    #[serde(default)]
    max_num_inodes: Option<u64>,
    #[serde(default)]
    comment: Option<String>,
}

impl FilesetBody {
    fn into_info(self, filesystem: &str) -> FilesetInfo {
        let path = self
            .config
            .path
            .filter(|p| !p.is_empty() && p != UNLINKED_PATH);
        FilesetInfo {
            name: self.fileset_name,
            filesystem: filesystem.to_string(),
            path,
            independent: self.config.is_inode_space_owner.unwrap_or(false),
            inode_space: self.config.inode_space.unwrap_or(0),
            max_inodes: self.config.max_num_inodes.unwrap_or(0),
            comment: self.config.comment.filter(|c| !c.is_empty()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct QuotasResponse {
    #[serde(default)]
    quotas: Vec<QuotaBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuotaBody {
    #[serde(default)]
    object_name: Option<String>,
    #[serde(default)]
    block_limit: Option<u64>,
    #[serde(default)]
    files_limit: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotsResponse {
    #[serde(default)]
    snapshots: Vec<SnapshotBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    snapshot_name: String,
    #[serde(default)]
    fileset_name: Option<String>,
    #[serde(default)]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AclResponse {
    acl: AclBody,
}

#[derive(Debug, Deserialize)]
struct AclBody {
    #[serde(default)]
    entries: Vec<AclEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobBody {
    job_id: u64,
    status: String,
    #[serde(default)]
    result: Option<JobResult>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResult {
    #[serde(default)]
    stderr: Vec<String>,
    #[serde(default)]
    exit_code: Option<i64>,
}

impl JobBody {
    fn is_done(&self) -> bool {
        matches!(self.status.as_str(), "COMPLETED" | "FAILED" | "CANCELLED")
    }

    fn into_result(self) -> Result<(), BackendError> {
        if self.status == "COMPLETED" {
            return Ok(());
        }
        let result = self.result.unwrap_or_default();
        let mut message = result.stderr.join("\n").trim().to_string();
        if message.is_empty() {
            message = match result.exit_code {
                Some(code) => format!("job {} ended {} with exit code {}", self.job_id, self.status, code),
                None => format!("job {} ended {}", self.job_id, self.status),
            };
        }
        Err(classify_job_failure(self.job_id, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let body = r#"{"status":{"code":400,"message":"Invalid value 'gold' for pool"}}"#;
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, body),
            BackendError::Rejected { status: 400, message: "Invalid value 'gold' for pool".to_string() }
        );
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, ""), BackendError::Unauthorized(_)));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN, ""), BackendError::Unauthorized(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, ""), BackendError::NotFound(_)));
        assert!(matches!(classify_status(StatusCode::CONFLICT, ""), BackendError::AlreadyExists(_)));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE, ""), BackendError::Unavailable(_)));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), BackendError::Unavailable(_)));

        let exists = r#"{"status":{"code":400,"message":"Fileset pvc-1 already exists."}}"#;
        assert!(matches!(classify_status(StatusCode::BAD_REQUEST, exists), BackendError::AlreadyExists(_)));
    }

    #[test]
    fn test_job_failure_classification() {
        let job = JobBody {
            job_id: 9,
            status: "FAILED".to_string(),
            result: Some(JobResult {
                stderr: vec!["EFSSG0072C Fileset pvc-9 is linked.".to_string()],
                exit_code: Some(1),
            }),
        };
        assert!(matches!(job.into_result(), Err(BackendError::FilesetBusy(_))));

        let job = JobBody { job_id: 10, status: "FAILED".to_string(), result: None };
        match job.into_result() {
            Err(BackendError::JobFailed { job_id, message }) => {
                assert_eq!(job_id, 10);
                assert!(message.contains("FAILED"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unlinked_fileset_has_no_path() {
        let body: FilesetBody = serde_json::from_value(json!({
            "filesetName": "pvc-1",
            "config": { "path": "--", "isInodeSpaceOwner": true, "inodeSpace": 3, "maxNumInodes": 100000 }
        }))
        .unwrap();
        let info = body.into_info("fs1");
        assert!(!info.is_linked());
        assert!(info.independent);
        assert_eq!(info.inode_space, 3);
        assert_eq!(info.max_inodes, 100_000);
    }

    #[test]
    fn test_timestamps() {
        assert!(parse_timestamp("2024-03-01 10:15:00,123").is_some());
        assert!(parse_timestamp("2024-03-01T10:15:00Z").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_owner_field() {
        assert_eq!(owner_field("uid", "name", "1000"), json!({ "uid": "1000" }));
        assert_eq!(owner_field("uid", "name", "alice"), json!({ "name": "alice" }));
    }
}
