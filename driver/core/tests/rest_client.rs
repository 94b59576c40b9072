// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Management REST client against a mock HTTP server.

use std::time::Duration;

use mockito::{Matcher, Server};
use pretty_assertions::assert_eq;

use scale_csi_core::domain::backend::{BackendError, BackendVersion, FilesetSpec, InodeSpace, ScaleBackend};
use scale_csi_core::domain::quota::QuotaLimits;
use scale_csi_core::infrastructure::retry::RetryPolicy;
use scale_csi_core::infrastructure::scale::ScaleRestClient;

// base64("admin:secret")
const AUTH: &str = "Basic YWRtaW46c2VjcmV0";

fn client(server: &Server) -> ScaleRestClient {
    let fast = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    ScaleRestClient::with_endpoint(
        &format!("{}/scalemgmt/v2/", server.url()),
        "admin",
        "secret",
        fast.clone(),
        fast,
    )
    .unwrap()
}

#[tokio::test]
async fn test_cluster_info_uses_basic_auth() {
    let mut server = Server::new_async().await;
    let cluster = server
        .mock("GET", "/scalemgmt/v2/cluster")
        .match_header("authorization", AUTH)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"cluster":{"clusterSummary":{"clusterId":7118073361626808055,"clusterName":"scale.local"}}}"#)
        .create_async()
        .await;
    let info = server
        .mock("GET", "/scalemgmt/v2/info")
        .match_header("authorization", AUTH)
        .with_status(200)
        .with_body(r#"{"info":{"serverVersion":"5.1.9.0"}}"#)
        .create_async()
        .await;

    let result = client(&server).get_cluster_info().await.unwrap();

    assert_eq!(result.cluster_id, "7118073361626808055");
    assert_eq!(result.cluster_name, "scale.local");
    assert_eq!(result.version, BackendVersion::new(&[5, 1, 9, 0]));
    cluster.assert_async().await;
    info.assert_async().await;
}

#[tokio::test]
async fn test_create_fileset_waits_for_job() {
    let mut server = Server::new_async().await;
    let create = server
        .mock("POST", "/scalemgmt/v2/filesystems/fs1/filesets")
        .match_body(Matcher::PartialJsonString(
            r#"{"filesetName":"pvc-1","inodeSpace":"new","maxNumInodes":100000}"#.to_string(),
        ))
        .with_status(202)
        .with_body(r#"{"jobs":[{"jobId":12,"status":"RUNNING"}]}"#)
        .create_async()
        .await;
    let job = server
        .mock("GET", "/scalemgmt/v2/jobs/12")
        .with_status(200)
        .with_body(r#"{"jobs":[{"jobId":12,"status":"COMPLETED"}]}"#)
        .create_async()
        .await;
    let fetch = server
        .mock("GET", "/scalemgmt/v2/filesystems/fs1/filesets/pvc-1")
        .with_status(200)
        .with_body(
            r#"{"filesets":[{"filesetName":"pvc-1","config":{"path":"--","isInodeSpaceOwner":true,"inodeSpace":4,"maxNumInodes":100000,"comment":"Fileset created by Scale CSI driver"}}]}"#,
        )
        .create_async()
        .await;

    let spec = FilesetSpec {
        name: "pvc-1".to_string(),
        inode_space: InodeSpace::New,
        max_inodes: 100_000,
        owner: None,
        permissions: None,
        comment: "Fileset created by Scale CSI driver".to_string(),
    };
    let info = client(&server).create_fileset("fs1", &spec).await.unwrap();

    assert!(info.independent);
    assert_eq!(info.path, None);
    assert_eq!(info.inode_space, 4);
    create.assert_async().await;
    job.assert_async().await;
    fetch.assert_async().await;
}

#[tokio::test]
async fn test_failed_job_is_classified() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/scalemgmt/v2/filesystems/fs1/filesets/pvc-1/snapshots")
        .with_status(202)
        .with_body(
            r#"{"jobs":[{"jobId":7,"status":"FAILED","result":{"stderr":["Snapshot snap-1 already exists."],"exitCode":1}}]}"#,
        )
        .create_async()
        .await;

    let err = client(&server)
        .create_snapshot("fs1", "pvc-1", "snap-1")
        .await
        .unwrap_err();

    assert!(matches!(err, BackendError::AlreadyExists(ref msg) if msg.contains("already exists")));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let mut server = Server::new_async().await;
    let unavailable = server
        .mock("GET", "/scalemgmt/v2/info")
        .with_status(503)
        .with_body(r#"{"status":{"code":503,"message":"GUI restarting"}}"#)
        .expect(2)
        .create_async()
        .await;
    let healthy = server
        .mock("GET", "/scalemgmt/v2/info")
        .with_status(200)
        .with_body(r#"{"info":{"serverVersion":"5.2.0.0"}}"#)
        .create_async()
        .await;

    client(&server).health_check().await.unwrap();

    unavailable.assert_async().await;
    healthy.assert_async().await;
}

#[tokio::test]
async fn test_unauthorized_is_not_retried() {
    let mut server = Server::new_async().await;
    let denied = server
        .mock("GET", "/scalemgmt/v2/info")
        .with_status(401)
        .with_body(r#"{"status":{"code":401,"message":"Unauthorized"}}"#)
        .expect(1)
        .create_async()
        .await;

    let err = client(&server).health_check().await.unwrap_err();

    assert!(matches!(err, BackendError::Unauthorized(_)));
    denied.assert_async().await;
}

#[tokio::test]
async fn test_quota_is_sent_in_kib() {
    let mut server = Server::new_async().await;
    let quota = server
        .mock("POST", "/scalemgmt/v2/filesystems/fs1/quotas")
        .match_body(Matcher::PartialJsonString(
            r#"{"operationType":"setQuota","quotaType":"FILESET","objectName":"pvc-1","blockHardLimit":"1048576K"}"#
                .to_string(),
        ))
        .with_status(202)
        .with_body(r#"{"jobs":[{"jobId":3,"status":"COMPLETED"}]}"#)
        .create_async()
        .await;

    let limits = QuotaLimits::for_capacity(1024, 0);
    client(&server).set_quota("fs1", "pvc-1", &limits).await.unwrap();

    quota.assert_async().await;
}
