// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CSI v1 gRPC services
//!
//! Every handler follows the same shape: validate the request, decode the
//! handle, call the application service, encode the response. Errors leave
//! through [`From<CsiError> for Status`](CsiError), which preserves the
//! backend text verbatim.

pub mod controller;
pub mod identity;
pub mod node;

use std::path::Path;
use std::time::Instant;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Code, Status};
use tracing::info;

use crate::domain::error::CsiError;

#[allow(clippy::doc_overindented_list_items)]
#[allow(clippy::doc_lazy_continuation)]
pub mod csi {
    tonic::include_proto!("csi.v1");
}

use csi::controller_server::ControllerServer;
use csi::identity_server::IdentityServer;
use csi::node_server::NodeServer;

pub use controller::CsiControllerService;
pub use identity::CsiIdentityService;
pub use node::CsiNodeService;

impl From<CsiError> for Status {
    fn from(err: CsiError) -> Self {
        let code = match &err {
            CsiError::InvalidArgument(_) => Code::InvalidArgument,
            CsiError::NotFound(_) => Code::NotFound,
            CsiError::AlreadyExists(_) => Code::AlreadyExists,
            CsiError::BackendUnavailable(_) => Code::Unavailable,
            CsiError::Timeout(_) => Code::DeadlineExceeded,
            CsiError::Unauthorized(_) => Code::Unauthenticated,
            CsiError::Unsupported(_) | CsiError::Configuration(_) => Code::FailedPrecondition,
            CsiError::Rejected(_) | CsiError::Internal(_) => Code::Internal,
        };
        Status::new(code, err.to_string())
    }
}

/// Count and time one RPC
pub(crate) fn observe<T>(method: &'static str, started: Instant, result: &Result<T, Status>) {
    let code = match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    };
    metrics::counter!("scale_csi_rpc_total", "method" => method, "code" => format!("{:?}", code)).increment(1);
    metrics::histogram!("scale_csi_rpc_duration_seconds", "method" => method).record(started.elapsed().as_secs_f64());
}

/// Services mounted on the CSI socket
#[derive(Default)]
pub struct CsiServices {
    pub identity: Option<CsiIdentityService>,
    pub controller: Option<CsiControllerService>,
    pub node: Option<CsiNodeService>,
}

/// Serve the given services on a Unix socket until the future completes
pub async fn serve_unix(
    socket: &Path,
    services: CsiServices,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()> {
    // stale socket from a previous run
    let _ = std::fs::remove_file(socket);
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let uds = UnixListener::bind(socket)?;
    let incoming = UnixListenerStream::new(uds);
    info!(socket = %socket.display(), "CSI endpoint listening");

    Server::builder()
        .add_optional_service(services.identity.map(IdentityServer::new))
        .add_optional_service(services.controller.map(ControllerServer::new))
        .add_optional_service(services.node.map(NodeServer::new))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await?;

    info!("CSI endpoint stopped");
    Ok(())
}

/// `unix:///csi/csi.sock` or a bare path
pub fn socket_path(endpoint: &str) -> &Path {
    Path::new(endpoint.strip_prefix("unix://").unwrap_or(endpoint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_mapping_keeps_message() {
        let status: Status = CsiError::Rejected("Fileset pvc-1 has dependent filesets.".to_string()).into();
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "Fileset pvc-1 has dependent filesets.");

        let status: Status = CsiError::unsupported("minimum version required is 5.1.1.2").into();
        assert_eq!(status.code(), Code::FailedPrecondition);

        let status: Status = CsiError::Timeout("fileset link".to_string()).into();
        assert_eq!(status.code(), Code::DeadlineExceeded);
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(socket_path("unix:///csi/csi.sock"), Path::new("/csi/csi.sock"));
        assert_eq!(socket_path("/tmp/x.sock"), Path::new("/tmp/x.sock"));
    }
}
