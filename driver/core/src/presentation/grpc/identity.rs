// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashMap;

use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use super::csi::identity_server::Identity;
use super::csi::plugin_capability::{self, service, volume_expansion};
use super::csi::*;
use crate::infrastructure::scale::ClusterRegistry;

pub struct CsiIdentityService {
    driver_name: String,
    /// Backends probed for readiness; `None` on node-only plugins
    registry: Option<ClusterRegistry>,
}

impl CsiIdentityService {
    pub fn new(driver_name: impl Into<String>, registry: Option<ClusterRegistry>) -> Self {
        Self {
            driver_name: driver_name.into(),
            registry,
        }
    }
}

#[tonic::async_trait]
impl Identity for CsiIdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.driver_name.clone(),
            vendor_version: env!("CARGO_PKG_VERSION").to_string(),
            manifest: HashMap::new(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let mut capabilities = vec![PluginCapability {
            r#type: Some(plugin_capability::Type::VolumeExpansion(plugin_capability::VolumeExpansion {
                r#type: volume_expansion::Type::Online as i32,
            })),
        }];
        if self.registry.is_some() {
            capabilities.push(PluginCapability {
                r#type: Some(plugin_capability::Type::Service(plugin_capability::Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            });
        }
        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        let ready = match &self.registry {
            Some(registry) => match registry.probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Probe failed: {}", e);
                    return Err(e.into());
                }
            },
            None => true,
        };
        debug!(ready, "Probe");
        Ok(Response::new(ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::scale::InMemoryScaleBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_controller_plugin_advertises_controller_service() {
        let backend = Arc::new(InMemoryScaleBackend::new("17"));
        let svc = CsiIdentityService::new("spectrumscale.csi.ibm.com", Some(ClusterRegistry::new("17", "fs1", backend)));

        let info = svc.get_plugin_info(Request::new(GetPluginInfoRequest {})).await.unwrap().into_inner();
        assert_eq!(info.name, "spectrumscale.csi.ibm.com");

        let caps = svc
            .get_plugin_capabilities(Request::new(GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 2);

        let probe = svc.probe(Request::new(ProbeRequest {})).await.unwrap().into_inner();
        assert_eq!(probe.ready, Some(true));
    }

    #[tokio::test]
    async fn test_node_plugin_is_always_ready() {
        let svc = CsiIdentityService::new("x", None);
        let probe = svc.probe(Request::new(ProbeRequest {})).await.unwrap().into_inner();
        assert_eq!(probe.ready, Some(true));
    }
}
