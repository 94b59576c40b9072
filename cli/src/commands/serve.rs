// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CSI plugin processes: controller, node, or both in one.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, info, warn};

use scale_csi_core::application::fileset_manager::StandardFilesetService;
use scale_csi_core::application::locks::KeyedLocks;
use scale_csi_core::application::snapshot_manager::StandardSnapshotService;
use scale_csi_core::domain::config::DriverConfigManifest;
use scale_csi_core::infrastructure::event_bus::{EventBus, EventBusError, EventReceiver};
use scale_csi_core::infrastructure::mount::SystemMounter;
use scale_csi_core::infrastructure::repositories::InMemoryVolumeRepository;
use scale_csi_core::infrastructure::scale::ClusterRegistry;
use scale_csi_core::presentation::grpc::{
    serve_unix, socket_path, CsiControllerService, CsiIdentityService, CsiNodeService, CsiServices,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Controller and Node services on one socket
    Plugin,
    Controller,
    Node,
}

impl Role {
    fn serves_controller(&self) -> bool {
        matches!(self, Role::Plugin | Role::Controller)
    }

    fn serves_node(&self) -> bool {
        matches!(self, Role::Plugin | Role::Node)
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// CSI endpoint (unix socket)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///csi/csi.sock")]
    pub endpoint: String,

    /// Node id reported to the kubelet (overrides spec.driver.nodeId)
    #[arg(long, env = "SCALE_CSI_NODE_ID")]
    pub node_id: Option<String>,

    /// Volume creations served concurrently; further requests wait briefly, then abort
    #[arg(long, default_value_t = 16)]
    pub max_concurrent_creates: usize,
}

pub async fn run(role: Role, args: ServeArgs, config_path: &Path) -> Result<()> {
    let mut config = DriverConfigManifest::load(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(node_id) = args.node_id {
        config.spec.driver.node_id = Some(node_id);
    }
    let driver_name = config.spec.driver.name.clone();
    info!(?role, driver = %driver_name, "Starting Scale CSI plugin");

    let mut services = CsiServices::default();

    let registry = if role.serves_controller() {
        let registry = ClusterRegistry::from_config(&config).context("Failed to create backend clients")?;
        if let Err(e) = registry.probe().await {
            // the sidecars keep probing; do not refuse to start
            warn!("Backend not reachable at startup: {}", e);
        }
        Some(registry)
    } else {
        None
    };

    if let Some(registry) = &registry {
        let event_bus = Arc::new(EventBus::with_default_capacity());
        tokio::spawn(log_events(event_bus.subscribe()));

        let locks = KeyedLocks::new();
        let filesets = Arc::new(StandardFilesetService::new(
            registry.clone(),
            Arc::new(InMemoryVolumeRepository::new()),
            event_bus.clone(),
            locks.clone(),
        ));
        let snapshots = Arc::new(StandardSnapshotService::new(
            registry.clone(),
            filesets.clone(),
            event_bus,
            locks,
        ));
        services.controller = Some(CsiControllerService::new(filesets, snapshots, args.max_concurrent_creates));
    }

    if role.serves_node() {
        let node_id = config
            .spec
            .driver
            .node_id
            .clone()
            .context("A node id is required: pass --node-id or set SCALE_CSI_NODE_ID")?;
        info!(node = %node_id, "Node service enabled");
        services.node = Some(CsiNodeService::new(node_id, Arc::new(SystemMounter::new())));
    }

    services.identity = Some(CsiIdentityService::new(driver_name, registry));

    serve_unix(socket_path(&args.endpoint), services, shutdown_signal()).await
}

/// Mirror domain events into the log
async fn log_events(mut events: EventReceiver) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(?event, "Domain event"),
            Err(EventBusError::Closed) => break,
            Err(_) => continue,
        }
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
