// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `scale-csi operator`: reconcile CSIScaleOperator resources.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use scale_csi_core::application::operator::OperatorContext;
use scale_csi_core::infrastructure::event_bus::EventBus;
use scale_csi_core::infrastructure::kubernetes::{run_operator, KubeApplier};

#[derive(Debug, Clone, Args)]
pub struct OperatorArgs {
    /// Namespace to watch (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,
}

pub async fn run(args: OperatorArgs) -> Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!(namespace = args.namespace.as_deref().unwrap_or("<all>"), "Starting operator");

    let applier = Arc::new(KubeApplier::new(client.clone()));
    let ctx = Arc::new(OperatorContext::new(applier, Arc::new(EventBus::with_default_capacity())));
    run_operator(client, args.namespace.as_deref(), ctx).await;
    Ok(())
}
