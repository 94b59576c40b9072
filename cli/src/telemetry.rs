// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Logging and metrics setup, done once at process start.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::ValueEnum;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Initialize tracing subscriber for logging. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}

/// Serve Prometheus metrics on `addr`
pub fn install_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(%addr, "Metrics endpoint listening");
    Ok(())
}
