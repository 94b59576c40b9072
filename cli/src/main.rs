// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Scale CSI
//!
//! The `scale-csi` binary carries every process the driver runs:
//!
//! - `scale-csi plugin` - Controller and Node services on one CSI socket
//! - `scale-csi controller` / `scale-csi node` - either half alone
//! - `scale-csi operator` - reconcile CSIScaleOperator resources into driver workloads
//! - `scale-csi config show|validate|crd` - configuration tooling

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use scale_csi::commands::operator::OperatorArgs;
use scale_csi::commands::{self, ConfigCommand, Role, ServeArgs};
use scale_csi::telemetry::{self, LogFormat};

/// IBM Storage Scale CSI driver
#[derive(Parser)]
#[command(name = "scale-csi")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the driver configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "SCALE_CSI_CONFIG",
        value_name = "FILE",
        default_value = "/etc/scale-csi/config.yaml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "SCALE_CSI_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true, env = "SCALE_CSI_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run Controller and Node services in one process
    Plugin(ServeArgs),

    /// Run the Controller service only
    Controller(ServeArgs),

    /// Run the Node service only
    Node(ServeArgs),

    /// Run the CSIScaleOperator reconciler
    Operator(OperatorArgs),

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init_logging(&cli.log_level, cli.log_format)?;
    if let Some(addr) = cli.metrics_addr {
        telemetry::install_metrics(addr)?;
    }

    match cli.command {
        Commands::Plugin(args) => commands::serve::run(Role::Plugin, args, &cli.config).await,
        Commands::Controller(args) => commands::serve::run(Role::Controller, args, &cli.config).await,
        Commands::Node(args) => commands::serve::run(Role::Node, args, &cli.config).await,
        Commands::Operator(args) => commands::operator::run(args).await,
        Commands::Config { command } => commands::config::handle_command(command, &cli.config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_node_args() {
        let cli = Cli::try_parse_from([
            "scale-csi",
            "node",
            "--node-id",
            "worker-1",
            "--endpoint",
            "unix:///tmp/csi.sock",
        ])
        .unwrap();
        match cli.command {
            Commands::Node(args) => {
                assert_eq!(args.node_id.as_deref(), Some("worker-1"));
                assert_eq!(args.endpoint, "unix:///tmp/csi.sock");
                assert_eq!(args.max_concurrent_creates, 16);
            }
            _ => panic!("expected node command"),
        }
    }
}
