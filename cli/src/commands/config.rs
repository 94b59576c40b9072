// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, crd

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use kube::CustomResourceExt;

use scale_csi_core::domain::config::DriverConfigManifest;
use scale_csi_core::domain::operator::CSIScaleOperator;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration (after environment overrides)
    Show,

    /// Validate a configuration file
    Validate {
        /// Path to config file (default: --config)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Print the CSIScaleOperator CustomResourceDefinition
    Crd,
}

pub async fn handle_command(command: ConfigCommand, config_path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Show => show(config_path),
        ConfigCommand::Validate { file } => validate(file.as_deref().unwrap_or(config_path)),
        ConfigCommand::Crd => crd(),
    }
}

fn show(config_path: &Path) -> Result<()> {
    let config = DriverConfigManifest::load(config_path).context("Failed to load configuration")?;

    println!("{}", "Driver:".bold());
    println!("  Name: {}", config.spec.driver.name);
    println!(
        "  Node ID: {}",
        config.spec.driver.node_id.as_deref().unwrap_or("(not set)")
    );
    println!("  Backend mode: {:?}", config.spec.backend.mode);
    println!();

    println!("{}", "Clusters:".bold());
    for cluster in &config.spec.clusters {
        let role = if cluster.is_primary() { " (primary)" } else { "" };
        println!("  {}{}", cluster.id.bold(), role);
        for endpoint in &cluster.rest_api {
            println!("    REST: {}", endpoint.base_url());
        }
        if let Some(primary) = &cluster.primary {
            println!("    Primary filesystem: {}", primary.primary_fs);
        }
    }
    Ok(())
}

pub fn validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration...");
    DriverConfigManifest::load(config_path).context("Configuration validation failed")?;
    println!("{}", "✓ Configuration is valid".green());
    Ok(())
}

fn crd() -> Result<()> {
    let crd = serde_yaml::to_string(&CSIScaleOperator::crd()).context("Failed to render CRD")?;
    print!("{}", crd);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID: &str = r#"
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
        - guiHost: gui.example.com
      credentials:
        username: admin
        password: env:SCALE_GUI_PASSWORD
"#;

    #[test]
    fn test_validate_accepts_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.as_bytes()).unwrap();
        validate(file.path()).unwrap();
    }

    #[test]
    fn test_validate_rejects_missing_primary() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID.replace("primaryFs: fs1", "primaryFs: \"\"").as_bytes())
            .unwrap();
        assert!(validate(file.path()).is_err());
    }
}
