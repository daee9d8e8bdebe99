// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steward - local worker supervisor
//!
//! Steward is responsible for:
//! - Fetching, verifying and installing worker artifacts
//! - Spawning workers and restarting them when they crash
//! - Serving the control plane workers check in with
//!
//! The desired configuration is read once at boot from `STEWARD_CONFIG_FILE`.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{error, info, warn};

use steward_core::config::Config;
use steward_core::descriptor::ProgramSpec;
use steward_core::resolver::ConfigRequest;
use steward_core::runtime::StewardRuntime;

/// Boot file: the supported programs plus the first configuration request.
#[derive(Debug, Deserialize)]
struct BootFile {
    #[serde(default)]
    supported: Vec<ProgramSpec>,
    #[serde(flatten)]
    request: ConfigRequest,
}

async fn read_boot_file(path: &Path) -> Result<BootFile> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("invalid boot file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("steward_core=info".parse()?),
        )
        .init();

    info!("Starting Steward");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        control_addr = %config.server.endpoint.bind_addr,
        data_dir = %config.data_dir.display(),
        pipeline_id = %config.pipeline_id,
        "Configuration loaded"
    );

    let boot = match std::env::var("STEWARD_CONFIG_FILE") {
        Ok(path) => Some(read_boot_file(Path::new(&path)).await?),
        Err(_) => None,
    };

    let mut builder = StewardRuntime::builder().config(config);
    if let Some(boot) = &boot {
        for spec in &boot.supported {
            builder = builder.program(spec.clone());
        }
    }
    let runtime = builder.build()?.start().await?;

    match &boot {
        Some(boot) => {
            if let Err(e) = runtime.operator().handle_config(&boot.request).await {
                // the operator stays up with its status set to Failed
                warn!(error = %e, "boot configuration not fully applied");
            }
        }
        None => info!("No STEWARD_CONFIG_FILE set, waiting without applications"),
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
