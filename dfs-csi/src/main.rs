//! dfs-csi: CSI node plugin for the distributed filesystem.
//!
//! Serves the Identity, Controller and Node services on one endpoint:
//!
//! ```text
//!  orchestrator ──frames──▶ CsiServer ──▶ DfsBackend ──▶ VolumeStore (backing dirs)
//!                                                   └──▶ Mounter     (bind mounts)
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use libcsi::{BindMounter, CsiServer, DfsBackend, DryRunMounter, Mounter};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod config;

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let endpoint = args.endpoint()?;
    let config = args.plugin_config()?;

    info!(
        driver = %config.driver_name,
        version = %config.vendor_version,
        node_id = %config.node_id,
        volume_root = %config.volume_root.display(),
        %endpoint,
        dry_run = args.dry_run,
        "starting dfs-csi",
    );

    let mounter: Arc<dyn Mounter> = if args.dry_run {
        warn!("dry-run mode: mounts are logged, not performed");
        Arc::new(DryRunMounter)
    } else {
        Arc::new(BindMounter)
    };
    let backend = Arc::new(DfsBackend::with_local_store(config, mounter));
    backend
        .init()
        .await
        .context("failed to prepare the volume root")?;

    let server = CsiServer::bind(&endpoint, backend)
        .await
        .with_context(|| format!("failed to listen on {endpoint}"))?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("dfs-csi stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level)
        .with_context(|| format!("invalid log filter {:?}", args.log_level))?;

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
