//! # Fieldgate Gateway Daemon
//!
//! ```text
//! fieldgate [--config <path>]
//! ```
//!
//! Runs until Ctrl+C or SIGTERM, then drains every loop before exiting.

use std::path::PathBuf;

use anyhow::{bail, Context};
use tracing::info;

use fieldgate_gateway::{init_tracing, GatewayConfig, GatewayContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = parse_args()?;
    let config = GatewayConfig::load(config_path).context("Failed to load configuration")?;
    info!(
        gateway_id = %config.gateway.id,
        database = %config.database_path().display(),
        "Configuration loaded"
    );

    let mut context = GatewayContext::build(config)
        .await
        .context("Failed to initialise gateway")?;
    context.start().await.context("Failed to start gateway")?;

    shutdown_signal().await;
    context.shutdown().await;
    Ok(())
}

fn parse_args() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "-h" | "--help" => {
                println!("Usage: fieldgate [--config <path>]");
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(config_path)
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
