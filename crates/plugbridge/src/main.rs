use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use plugbridge::accessory::HttpAccessoryService;
use plugbridge::mqtt::RumqttcClient;
use plugbridge::Bridge;
use plugbridge::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "plugbridge")]
#[command(about = "Expose MQTT dimmers and fans as accessories")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config_path: Option<PathBuf>,
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, used_defaults) = Config::load(cli.config_path.as_deref())
        .context("Failed to load configuration")?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    tracing::info!("plugbridge starting");
    match (&cli.config_path, used_defaults) {
        (Some(path), true) => {
            tracing::warn!("{} not found, using default configuration", path.display())
        }
        (None, _) => tracing::info!("No configuration file given, using defaults"),
        (Some(path), false) => tracing::info!("Loaded config from: {}", path.display()),
    }

    let client = RumqttcClient::new(&config.broker);
    let service = Arc::new(HttpAccessoryService::new(config.accessory.bind));

    let bridge = Bridge::connect(client, &config, service).await?;
    bridge.run(shutdown_signal()).await?;

    tracing::info!("plugbridge shutdown complete");
    Ok(())
}
