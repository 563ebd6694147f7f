//! containerd-dns binary entry point.

use clap::Parser;
use containerd_dns::containerd::ContainerdClient;
use containerd_dns::{telemetry, Config, DiscoveryServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const DEFAULT_CONFIG_FILE: &str = "containerd-dns.toml";

/// DNS discovery for containers managed by containerd.
#[derive(Parser, Debug)]
#[command(name = "containerd-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Defaults to
    /// `containerd-dns.toml` if present.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the log level from the configuration file.
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let file = match &args.config {
        Some(path) => config::File::from(path.clone()).required(true),
        None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let mut config: Config = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("CONTAINERD_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    if let Some(level) = &args.log_level {
        config.telemetry.log_level = level.clone();
    }
    Ok(config.normalize()?)
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _telemetry =
        telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = ?args.config,
        endpoint = %config.discovery.endpoint,
        namespace = %config.discovery.namespace,
        listen_addr = %config.dns.listen_addr,
        "Starting containerd-dns"
    );

    let client = ContainerdClient::connect(&config.discovery.endpoint, &config.discovery.namespace)
        .await
        .map_err(|e| {
            error!("{}", e);
            e
        })?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let server = DiscoveryServer::new(config, Arc::new(client));
    if let Err(e) = server.run(cancel).await {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("containerd-dns shutdown complete");
    Ok(())
}
