use anyhow::{Context, Result, bail};
use clap::Parser;
use portrelay::{Server, config::DEFAULT_CONFIG_PATH, load_config};
use std::{io, path::PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "TCP reverse proxy with round-robin backends", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!(
        config_file = %args.config.display(),
        apps = config.apps.len(),
        bind_host = %config.proxy.bind_host,
        max_retries = config.proxy.max_retries,
        "Configuration loaded"
    );

    let server = Server::from_config(&config).context("Failed to build port lookup")?;
    for (app, port) in server.selector().ports() {
        info!(app = %app, port, "Configured listener");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let reports = server.start(shutdown).await;
    info!("Proxy shutdown");

    if !reports.is_empty() && reports.iter().all(|r| r.result.is_err()) {
        bail!("No listener could be started");
    }
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    match wait_for_signal().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Failed to listen for shutdown signals");
            return;
        }
    }
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> io::Result<()> {
    tokio::signal::ctrl_c().await
}
