use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use tcp_multi::config::Config;
use tcp_multi::logging;
use tcp_multi::server::Proxy;

#[derive(Parser)]
#[command(name = "tcp-multi")]
#[command(about = "TCP reverse proxy with round-robin backend failover", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = Config::load(&cli.config).context("Failed to load configuration")?;
    logging::init(&cfg.logging).context("Failed to initialize logger")?;

    let proxy = Proxy::new(&cfg);
    let listener = proxy.bind().await.inspect_err(|e| {
        error!("Failed to start proxy: {}", e);
    })?;

    info!(
        "Forwarding to {} backend(s): {}",
        cfg.proxy.backends.len(),
        cfg.proxy.backends.join(", ")
    );
    info!("TCP proxy started. Press Ctrl+C to exit.");

    tokio::select! {
        res = proxy.serve(listener) => res?,
        res = shutdown_signal() => {
            res.context("Failed to listen for shutdown signal")?;
            info!("Shutting down...");
            proxy.stop();
        }
    }

    info!("TCP proxy stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
