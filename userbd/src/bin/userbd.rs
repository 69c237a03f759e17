//! userbd - serve a memory or file backend as a /dev/nbd block device.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use userbd::{Config, Session};

#[derive(Parser)]
#[command(
    name = "userbd",
    about = "Serve a user-space storage backend as a Linux NBD block device"
)]
struct Cli {
    /// Path to config file. If omitted, uses defaults (1GiB in-memory device).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device size in bytes. Overrides config file if specified.
    #[arg(long)]
    size: Option<u64>,

    /// Backing file. Overrides config file if specified.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(size) = cli.size {
        config.device.size_bytes = size;
    }
    if let Some(file) = cli.file {
        config.storage.path = Some(file);
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut session = Session::from_config(&config).context("Failed to create session")?;
    let device_path = session
        .connect()
        .await
        .context("Failed to bind an NBD device")?;

    info!(
        device = %device_path.display(),
        size_bytes = config.device.size_bytes,
        storage = %config
            .storage
            .path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string()),
        "userbd started"
    );

    let stop = session
        .stop_handle()
        .context("Session lost its device after connect")?;
    let mut sigterm =
        unix_signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let shutdown = tokio::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        if let Err(e) = stop.stop() {
            error!(error = %e, "Failed to request disconnect");
        }
    });

    let result = session.wait().await;
    shutdown.abort();

    let exit = result.with_context(|| format!("{} failed", device_path.display()))?;
    info!(?exit, "userbd stopped");
    Ok(())
}
