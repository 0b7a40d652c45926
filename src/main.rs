use anyhow::Result;
use clap::Parser;
use proxmox_suite::{
    config::{ExporterConfig, LogFormat, Settings},
    metrics::MetricsCollector,
    poller::{start_pollers, Poller, PollerSet},
    server::start_server,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Proxmox Suite Exporter - sensors for Proxmox VE and Proxmox Backup Server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", env = "PROXMOX_SUITE_CONFIG")]
    config: Option<String>,

    /// Validate every configured device and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let settings = Settings::load(args.config.as_deref())?;

    // Initialize logging
    init_logging(&settings.exporter);

    info!("Starting Proxmox Suite Exporter");
    info!("Devices: {}", settings.devices.len());
    info!("Listen address: {}", settings.exporter.listen_address);

    if args.check {
        // Fail fast on the first device that does not validate
        for device in &settings.devices {
            let mut poller = Poller::new(device.clone())?;
            if let Err(e) = poller.setup().await {
                error!("Setup failed for {}: {}", device.device_id(), e);
                return Err(e.into());
            }
        }
        info!("All {} devices validated", settings.devices.len());
        return Ok(());
    }

    // Start one poller per device
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let every = Duration::from_secs(settings.exporter.poll_interval_seconds);
    let PollerSet {
        receivers,
        handles,
        setup_failures,
    } = start_pollers(&settings.devices, every, shutdown_rx).await?;
    if !setup_failures.is_empty() {
        warn!(
            "{} of {} devices failed setup: {}",
            setup_failures.len(),
            settings.devices.len(),
            setup_failures.join(", ")
        );
    }
    info!("Pollers started (interval {:?})", every);

    let metrics = MetricsCollector::new(receivers)?;

    // Start HTTP server
    let result = start_server(&settings.exporter.listen_address, metrics, shutdown_signal()).await;
    if let Err(e) = &result {
        error!("Server error: {}", e);
    }

    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("Shut down");

    result.map_err(Into::into)
}

/// Initialize structured logging with tracing.
fn init_logging(exporter: &ExporterConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&exporter.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    match exporter.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Received shutdown signal");
}
