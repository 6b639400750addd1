//! Berth daemon entry point.

use berth_daemon::{http, Daemon, DaemonConfig};
use tokio::signal;
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "berth_daemon=info,berth_core=info,berth_runtime=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; RUST_LOG overrides the default filter.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Berth daemon");

    let config = DaemonConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");
    config.validate()?;
    config.validate_warn();

    let daemon = Daemon::connect(&config).await?;
    daemon.start().await?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let http_daemon = daemon.clone();
    let http_addr = config.http_addr;
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = http::serve(http_daemon, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(
        http_addr = %config.http_addr,
        backend = daemon.provider().backend_name(),
        pool = daemon.pool().is_some(),
        "Daemon ready"
    );

    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    let _ = shutdown_tx.send(());
    daemon.shutdown().await;
    let _ = http_handle.await;

    tracing::info!("Daemon shutdown complete");
    Ok(())
}
