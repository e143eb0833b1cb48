use std::sync::Arc;
use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use loop_receiver::config::Config;
use loop_receiver::connection::{ConnectionManager, ConnectionSettings};
use loop_receiver::directory::{self, Directory};
use loop_receiver::dispatcher::CommandDispatcher;
use loop_receiver::mdns::browser;
use loop_receiver::session;
use loop_receiver::transport::{HttpTransport, Transport};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loop_receiver=info"))
        )
        .init();

    tracing::info!("Starting loop-receiver");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None => Config::default(),
    };

    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
    let directory = Directory::new();
    let manager = ConnectionManager::new(
        transport.clone(),
        directory.clone(),
        ConnectionSettings::from_config(&config.probe, &config.heartbeat),
    );
    let dispatcher = CommandDispatcher::new(transport, manager.clone());

    let mdns_daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn mDNS browser task
    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_type = config.discovery.service_type.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = browser::run_browser(browser_daemon, service_type, browser_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {:#}", e);
        }
    });

    let directory_handle = tokio::spawn(directory::run(directory, browser_rx, cancel.clone()));
    let session_handle = tokio::spawn(session::run(
        manager.clone(),
        dispatcher,
        config.session.clone(),
        cancel.clone(),
    ));

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    manager.shutdown();

    let _ = tokio::join!(browser_handle, directory_handle, session_handle);

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
