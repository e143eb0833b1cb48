use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use loop_broadcasterd::command_log::CommandLog;
use loop_broadcasterd::config::Config;
use loop_broadcasterd::mdns::advertise::{self, Advertiser};
use loop_broadcasterd::server::{self, CommandServer};
use loop_broadcasterd::status;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("loop_broadcasterd=info"))
        )
        .init();

    tracing::info!("Starting loop-broadcasterd");

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None => Config::default(),
    };

    let id = server::generate_id();
    let identity = server::identity(&config.advertise.name_prefix, &id);
    let log = CommandLog::new();

    // Bind first so the advertised port is the one the OS actually assigned
    let command_server = CommandServer::bind(&config.server, identity.clone(), log.clone()).await?;
    let port = command_server.port();
    server::self_check(port).await;

    let cancel = CancellationToken::new();

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = command_server.serve(server_cancel).await {
            tracing::error!("Server error: {:#}", e);
        }
    });

    let poller_handle = tokio::spawn(status::run(
        log.clone(),
        Duration::from_millis(config.status.poll_interval_ms),
        cancel.clone(),
    ));

    let mut mdns = None;
    if config.advertise.enabled {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;
        let monitor = daemon.monitor().context("Failed to monitor mDNS daemon")?;

        let mut advertiser = Advertiser::new(daemon.clone(), config.advertise.host_address.clone());
        let name = advertiser.advertise(&identity.name, &config.advertise.service_type, port)?;
        tracing::info!("Advertising {}:{}", name, port);

        let advertiser = Arc::new(Mutex::new(advertiser));
        let monitor_handle = tokio::spawn(advertise::follow_name_changes(
            monitor,
            advertiser.clone(),
            cancel.clone(),
        ));
        mdns = Some((daemon, advertiser, monitor_handle));
    } else {
        tracing::info!("Advertising disabled; serving {} on port {}", identity.name, port);
    }

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");
    cancel.cancel();

    if let Some((daemon, advertiser, monitor_handle)) = mdns {
        if let Err(e) = advertiser.lock().await.stop() {
            tracing::error!("Failed to unregister mDNS service: {:#}", e);
        }
        let _ = monitor_handle.await;
        if let Err(e) = daemon.shutdown() {
            tracing::error!("Failed to shutdown mDNS daemon: {}", e);
        }
    }

    let (_, handled) = tokio::join!(server_handle, poller_handle);
    if let Ok(handled) = handled {
        tracing::info!("Handled {} commands", handled);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
