use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use crate::directory::{DiscoveredService, DiscoveryEvent};

/// Browse `service_type` and forward resolved/removed services as
/// [`DiscoveryEvent`]s until cancelled.
pub async fn run_browser(
    daemon: ServiceDaemon,
    service_type: String,
    tx: mpsc::Sender<DiscoveryEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!("Starting mDNS discovery for {}", service_type);

    let receiver: flume::Receiver<ServiceEvent> = daemon
        .browse(&service_type)
        .with_context(|| format!("Failed to browse {}", service_type))?;

    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!("mDNS browse channel closed: {}", e);
                        break;
                    }
                };

                let forwarded = match event {
                    ServiceEvent::ServiceFound(_, fullname) => {
                        tracing::debug!("Service found: {}", fullname);
                        None
                    }
                    ServiceEvent::ServiceResolved(info) => {
                        let service = convert_service_info(&info);
                        tracing::debug!(
                            "Resolved {} at {:?}:{}",
                            service.name,
                            service.addresses,
                            service.port
                        );
                        Some(DiscoveryEvent::Found(service))
                    }
                    ServiceEvent::ServiceRemoved(typ, fullname) => {
                        let name = instance_name(&fullname, &typ).to_string();
                        tracing::debug!("Service lost: {}", name);
                        Some(DiscoveryEvent::Lost(name))
                    }
                    _ => None,
                };

                if let Some(event) = forwarded {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("Directory stopped listening; ending discovery");
                        break;
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("mDNS discovery shutting down");
                break;
            }
        }
    }

    if let Err(e) = daemon.stop_browse(&service_type) {
        tracing::debug!("Failed to stop browsing {}: {}", service_type, e);
    }
    Ok(())
}

/// Convert an mdns-sd ServiceInfo into a directory announcement. Address family
/// filtering is left to the directory.
fn convert_service_info(info: &ServiceInfo) -> DiscoveredService {
    DiscoveredService {
        name: instance_name(info.get_fullname(), info.get_type()).to_string(),
        addresses: info.get_addresses().iter().copied().collect(),
        port: info.get_port(),
    }
}

/// `Loop-ab12._loop._tcp.local.` -> `Loop-ab12`
fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
}
