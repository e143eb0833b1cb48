use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use shared::types::ServiceRecord;

/// A resolved announcement, before IPv4 selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
}

/// Events produced by a discovery source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found(DiscoveredService),
    Lost(String),
}

/// Immutable directory contents, in first-discovery order.
pub type Snapshot = Arc<Vec<ServiceRecord>>;

/// Apply one event to `current`. Returns `None` when the event changes nothing.
///
/// Found services without an IPv4 address are dropped. A known name keeps its
/// position and its connection fields; only the address is refreshed.
pub fn reduce(current: &[ServiceRecord], event: &DiscoveryEvent) -> Option<Vec<ServiceRecord>> {
    match event {
        DiscoveryEvent::Found(service) => {
            let Some(host) = first_ipv4(&service.addresses) else {
                tracing::debug!("Dropping {}: no IPv4 address in {:?}", service.name, service.addresses);
                return None;
            };

            match current.iter().position(|r| r.name == service.name) {
                Some(idx) => {
                    let existing = &current[idx];
                    if existing.host == host && existing.port == service.port {
                        return None;
                    }
                    let mut next = current.to_vec();
                    next[idx].host = host;
                    next[idx].port = service.port;
                    Some(next)
                }
                None => {
                    let mut next = current.to_vec();
                    next.push(ServiceRecord::new(service.name.clone(), host, service.port));
                    Some(next)
                }
            }
        }
        DiscoveryEvent::Lost(name) => {
            let idx = current.iter().position(|r| &r.name == name)?;
            let mut next = current.to_vec();
            next.remove(idx);
            Some(next)
        }
    }
}

/// Lowest IPv4 address, so repeated announcements resolve the same way.
fn first_ipv4(addresses: &[IpAddr]) -> Option<String> {
    addresses
        .iter()
        .filter_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .min()
        .map(|v4| v4.to_string())
}

/// Deduplicated view of announced services, published as whole snapshots.
#[derive(Clone)]
pub struct Directory {
    tx: Arc<watch::Sender<Snapshot>>,
}

impl Directory {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self { tx: Arc::new(tx) }
    }

    /// Reduce a discovery event into the directory. Returns true if a new
    /// snapshot was published.
    pub fn apply(&self, event: &DiscoveryEvent) -> bool {
        self.tx.send_if_modified(|snapshot| match reduce(snapshot, event) {
            Some(next) => {
                *snapshot = Arc::new(next);
                true
            }
            None => false,
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.tx.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.tx.borrow().iter().find(|r| r.name == name).cloned()
    }

    /// Copy the connection-owned fields of `record` onto the entry with the same
    /// name. Only the connection manager calls this.
    pub(crate) fn apply_connection(&self, record: &ServiceRecord) {
        self.tx.send_if_modified(|snapshot| {
            let Some(idx) = snapshot.iter().position(|r| r.name == record.name) else {
                return false;
            };
            let mut next = snapshot.as_ref().clone();
            let entry = &mut next[idx];
            entry.id = record.id.clone();
            entry.version = record.version;
            entry.last_ping = record.last_ping;
            entry.connection_status = record.connection_status;
            entry.last_error = record.last_error.clone();
            *snapshot = Arc::new(next);
            true
        });
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

/// Directory event loop - drains discovery events into the directory
pub async fn run(
    directory: Directory,
    mut rx: mpsc::Receiver<DiscoveryEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Discovery source closed");
                    break;
                };
                if directory.apply(&event) {
                    tracing::debug!("Directory now holds {} services", directory.snapshot().len());
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Directory shutting down");
                break;
            }
        }
    }
}
