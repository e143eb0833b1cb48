use std::collections::HashMap;
use std::sync::Arc;
use mdns_sd::{DaemonEvent, ServiceDaemon, ServiceInfo};
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// The part of the mDNS daemon the advertiser needs.
pub trait Registrar {
    fn register(&self, info: ServiceInfo) -> Result<()>;
    fn unregister(&self, fullname: &str) -> Result<()>;
}

impl Registrar for ServiceDaemon {
    fn register(&self, info: ServiceInfo) -> Result<()> {
        ServiceDaemon::register(self, info).context("Failed to register mDNS service")
    }

    fn unregister(&self, fullname: &str) -> Result<()> {
        ServiceDaemon::unregister(self, fullname).context("Failed to unregister mDNS service")?;
        Ok(())
    }
}

struct Registration {
    fullname: String,
    service_type: String,
    effective_name: String,
}

/// Publishes the command server on the local discovery namespace.
/// Holds at most one registration at a time.
pub struct Advertiser<R: Registrar = ServiceDaemon> {
    registrar: R,
    host_address: Option<String>,
    active: Option<Registration>,
}

impl<R: Registrar> Advertiser<R> {
    pub fn new(registrar: R, host_address: Option<String>) -> Self {
        Self {
            registrar,
            host_address,
            active: None,
        }
    }

    /// Register `name` under `service_type` on `port` and return the name the
    /// daemon confirmed. Any previous registration is withdrawn first.
    pub fn advertise(&mut self, name: &str, service_type: &str, port: u16) -> Result<String> {
        self.stop()?;

        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();
        let host_name = format!("{}.local.", hostname);
        let no_txt: HashMap<String, String> = HashMap::new();

        let service_info = match &self.host_address {
            Some(address) => ServiceInfo::new(service_type, name, &host_name, address.as_str(), port, no_txt),
            None => ServiceInfo::new(service_type, name, &host_name, (), port, no_txt)
                .map(ServiceInfo::enable_addr_auto),
        }
        .context("Failed to create ServiceInfo")?;

        let fullname = service_info.get_fullname().to_string();
        self.registrar.register(service_info)?;

        let effective_name = instance_name(&fullname, service_type).to_string();
        tracing::info!("Registered {} as {} on port {}", service_type, effective_name, port);

        self.active = Some(Registration {
            fullname,
            service_type: service_type.to_string(),
            effective_name: effective_name.clone(),
        });
        Ok(effective_name)
    }

    /// Withdraw the registration. No-op when nothing is registered.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(registration) = self.active.take() {
            self.registrar.unregister(&registration.fullname)?;
            tracing::info!("Unregistered {}", registration.fullname);
        }
        Ok(())
    }

    pub fn effective_name(&self) -> Option<&str> {
        self.active.as_ref().map(|r| r.effective_name.as_str())
    }

    pub fn is_registered(&self) -> bool {
        self.active.is_some()
    }

    /// Adopt a name the daemon chose to resolve a conflict. Returns true when
    /// the change concerned the active registration.
    pub fn adopt_name_change(&mut self, original: &str, new_name: &str) -> bool {
        let Some(registration) = self.active.as_mut() else {
            return false;
        };
        if registration.fullname != original {
            return false;
        }

        registration.effective_name = instance_name(new_name, &registration.service_type).to_string();
        registration.fullname = new_name.to_string();
        tracing::info!("Advertised name changed to {}", registration.effective_name);
        true
    }
}

/// Strip the `.<service_type>` suffix off a DNS-SD full name.
pub fn instance_name<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .unwrap_or(fullname)
}

/// Follow daemon notifications and keep the advertiser's name current.
pub async fn follow_name_changes<R: Registrar>(
    events: flume::Receiver<DaemonEvent>,
    advertiser: Arc<Mutex<Advertiser<R>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv_async() => {
                match event {
                    Ok(DaemonEvent::NameChange(change)) => {
                        advertiser.lock().await.adopt_name_change(&change.original, &change.new_name);
                    }
                    Ok(DaemonEvent::Error(e)) => {
                        tracing::warn!("mDNS daemon error: {}", e);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!("mDNS monitor closed: {}", e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default, Clone)]
    struct FakeRegistrar {
        calls: Arc<StdMutex<Vec<String>>>,
    }

    impl FakeRegistrar {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Registrar for FakeRegistrar {
        fn register(&self, info: ServiceInfo) -> Result<()> {
            self.calls.lock().unwrap().push(format!("register {} {}", info.get_fullname(), info.get_port()));
            Ok(())
        }

        fn unregister(&self, fullname: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("unregister {}", fullname));
            Ok(())
        }
    }

    const TYPE: &str = "_loop._tcp.local.";

    #[test]
    fn test_advertise_returns_confirmed_name() {
        let fake = FakeRegistrar::default();
        let mut advertiser = Advertiser::new(fake.clone(), Some("192.168.1.20".to_string()));

        let name = advertiser.advertise("Loop-ab12", TYPE, 4321).unwrap();
        assert_eq!(name, "Loop-ab12");
        assert_eq!(advertiser.effective_name(), Some("Loop-ab12"));
        assert_eq!(fake.calls(), vec!["register Loop-ab12._loop._tcp.local. 4321"]);
    }

    #[test]
    fn test_stop_without_registration_is_noop() {
        let fake = FakeRegistrar::default();
        let mut advertiser = Advertiser::new(fake.clone(), None);
        advertiser.stop().unwrap();
        advertiser.stop().unwrap();
        assert!(fake.calls().is_empty());
        assert!(!advertiser.is_registered());
    }

    #[test]
    fn test_readvertise_replaces_registration() {
        let fake = FakeRegistrar::default();
        let mut advertiser = Advertiser::new(fake.clone(), Some("10.0.0.1".to_string()));
        advertiser.advertise("Loop-aaaa", TYPE, 1000).unwrap();
        advertiser.advertise("Loop-bbbb", TYPE, 2000).unwrap();
        advertiser.stop().unwrap();

        assert_eq!(
            fake.calls(),
            vec![
                "register Loop-aaaa._loop._tcp.local. 1000",
                "unregister Loop-aaaa._loop._tcp.local.",
                "register Loop-bbbb._loop._tcp.local. 2000",
                "unregister Loop-bbbb._loop._tcp.local.",
            ]
        );
    }

    #[test]
    fn test_name_change_is_adopted() {
        let fake = FakeRegistrar::default();
        let mut advertiser = Advertiser::new(fake.clone(), Some("10.0.0.1".to_string()));
        advertiser.advertise("Loop-ab12", TYPE, 1000).unwrap();

        assert!(!advertiser.adopt_name_change("Other._loop._tcp.local.", "Other (2)._loop._tcp.local."));
        assert!(advertiser.adopt_name_change("Loop-ab12._loop._tcp.local.", "Loop-ab12 (2)._loop._tcp.local."));
        assert_eq!(advertiser.effective_name(), Some("Loop-ab12 (2)"));

        advertiser.stop().unwrap();
        assert_eq!(fake.calls().last().unwrap(), "unregister Loop-ab12 (2)._loop._tcp.local.");
    }

    #[test]
    fn test_instance_name_strips_type() {
        assert_eq!(instance_name("Loop-ab12._loop._tcp.local.", TYPE), "Loop-ab12");
        assert_eq!(instance_name("weird", TYPE), "weird");
    }
}
