use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{SERVICE_NAME_PREFIX, SERVICE_TYPE};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub advertise: AdvertiseConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Must stay a wildcard address so LAN peers can connect
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 0 asks the OS for an ephemeral port
    #[serde(default)]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdvertiseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Explicit IPv4 to announce. Interface addresses are used when unset.
    #[serde(default)]
    pub host_address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_name_prefix() -> String {
    SERVICE_NAME_PREFIX.to_string()
}

fn default_service_type() -> String {
    SERVICE_TYPE.to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: 0,
        }
    }
}

impl Default for AdvertiseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name_prefix: default_name_prefix(),
            service_type: default_service_type(),
            host_address: None,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0");
        assert_eq!(config.server.port, 0);
        assert!(config.advertise.enabled);
        assert_eq!(config.advertise.service_type, "_loop._tcp.local.");
        assert_eq!(config.advertise.name_prefix, "Loop");
        assert_eq!(config.status.poll_interval_ms, 1000);
    }

    #[test]
    fn test_partial_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 8080

            [advertise]
            enabled = false
            host_address = "192.168.1.20"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.listen, "0.0.0.0");
        assert!(!config.advertise.enabled);
        assert_eq!(config.advertise.host_address.as_deref(), Some("192.168.1.20"));
    }
}
