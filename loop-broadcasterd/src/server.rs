use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use shared::protocol::{service_name, ID_LEN, PROTOCOL_VERSION};
use shared::types::Identity;
use crate::api::routes::{self, AppState};
use crate::command_log::CommandLog;
use crate::config::ServerConfig;

const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Short random id, regenerated on every process start. Not a credential.
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()[..ID_LEN].to_string()
}

pub fn identity(name_prefix: &str, id: &str) -> Identity {
    Identity {
        id: id.to_string(),
        name: service_name(name_prefix, id),
        version: PROTOCOL_VERSION,
    }
}

/// The broadcaster's HTTP control service, bound but not yet serving.
pub struct CommandServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: AppState,
}

impl CommandServer {
    /// Bind the listening socket. With port 0 the OS picks the port, and
    /// [`CommandServer::port`] reports the one actually assigned.
    pub async fn bind(config: &ServerConfig, identity: Identity, log: CommandLog) -> Result<Self> {
        let addr = format!("{}:{}", config.listen, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to resolve bound address")?;

        tracing::info!("Command server bound to {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            state: AppState {
                identity: Arc::new(identity),
                log,
            },
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn identity(&self) -> &Identity {
        &self.state.identity
    }

    /// Serve requests until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let app = routes::router(self.state)
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("Command server failed")?;

        tracing::info!("Command server stopped");
        Ok(())
    }
}

/// Try a loopback connection to the freshly bound port and log the result.
/// Failures are reported, never fatal.
pub async fn self_check(port: u16) -> bool {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match tokio::time::timeout(SELF_CHECK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_)) => {
            tracing::debug!("Loopback connectivity check passed ({})", addr);
            true
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            tracing::warn!("Loopback connectivity check failed: connection refused to {}", addr);
            false
        }
        Ok(Err(e)) => {
            tracing::warn!("Loopback connectivity check failed: {} ({})", e, addr);
            false
        }
        Err(_) => {
            tracing::warn!("Loopback connectivity check failed: timeout to {}", addr);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_short_hex() {
        let id = generate_id();
        assert_eq!(id.len(), 4);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identity_name_uses_prefix() {
        let identity = identity("Loop", "ab12");
        assert_eq!(identity.name, "Loop-ab12");
        assert_eq!(identity.version, 1);
    }

    #[tokio::test]
    async fn test_bind_resolves_ephemeral_port() {
        let config = ServerConfig::default();
        let server = CommandServer::bind(&config, identity("Loop", "ab12"), CommandLog::new())
            .await
            .unwrap();
        assert_ne!(server.port(), 0);
        assert!(server.local_addr().ip().is_unspecified());
        assert!(self_check(server.port()).await);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let first = CommandServer::bind(&ServerConfig::default(), identity("Loop", "a"), CommandLog::new())
            .await
            .unwrap();
        let taken = ServerConfig {
            listen: "0.0.0.0".to_string(),
            port: first.port(),
        };
        let second = CommandServer::bind(&taken, identity("Loop", "b"), CommandLog::new()).await;
        assert!(second.is_err());
    }
}
