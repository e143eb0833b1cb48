use std::error::Error as StdError;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::net::{lookup_host, TcpStream};
use shared::types::{CommandEnvelope, ServiceRecord};
use crate::config::HttpConfig;

/// Failure to get any HTTP response at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection refused")]
    Refused,
    #[error("timed out")]
    Timeout,
    #[error("unknown host: {0}")]
    UnknownHost(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Reason recorded when the identity handshake fails.
    pub fn handshake_reason(&self) -> String {
        match self {
            Self::Refused => "Connection refused: service not reachable".to_string(),
            Self::Timeout => "Connection timeout: service not responding".to_string(),
            Self::UnknownHost(host) => format!("Host not found: {}", host),
            Self::Other(msg) => format!("Network error: {}", msg),
        }
    }

    /// Reason recorded when heartbeats give up on this kind of failure.
    pub fn heartbeat_reason(&self) -> String {
        match self {
            Self::Refused => "Service unreachable".to_string(),
            Self::Timeout => "Service not responding".to_string(),
            Self::UnknownHost(host) => format!("Host not found: {}", host),
            Self::Other(msg) => format!("Network error: {}", msg),
        }
    }

    async fn from_reqwest(err: &reqwest::Error, host: &str) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }

        if err.is_connect() {
            let refused = std::iter::successors(err.source(), |&e: &&(dyn std::error::Error + 'static)| e.source()).any(|e| {
                e.downcast_ref::<io::Error>()
                    .is_some_and(|io| io.kind() == io::ErrorKind::ConnectionRefused)
            });
            if refused {
                return Self::Refused;
            }
            if unresolvable(host).await {
                return Self::UnknownHost(host.to_string());
            }
        }

        Self::Other(err.to_string())
    }
}

/// Whether `host` is a name that does not resolve. hyper keeps its resolver
/// error type private, so a failed connect is told apart by looking the name up
/// again.
async fn unresolvable(host: &str) -> bool {
    host.parse::<IpAddr>().is_err() && lookup_host((host, 0)).await.is_err()
}

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network access used by the connection manager and the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether a raw TCP connection to `host:port` succeeds within `timeout`.
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool;

    async fn get(&self, record: &ServiceRecord, path: &str) -> Result<HttpReply, TransportError>;

    async fn post_command(
        &self,
        record: &ServiceRecord,
        path: &str,
        envelope: &CommandEnvelope,
    ) -> Result<HttpReply, TransportError>;
}

/// [`Transport`] over reqwest with the configured timeout budget.
///
/// reqwest enforces the connect and whole-call timeouts. The read budget is
/// applied twice on top: once to the wait for the response head and once to
/// the body.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.call_timeout_ms))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            read_timeout: Duration::from_millis(config.read_timeout_ms),
        })
    }

    async fn execute(&self, request: reqwest::RequestBuilder, host: &str) -> Result<HttpReply, TransportError> {
        let response = match tokio::time::timeout(self.read_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(TransportError::from_reqwest(&e, host).await),
            Err(_) => {
                tracing::debug!("No response from {} within {:?}", host, self.read_timeout);
                return Err(TransportError::Timeout);
            }
        };

        let status = response.status().as_u16();
        let body = match tokio::time::timeout(self.read_timeout, response.text()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(TransportError::from_reqwest(&e, host).await),
            Err(_) => {
                tracing::debug!("Body from {} stalled for {:?}", host, self.read_timeout);
                return Err(TransportError::Timeout);
            }
        };
        Ok(HttpReply { status, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!("Port check failed for {}:{} - {}", host, port, e);
                return false;
            }
        };

        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!("Port check failed for {} - {}", addr, e);
                false
            }
            Err(_) => {
                tracing::debug!("Port check timed out for {}", addr);
                false
            }
        }
    }

    async fn get(&self, record: &ServiceRecord, path: &str) -> Result<HttpReply, TransportError> {
        let url = format!("{}{}", record.base_url(), path);
        tracing::debug!("GET {}", url);
        self.execute(self.client.get(&url), &record.host).await
    }

    async fn post_command(
        &self,
        record: &ServiceRecord,
        path: &str,
        envelope: &CommandEnvelope,
    ) -> Result<HttpReply, TransportError> {
        let url = format!("{}{}", record.base_url(), path);
        tracing::debug!("POST {} {:?}", url, envelope);
        self.execute(self.client.post(&url).json(envelope), &record.host).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_reply_success_range() {
        let reply = |status| HttpReply { status, body: String::new() };
        assert!(reply(200).is_success());
        assert!(reply(204).is_success());
        assert!(!reply(400).is_success());
        assert!(!reply(503).is_success());
    }

    #[test]
    fn test_reasons_are_specific() {
        assert_eq!(TransportError::Refused.handshake_reason(), "Connection refused: service not reachable");
        assert_eq!(TransportError::Timeout.heartbeat_reason(), "Service not responding");
        assert_eq!(
            TransportError::UnknownHost("nowhere".to_string()).handshake_reason(),
            "Host not found: nowhere"
        );
        assert_eq!(TransportError::Other("boom".to_string()).heartbeat_reason(), "Network error: boom");
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        // Grab a free port, then close it so nothing listens there
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = HttpTransport::new(&HttpConfig::default()).unwrap();
        let record = ServiceRecord::new("gone", "127.0.0.1", port);
        assert!(!transport.probe("127.0.0.1", port, Duration::from_secs(1)).await);
        assert_eq!(transport.get(&record, "/ping").await, Err(TransportError::Refused));
    }

    #[tokio::test]
    async fn test_probe_finds_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let transport = HttpTransport::new(&HttpConfig::default()).unwrap();
        assert!(transport.probe("127.0.0.1", port, Duration::from_secs(1)).await);
        assert!(!transport.probe("not-an-ip", port, Duration::from_secs(1)).await);
    }

    fn short_read_budget() -> HttpConfig {
        HttpConfig {
            read_timeout_ms: 200,
            ..HttpConfig::default()
        }
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_within_read_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = tokio::spawn(async move {
            let mut open = Vec::new();
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                open.push(stream);
            }
        });

        let transport = HttpTransport::new(&short_read_budget()).unwrap();
        let record = ServiceRecord::new("silent", "127.0.0.1", port);
        let started = std::time::Instant::now();
        assert_eq!(transport.get(&record, "/ping").await, Err(TransportError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
        held.abort();
    }

    #[tokio::test]
    async fn test_stalled_body_times_out_within_read_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let held = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 100\r\n\r\npartial")
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });

        let transport = HttpTransport::new(&short_read_budget()).unwrap();
        let record = ServiceRecord::new("stalled", "127.0.0.1", port);
        let started = std::time::Instant::now();
        assert_eq!(transport.get(&record, "/info").await, Err(TransportError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(5));
        held.abort();
    }

    #[tokio::test]
    async fn test_addresses_and_known_names_are_resolvable() {
        assert!(!unresolvable("127.0.0.1").await);
        assert!(!unresolvable("localhost").await);
    }
}
