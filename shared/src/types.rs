use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::protocol::COMMAND_VOLUME;

/// Connection state of a discovered service, as seen by the receiver.
///
/// `Disconnected` and `Error` are terminal: only a fresh selection moves a
/// record back to `Connecting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "UNKNOWN",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A discovered broadcaster endpoint.
/// This is the record the directory, connection manager, and dispatcher share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance name, unique within the directory
    pub name: String,

    /// IPv4 literal, e.g. "192.168.1.20"
    pub host: String,

    pub port: u16,

    /// Broadcaster id, known after the handshake
    pub id: Option<String>,

    /// Protocol version, known after the handshake
    pub version: Option<u32>,

    /// Time of the last successful heartbeat
    pub last_ping: Option<DateTime<Utc>>,

    pub connection_status: ConnectionStatus,

    /// Reason for the most recent ERROR or DISCONNECTED transition
    pub last_error: Option<String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            id: None,
            version: None,
            last_ping: None,
            connection_status: ConnectionStatus::Unknown,
            last_error: None,
        }
    }

    /// Base URL of the broadcaster's control service
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn with_status(&self, status: ConnectionStatus) -> Self {
        Self {
            connection_status: status,
            ..self.clone()
        }
    }
}

/// Body of `GET /info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub version: u32,
}

/// Body of `GET /ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
}

/// Body of a successful `POST /command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub status: String,
}

impl CommandAck {
    pub fn ok() -> Self {
        Self { status: "ok".to_string() }
    }
}

/// The `{type, delta}` payload of `POST /command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub command_type: String,

    /// Missing deltas are treated as 0
    #[serde(default)]
    pub delta: i32,
}

impl CommandEnvelope {
    pub fn volume(delta: i32) -> Self {
        Self {
            command_type: COMMAND_VOLUME.to_string(),
            delta,
        }
    }
}

/// One command accepted by the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    #[serde(rename = "type")]
    pub command_type: String,
    pub delta: i32,
    /// Caller address as observed by the server
    pub from_ip: String,
    /// Local wall-clock time of acceptance, `HH:MM:SS`
    pub timestamp: String,
}
