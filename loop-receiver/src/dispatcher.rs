use std::sync::Arc;
use tokio::task::JoinHandle;
use shared::protocol::COMMAND_PATH;
use shared::types::{CommandEnvelope, ConnectionStatus, ServiceRecord};
use crate::connection::ConnectionManager;
use crate::transport::{Transport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The record was not connected; nothing was sent.
    Skipped,
    Accepted,
    /// The broadcaster answered with a non-2xx status.
    Rejected { status: u16, body: String },
    /// No response. The service has been moved to `Error`.
    Failed(TransportError),
}

/// Sends command envelopes to connected services.
#[derive(Clone)]
pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    manager: ConnectionManager,
}

impl CommandDispatcher {
    pub fn new(transport: Arc<dyn Transport>, manager: ConnectionManager) -> Self {
        Self { transport, manager }
    }

    /// Send the default `{"type":"volume","delta":1}` command.
    pub async fn send_command(&self, record: &ServiceRecord) -> DispatchOutcome {
        self.send(record, CommandEnvelope::volume(1)).await
    }

    pub async fn send(&self, record: &ServiceRecord, envelope: CommandEnvelope) -> DispatchOutcome {
        if record.connection_status != ConnectionStatus::Connected {
            tracing::warn!("Cannot send command to {}: service not connected ({})", record.name, record.connection_status);
            return DispatchOutcome::Skipped;
        }

        tracing::debug!("Sending {} {:+} to {}", envelope.command_type, envelope.delta, record.name);

        match self.transport.post_command(record, COMMAND_PATH, &envelope).await {
            Ok(reply) if reply.is_success() => {
                tracing::info!("Command sent successfully to {}", record.name);
                DispatchOutcome::Accepted
            }
            Ok(reply) => {
                tracing::warn!("Command failed: HTTP {} for {}", reply.status, record.name);
                DispatchOutcome::Rejected {
                    status: reply.status,
                    body: reply.body,
                }
            }
            Err(e) => {
                self.manager
                    .mark_error(record, &format!("Connection lost during command: {}", e));
                DispatchOutcome::Failed(e)
            }
        }
    }

    /// Run [`CommandDispatcher::send_command`] as its own task.
    pub fn spawn_command(&self, record: ServiceRecord) -> JoinHandle<DispatchOutcome> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.send_command(&record).await })
    }
}
