use std::time::Duration;
use tokio_util::sync::CancellationToken;
use crate::command_log::CommandLog;

/// Periodically surface the command counter and any newly accepted commands.
/// Returns the last count it observed.
pub async fn run(log: CommandLog, poll_interval: Duration, cancel: CancellationToken) -> u64 {
    let mut interval = tokio::time::interval(poll_interval);
    let mut seen = 0usize;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let fresh = log.since(seen);
                for command in &fresh {
                    tracing::info!(
                        "[{}] {} {:+} from {}",
                        command.timestamp,
                        command.command_type,
                        command.delta,
                        command.from_ip
                    );
                }
                if !fresh.is_empty() {
                    seen += fresh.len();
                    tracing::info!("Commands handled: {}", seen);
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("Status poller shutting down");
                break;
            }
        }
    }

    seen as u64
}
