use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::types::{ConnectionStatus, ServiceRecord};
use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, SelectionHandle};
use crate::dispatcher::CommandDispatcher;

/// Which directory entry to connect to next, if any.
///
/// Only entries still in `Unknown` are candidates, so a service that ended in
/// `Error` or `Disconnected` is not retried until it is lost and announced
/// again. A live selection that is still listed is kept.
pub fn next_candidate(snapshot: &[ServiceRecord], selected: Option<&ServiceRecord>) -> Option<ServiceRecord> {
    if let Some(current) = selected {
        let still_listed = snapshot.iter().any(|r| r.name == current.name);
        if still_listed && !current.connection_status.is_terminal() {
            return None;
        }
    }
    snapshot
        .iter()
        .find(|r| r.connection_status == ConnectionStatus::Unknown && selected.map_or(true, |c| c.name != r.name))
        .cloned()
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Headless receiver loop: follows the directory, auto-selects services and
/// optionally sends periodic commands to the selected one.
pub async fn run(
    manager: ConnectionManager,
    dispatcher: CommandDispatcher,
    config: SessionConfig,
    cancel: CancellationToken,
) {
    let mut directory_rx = manager.directory().subscribe();
    let mut transitions = manager.subscribe_transitions();
    let mut command_tick = config.command_interval_ms.map(|ms| {
        let mut interval = tokio::time::interval(Duration::from_millis(ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut known: Vec<String> = Vec::new();
    let mut current: Option<SelectionHandle> = None;

    loop {
        tokio::select! {
            changed = directory_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = directory_rx.borrow_and_update().clone();

                let names: Vec<String> = snapshot.iter().map(|r| r.name.clone()).collect();
                if names != known {
                    tracing::info!("Services on the network: {:?}", names);
                    known = names;
                }

                if config.auto_select {
                    if let Some(next) = next_candidate(&snapshot, manager.selected().as_ref()) {
                        current = Some(manager.select_service(&next));
                    }
                }
            }
            change = transitions.recv() => {
                match change {
                    Ok(change) => match change.reason {
                        Some(reason) => tracing::info!("{} is now {} ({})", change.name, change.status, reason),
                        None => tracing::info!("{} is now {}", change.name, change.status),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} status changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = next_tick(&mut command_tick) => {
                if let Some(selected) = manager.selected() {
                    dispatcher.spawn_command(selected);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Session shutting down");
                break;
            }
        }
    }

    if let Some(handle) = current {
        handle.cancel();
        handle.join().await;
    }
}
