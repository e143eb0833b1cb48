use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::protocol::{INFO_PATH, PING_PATH};
use shared::types::{ConnectionStatus, ServiceRecord};
use crate::config::{HeartbeatConfig, ProbeConfig};
use crate::directory::Directory;
use crate::transport::{HttpReply, Transport};

const TRANSITION_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub probe_enabled: bool,
    pub probe_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures that end a connection
    pub max_failures: u32,
}

impl ConnectionSettings {
    pub fn from_config(probe: &ProbeConfig, heartbeat: &HeartbeatConfig) -> Self {
        Self {
            probe_enabled: probe.enabled,
            probe_timeout: probe.timeout(),
            heartbeat_interval: heartbeat.interval(),
            max_failures: heartbeat.max_failures.max(1),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from_config(&ProbeConfig::default(), &HeartbeatConfig::default())
    }
}

/// A status change of one service, in publication order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub name: String,
    pub status: ConnectionStatus,
    pub reason: Option<String>,
}

/// How a selection's task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    /// Reachability or handshake failed; the record is in `Error`.
    Failed(String),
    /// Heartbeats were exhausted; the record is in `Disconnected`.
    Disconnected(String),
    /// Superseded by another selection, cancelled, or torn down.
    Cancelled,
}

/// Handle to the task driving one selection.
pub struct SelectionHandle {
    name: String,
    token: CancellationToken,
    task: JoinHandle<SelectionOutcome>,
}

impl SelectionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the handshake or heartbeat without a status transition.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> SelectionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("Selection task for {} failed: {}", self.name, e);
                SelectionOutcome::Cancelled
            }
        }
    }
}

#[derive(Clone)]
struct Selection {
    name: String,
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ActiveState {
    next_generation: u64,
    current: Option<Selection>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    directory: Directory,
    settings: ConnectionSettings,
    selected: watch::Sender<Option<ServiceRecord>>,
    transitions: broadcast::Sender<StatusChange>,
    active: Mutex<ActiveState>,
    heartbeats: AtomicUsize,
    shutdown: CancellationToken,
}

/// Drives one selected service at a time through
/// `Connecting -> Connected -> Disconnected`, or into `Error`.
///
/// Every write goes through the generation check in [`ConnectionManager::publish`],
/// so a superseded selection can never overwrite the current one.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

/// Fields of `/info` the receiver relies on.
#[derive(Deserialize)]
struct InfoBody {
    id: String,
    version: u32,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, directory: Directory, settings: ConnectionSettings) -> Self {
        let (selected, _) = watch::channel(None);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                directory,
                settings,
                selected,
                transitions,
                active: Mutex::new(ActiveState::default()),
                heartbeats: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    /// The selected service as last published.
    pub fn selected(&self) -> Option<ServiceRecord> {
        self.inner.selected.borrow().clone()
    }

    pub fn subscribe_selected(&self) -> watch::Receiver<Option<ServiceRecord>> {
        self.inner.selected.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.transitions.subscribe()
    }

    /// Number of heartbeat loops currently running.
    pub fn active_heartbeats(&self) -> usize {
        self.inner.heartbeats.load(Ordering::SeqCst)
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveState> {
        self.inner.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start connecting to `record`. The previous selection, if any, is
    /// cancelled. The record is `Connecting` by the time this returns.
    pub fn select_service(&self, record: &ServiceRecord) -> SelectionHandle {
        let token = self.inner.shutdown.child_token();
        let connecting = ServiceRecord {
            connection_status: ConnectionStatus::Connecting,
            last_error: None,
            ..record.clone()
        };

        let selection = {
            let mut active = self.lock_active();
            if let Some(previous) = active.current.take() {
                tracing::debug!("Selection of {} superseded by {}", previous.name, record.name);
                previous.token.cancel();
            }
            active.next_generation += 1;
            let selection = Selection {
                name: record.name.clone(),
                generation: active.next_generation,
                token: token.clone(),
            };
            active.current = Some(selection.clone());
            self.write(&connecting);
            selection
        };

        tracing::info!("Connecting to {} at {}:{}", record.name, record.host, record.port);

        let manager = self.clone();
        let task = tokio::spawn(async move { manager.connect(selection, connecting).await });

        SelectionHandle {
            name: record.name.clone(),
            token,
            task,
        }
    }

    /// Select a directory entry by name.
    pub fn select_by_name(&self, name: &str) -> Option<SelectionHandle> {
        let record = self.inner.directory.get(name)?;
        Some(self.select_service(&record))
    }

    /// Move `record` to `Error` from outside the selection task, e.g. when a
    /// command could not be delivered. Ends the selection if it is current.
    pub fn mark_error(&self, record: &ServiceRecord, reason: &str) {
        let mut active = self.lock_active();
        let is_current = active.current.as_ref().is_some_and(|s| s.name == record.name);

        let base = if is_current {
            if let Some(selection) = active.current.take() {
                selection.token.cancel();
            }
            self.selected().unwrap_or_else(|| record.clone())
        } else {
            record.clone()
        };

        let failed = ServiceRecord {
            connection_status: ConnectionStatus::Error,
            last_error: Some(reason.to_string()),
            ..base
        };
        tracing::warn!("Service error for {}: {}", record.name, reason);

        if is_current {
            self.write(&failed);
        } else {
            self.inner.directory.apply_connection(&failed);
            self.notify(&failed);
        }
    }

    /// Cancel every selection task. Further selections start out cancelled.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.lock_active().current = None;
    }

    fn notify(&self, record: &ServiceRecord) {
        let _ = self.inner.transitions.send(StatusChange {
            name: record.name.clone(),
            status: record.connection_status,
            reason: record.last_error.clone(),
        });
    }

    /// Publish `record` as the selected service and mirror it into the
    /// directory. Callers hold the `active` lock.
    fn write(&self, record: &ServiceRecord) {
        let changed = self.inner.selected.borrow().as_ref().map_or(true, |previous| {
            previous.name != record.name || previous.connection_status != record.connection_status
        });

        self.inner.selected.send_replace(Some(record.clone()));
        self.inner.directory.apply_connection(record);
        if changed {
            tracing::debug!("{} -> {}", record.name, record.connection_status);
            self.notify(record);
        }
    }

    /// Write `record` only if `selection` is still the current one.
    fn publish(&self, selection: &Selection, record: &ServiceRecord) -> bool {
        let active = self.lock_active();
        let current = active
            .current
            .as_ref()
            .is_some_and(|s| s.generation == selection.generation);
        if !current || selection.token.is_cancelled() {
            return false;
        }
        self.write(record);
        true
    }

    /// Poll-based exit condition for heartbeat loops.
    fn still_selected(&self, selection: &Selection) -> bool {
        !selection.token.is_cancelled()
            && self
                .inner
                .selected
                .borrow()
                .as_ref()
                .is_some_and(|r| r.name == selection.name)
    }

    fn fail(&self, selection: &Selection, mut record: ServiceRecord, reason: String) -> SelectionOutcome {
        tracing::warn!("Service error for {}: {}", record.name, reason);
        record.connection_status = ConnectionStatus::Error;
        record.last_error = Some(reason.clone());
        if self.publish(selection, &record) {
            SelectionOutcome::Failed(reason)
        } else {
            SelectionOutcome::Cancelled
        }
    }

    async fn connect(&self, selection: Selection, mut record: ServiceRecord) -> SelectionOutcome {
        let transport = self.inner.transport.clone();
        let settings = &self.inner.settings;

        if settings.probe_enabled {
            tracing::debug!("Checking if {}:{} is reachable", record.host, record.port);
            let reachable = tokio::select! {
                biased;
                _ = selection.token.cancelled() => return SelectionOutcome::Cancelled,
                reachable = transport.probe(&record.host, record.port, settings.probe_timeout) => reachable,
            };
            if !reachable {
                let reason = format!("Port {} is not open or service is not running", record.port);
                return self.fail(&selection, record, reason);
            }
        }

        let reply = tokio::select! {
            biased;
            _ = selection.token.cancelled() => return SelectionOutcome::Cancelled,
            reply = transport.get(&record, INFO_PATH) => reply,
        };

        let info = match reply {
            Err(e) => {
                tracing::debug!("Handshake with {}:{} failed: {}", record.host, record.port, e);
                let reason = e.handshake_reason();
                return self.fail(&selection, record, reason);
            }
            Ok(reply) => match parse_info(&reply) {
                Ok(info) => info,
                Err(reason) => return self.fail(&selection, record, reason),
            },
        };

        record.id = Some(info.id);
        record.version = Some(info.version);
        record.connection_status = ConnectionStatus::Connected;
        record.last_error = None;
        if !self.publish(&selection, &record) {
            return SelectionOutcome::Cancelled;
        }

        tracing::info!(
            "Connected to {} (id {}, version {})",
            record.name,
            record.id.as_deref().unwrap_or("?"),
            record.version.unwrap_or_default()
        );

        self.heartbeat(selection, record).await
    }

    async fn heartbeat(&self, selection: Selection, mut record: ServiceRecord) -> SelectionOutcome {
        let _running = HeartbeatGuard::new(&self.inner.heartbeats);
        let transport = self.inner.transport.clone();
        let max_failures = self.inner.settings.max_failures;

        let mut interval = tokio::time::interval(self.inner.settings.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = selection.token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.still_selected(&selection) {
                break;
            }

            let result = tokio::select! {
                biased;
                _ = selection.token.cancelled() => break,
                result = transport.get(&record, PING_PATH) => result,
            };

            let reason = match result {
                Ok(reply) if reply.is_success() => {
                    failures = 0;
                    record.last_ping = Some(Utc::now());
                    record.connection_status = ConnectionStatus::Connected;
                    if !self.publish(&selection, &record) {
                        break;
                    }
                    continue;
                }
                Ok(reply) => {
                    tracing::warn!("Heartbeat failed: HTTP {} for {}", reply.status, record.name);
                    "Too many heartbeat failures".to_string()
                }
                Err(e) => {
                    tracing::warn!("Heartbeat failed: {} for {}", e, record.name);
                    e.heartbeat_reason()
                }
            };

            failures += 1;
            if failures >= max_failures {
                tracing::warn!("Heartbeat stopped for {}: {}", record.name, reason);
                record.connection_status = ConnectionStatus::Disconnected;
                record.last_error = Some(reason.clone());
                return if self.publish(&selection, &record) {
                    SelectionOutcome::Disconnected(reason)
                } else {
                    SelectionOutcome::Cancelled
                };
            }
        }

        tracing::debug!("Heartbeat for {} ended: no longer selected", record.name);
        SelectionOutcome::Cancelled
    }
}

fn parse_info(reply: &HttpReply) -> Result<InfoBody, String> {
    if !reply.is_success() {
        return Err(format!("HTTP {}", reply.status));
    }
    if reply.body.trim().is_empty() {
        return Err("Empty response body".to_string());
    }
    serde_json::from_str(&reply.body).map_err(|e| {
        tracing::debug!("Unparseable /info body {:?}: {}", reply.body, e);
        "Invalid identity payload".to_string()
    })
}

struct HeartbeatGuard<'a>(&'a AtomicUsize);

impl<'a> HeartbeatGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for HeartbeatGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
