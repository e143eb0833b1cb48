use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use shared::types::CommandRecord;

#[derive(Default)]
struct Inner {
    commands_handled: u64,
    history: Vec<CommandRecord>,
}

/// A consistent view of the log: `commands_handled == history.len()`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandLogSnapshot {
    pub commands_handled: u64,
    pub history: Vec<CommandRecord>,
}

/// Append-only record of accepted commands, owned by one server instance.
///
/// The counter and the history are updated under one lock, so readers never
/// observe one without the other. Every append also publishes the new count on
/// a watch channel for pollers that only care about the number.
#[derive(Clone)]
pub struct CommandLog {
    inner: Arc<Mutex<Inner>>,
    count_tx: Arc<watch::Sender<u64>>,
}

impl CommandLog {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            count_tx: Arc::new(count_tx),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increment the counter and append the record. Returns the new count.
    pub fn record(&self, command: CommandRecord) -> u64 {
        let mut inner = self.lock();
        inner.commands_handled += 1;
        inner.history.push(command);
        let count = inner.commands_handled;
        // Published under the lock so the watch never runs backwards.
        self.count_tx.send_replace(count);
        count
    }

    pub fn commands_handled(&self) -> u64 {
        self.lock().commands_handled
    }

    pub fn snapshot(&self) -> CommandLogSnapshot {
        let inner = self.lock();
        CommandLogSnapshot {
            commands_handled: inner.commands_handled,
            history: inner.history.clone(),
        }
    }

    /// Records appended after the first `offset` entries.
    pub fn since(&self, offset: usize) -> Vec<CommandRecord> {
        let inner = self.lock();
        inner.history.get(offset..).map(<[_]>::to_vec).unwrap_or_default()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.count_tx.subscribe()
    }
}

impl Default for CommandLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(delta: i32, from_ip: &str) -> CommandRecord {
        CommandRecord {
            command_type: "volume".to_string(),
            delta,
            from_ip: from_ip.to_string(),
            timestamp: "12:00:00".to_string(),
        }
    }

    #[test]
    fn test_counter_tracks_history_length() {
        let log = CommandLog::new();
        assert_eq!(log.record(command(1, "10.0.0.2")), 1);
        assert_eq!(log.record(command(-3, "10.0.0.3")), 2);

        let snapshot = log.snapshot();
        assert_eq!(snapshot.commands_handled, 2);
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[1].delta, -3);
        assert_eq!(snapshot.history[1].from_ip, "10.0.0.3");
    }

    #[test]
    fn test_since_returns_only_new_entries() {
        let log = CommandLog::new();
        log.record(command(1, "a"));
        log.record(command(2, "b"));
        log.record(command(3, "c"));

        let fresh = log.since(2);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].delta, 3);
        assert!(log.since(10).is_empty());
    }

    #[test]
    fn test_subscribers_see_latest_count() {
        let log = CommandLog::new();
        let rx = log.subscribe();
        log.record(command(1, "a"));
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_concurrent_appends_stay_consistent() {
        let log = CommandLog::new();
        let rx = log.subscribe();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        log.record(command(i, "x"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = log.snapshot();
        assert_eq!(snapshot.commands_handled, 400);
        assert_eq!(snapshot.history.len(), 400);
        assert_eq!(*rx.borrow(), 400);
    }

    #[test]
    fn test_watched_count_never_decreases() {
        let log = CommandLog::new();
        let mut rx = log.subscribe();
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        log.record(command(1, "x"));
                    }
                })
            })
            .collect();

        let mut last = 0;
        while writers.iter().any(|w| !w.is_finished()) {
            let seen = *rx.borrow_and_update();
            assert!(seen >= last, "count went from {} to {}", last, seen);
            last = seen;
        }
        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(*rx.borrow(), 400);
    }
}
