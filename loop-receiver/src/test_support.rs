use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use shared::types::{CommandEnvelope, ServiceRecord};
use crate::transport::{HttpReply, Transport, TransportError};

type Reply = Result<HttpReply, TransportError>;

/// Scripted [`Transport`]: per-path queues of replies, falling back to a
/// per-path default once a queue runs dry.
pub(crate) struct FakeTransport {
    reachable: AtomicBool,
    scripted: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: HashMap<String, Reply>,
    calls: Mutex<Vec<String>>,
    commands: Mutex<Vec<CommandEnvelope>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        let defaults = HashMap::from([
            ("/info".to_string(), ok(r#"{"id":"ab12","name":"Loop-ab12","version":1}"#)),
            ("/ping".to_string(), ok(r#"{"ok":true}"#)),
            ("/command".to_string(), ok(r#"{"status":"ok"}"#)),
        ]);
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            scripted: Mutex::new(HashMap::new()),
            defaults,
            calls: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn push(&self, path: &str, reply: Reply) {
        self.scripted
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Every call as `"<op> <host>:<port>"`, e.g. `"/ping 10.0.0.5:9000"`.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| c.split(' ').next() == Some(op)).count()
    }

    pub(crate) fn commands(&self) -> Vec<CommandEnvelope> {
        self.commands.lock().unwrap().clone()
    }

    fn reply(&self, record: &ServiceRecord, path: &str) -> Reply {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{} {}:{}", path, record.host, record.port));
        if let Some(reply) = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.defaults
            .get(path)
            .cloned()
            .unwrap_or_else(|| Err(TransportError::Other(format!("no route for {}", path))))
    }
}

pub(crate) fn ok(body: &str) -> Reply {
    Ok(HttpReply { status: 200, body: body.to_string() })
}

pub(crate) fn status(code: u16) -> Reply {
    Ok(HttpReply { status: code, body: String::new() })
}

#[async_trait]
impl Transport for FakeTransport {
    async fn probe(&self, host: &str, port: u16, _timeout: Duration) -> bool {
        self.calls.lock().unwrap().push(format!("probe {}:{}", host, port));
        self.reachable.load(Ordering::SeqCst)
    }

    async fn get(&self, record: &ServiceRecord, path: &str) -> Reply {
        self.reply(record, path)
    }

    async fn post_command(&self, record: &ServiceRecord, path: &str, envelope: &CommandEnvelope) -> Reply {
        self.commands.lock().unwrap().push(envelope.clone());
        self.reply(record, path)
    }
}
