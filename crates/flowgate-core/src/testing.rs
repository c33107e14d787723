//! Scripted collaborators for unit tests: a transport factory whose
//! "servers" answer from a closure, and an agent executor driven by the
//! step config.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::tool_server::LaunchSpec;
use crate::store::SqliteStorage;
use crate::transport::{OpenedSession, TransportError, TransportFactory, TransportSession};
use crate::workflow::agent::{AgentContext, AgentExecutor};

/// How a scripted server answers one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Result(serde_json::Value),
    Error(i64, String),
    /// Never answer.
    Silent,
    Delayed(Duration, Box<Reply>),
}

type Handler = dyn Fn(&str, &serde_json::Value) -> Reply + Send + Sync;

pub(crate) struct ScriptedTransportFactory {
    handler: Arc<Handler>,
    sessions: Mutex<HashMap<String, CancellationToken>>,
    calls: Arc<Mutex<Vec<String>>>,
    refuse_open: AtomicBool,
    opened: AtomicUsize,
}

impl ScriptedTransportFactory {
    pub fn new(
        handler: impl Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Arc::new(handler),
            sessions: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
            refuse_open: AtomicBool::new(false),
            opened: AtomicUsize::new(0),
        })
    }

    /// A well-behaved tool server offering `tools`; `tools/call` is answered by `call`.
    pub fn mcp(
        tools: &[&str],
        call: impl Fn(&str, &serde_json::Value) -> Reply + Send + Sync + 'static,
    ) -> Arc<Self> {
        let listing: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| serde_json::json!({"name": t, "description": format!("{} tool", t), "inputSchema": {"type": "object"}}))
            .collect();
        Self::new(move |method, params| match method {
            "initialize" => Reply::Result(serde_json::json!({
                "protocolVersion": crate::protocol::PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "0.0.0"}
            })),
            "tools/list" => Reply::Result(serde_json::json!({ "tools": listing })),
            "ping" => Reply::Result(serde_json::json!({})),
            "tools/call" => {
                let name = params["name"].as_str().unwrap_or_default();
                call(name, &params["arguments"])
            }
            other => Reply::Error(-32601, format!("Method not found: {}", other)),
        })
    }

    /// Simulate the server process exiting.
    pub fn kill(&self, server_name: &str) {
        if let Some(token) = self.sessions.lock().unwrap().get(server_name) {
            token.cancel();
        }
    }

    pub fn refuse_open(&self, refuse: bool) {
        self.refuse_open.store(refuse, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of requests received with `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|m| *m == method).count()
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn open(
        &self,
        server_name: &str,
        spec: &LaunchSpec,
    ) -> Result<OpenedSession, TransportError> {
        if self.refuse_open.load(Ordering::SeqCst) {
            return Err(TransportError::Process(format!("{} refused to start", server_name)));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);

        let killed = CancellationToken::new();
        self.sessions
            .lock()
            .unwrap()
            .insert(server_name.to_string(), killed.clone());

        let remote = matches!(spec, LaunchSpec::RemoteEndpoint { .. });
        let (replies_tx, mut replies_rx) = mpsc::channel::<String>(64);
        let inbound = if remote {
            None
        } else {
            let (out_tx, out_rx) = mpsc::channel(64);
            let killed = killed.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = killed.cancelled() => break,
                        frame = replies_rx.recv() => match frame {
                            Some(frame) => {
                                if out_tx.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
            });
            Some(out_rx)
        };

        let session = ScriptedSession {
            remote,
            handler: self.handler.clone(),
            calls: self.calls.clone(),
            replies: replies_tx,
            killed,
        };
        Ok(OpenedSession {
            session: Arc::new(session),
            inbound,
        })
    }
}

struct ScriptedSession {
    remote: bool,
    handler: Arc<Handler>,
    calls: Arc<Mutex<Vec<String>>>,
    replies: mpsc::Sender<String>,
    killed: CancellationToken,
}

async fn render(id: serde_json::Value, mut reply: Reply) -> Option<String> {
    loop {
        match reply {
            Reply::Delayed(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
            }
            Reply::Silent => return None,
            Reply::Result(result) => {
                return Some(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
            }
            Reply::Error(code, message) => {
                return Some(
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                        .to_string(),
                )
            }
        }
    }
}

#[async_trait]
impl TransportSession for ScriptedSession {
    async fn send(&self, frame: String) -> Result<Option<String>, TransportError> {
        if self.killed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let msg: serde_json::Value = serde_json::from_str(&frame)?;
        let method = msg["method"].as_str().unwrap_or_default().to_string();
        self.calls.lock().unwrap().push(method.clone());

        let id = msg.get("id").cloned().filter(|v| !v.is_null());
        let Some(id) = id else {
            return Ok(None);
        };
        let reply = (self.handler)(&method, &msg["params"]);

        if self.remote {
            return match render(id, reply).await {
                Some(frame) => Ok(Some(frame)),
                None => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            };
        }

        let replies = self.replies.clone();
        tokio::spawn(async move {
            if let Some(frame) = render(id, reply).await {
                let _ = replies.send(frame).await;
            }
        });
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.killed.cancel();
        Ok(())
    }
}

// ─── Agent executor ────────────────────────────────────────────────────────

/// Answers from the step config:
/// - `delay_ms`: sleep before answering
/// - `fail`: permanent `Agent` error with this message
/// - `flaky`: fail with a transient `Transport` error this many times first
/// - `output`: value to return (defaults to `{"step": <id>}`)
/// - `panic`: panic with this message instead of answering
#[derive(Default)]
pub(crate) struct ScriptedAgent {
    started: Mutex<Vec<String>>,
    attempts: Mutex<HashMap<String, u64>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    contexts: Mutex<Vec<AgentContext>>,
}

impl ScriptedAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn contexts(&self) -> Vec<AgentContext> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    async fn invoke_agent(
        &self,
        config: &serde_json::Value,
        context: &AgentContext,
    ) -> Result<serde_json::Value, EngineError> {
        self.started.lock().unwrap().push(context.step_id.clone());
        self.contexts.lock().unwrap().push(context.clone());
        if let Some(message) = config["panic"].as_str() {
            panic!("{}", message);
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = config["delay_ms"].as_u64() {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(context.step_id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(flaky) = config["flaky"].as_u64() {
            if attempt <= flaky {
                return Err(EngineError::Transport(format!("flaky attempt {}", attempt)));
            }
        }
        if let Some(message) = config["fail"].as_str() {
            return Err(EngineError::Agent(message.to_string()));
        }
        Ok(config
            .get("output")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "step": context.step_id })))
    }
}

pub(crate) fn memory_storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()))
}
