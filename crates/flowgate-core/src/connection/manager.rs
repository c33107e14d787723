//! ConnectionManager — lifecycle and request routing for tool servers.
//!
//! Each server lives behind its own async mutex; lifecycle transitions take
//! that lock only long enough to move between states, so status reads never
//! wait on network I/O. `connecting` acts as the exclusive marker: while a
//! server is in it, every other lifecycle operation on that server is
//! rejected with `ConcurrentOperation`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;

use crate::config::ConnectionConfig;
use crate::error::EngineError;
use crate::models::tool_server::{
    ConnectionState, RegisterServerInput, ToolDescriptor, ToolServer, ToolServerConfig,
    UpdateServerInput,
};
use crate::protocol;
use crate::registry::ToolRegistry;
use crate::store::Storage;
use crate::transport::TransportFactory;

use super::session::ServerSession;

pub(crate) struct ServerEntry {
    config: ToolServerConfig,
    state: ConnectionState,
    session: Option<Arc<ServerSession>>,
    declared_capabilities: Vec<String>,
    last_health_check_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_health_failures: u32,
}

impl ServerEntry {
    fn new(config: ToolServerConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Registered,
            session: None,
            declared_capabilities: Vec::new(),
            last_health_check_at: None,
            last_error: None,
            consecutive_health_failures: 0,
        }
    }

    fn snapshot(&self) -> ToolServer {
        ToolServer {
            server_id: self.config.id.clone(),
            name: self.config.name.clone(),
            transport_kind: self.config.transport_kind(),
            launch_spec: self.config.launch_spec.clone(),
            declared_capabilities: self.declared_capabilities.clone(),
            connection_state: self.state,
            last_health_check_at: self.last_health_check_at,
            last_error: self.last_error.clone(),
            consecutive_health_failures: self.consecutive_health_failures,
        }
    }

    /// Detach the live session, if any, leaving the entry in `next`.
    fn detach(&mut self, next: ConnectionState) -> Option<Arc<ServerSession>> {
        self.state = next;
        self.session.take()
    }
}

type Entry = Arc<Mutex<ServerEntry>>;

/// An in-progress connect. Dropped before `settle`, it moves the entry from
/// `connecting` to `error` so the server never stays stuck.
struct ConnectAttempt {
    entry: Option<Entry>,
    server_id: String,
}

impl ConnectAttempt {
    fn new(entry: &Entry, server_id: &str) -> Self {
        Self {
            entry: Some(entry.clone()),
            server_id: server_id.to_string(),
        }
    }

    fn settle(mut self) {
        self.entry = None;
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        let Some(entry) = self.entry.take() else { return };
        tracing::warn!("[ConnectionManager] Connect {} cancelled", self.server_id);
        match entry.try_lock() {
            Ok(mut e) => abandon_connect(&mut e),
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let entry = Arc::clone(&entry);
                    handle.spawn(async move {
                        let mut e = entry.lock().await;
                        abandon_connect(&mut e);
                    });
                }
            }
        };
    }
}

fn abandon_connect(e: &mut ServerEntry) {
    if e.state == ConnectionState::Connecting {
        e.state = ConnectionState::Error;
        e.last_error = Some("connect cancelled".to_string());
    }
}

pub struct ConnectionManager {
    servers: RwLock<HashMap<String, Entry>>,
    storage: Arc<dyn Storage>,
    registry: Arc<ToolRegistry>,
    transports: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
}

impl ConnectionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<ToolRegistry>,
        transports: Arc<dyn TransportFactory>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            storage,
            registry,
            transports,
            config,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    async fn entry(&self, server_id: &str) -> Result<Entry, EngineError> {
        self.servers
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Tool server {}", server_id)))
    }

    // ─── Registration ───────────────────────────────────────────────────

    /// Validate and persist a new server. It starts `registered`; nothing connects.
    pub async fn register_server(&self, input: RegisterServerInput) -> Result<String, EngineError> {
        let launch_spec = input.launch_spec()?;
        let now = Utc::now();
        let config = ToolServerConfig {
            id: uuid::Uuid::new_v4().to_string(),
            name: input.name.trim().to_string(),
            launch_spec,
            created_at: now,
            updated_at: now,
        };
        self.storage.upsert_tool_server_config(&config).await?;

        let id = config.id.clone();
        tracing::info!(
            "[ConnectionManager] Registered {} ({}, {})",
            config.name,
            id,
            config.transport_kind()
        );
        self.servers
            .write()
            .await
            .insert(id.clone(), Arc::new(Mutex::new(ServerEntry::new(config))));
        Ok(id)
    }

    /// Restore persisted configs. Already-known servers are left untouched.
    pub async fn load_from_storage(&self) -> Result<usize, EngineError> {
        let configs = self.storage.load_tool_server_configs().await?;
        let mut servers = self.servers.write().await;
        let mut restored = 0;
        for config in configs {
            if !servers.contains_key(&config.id) {
                servers.insert(config.id.clone(), Arc::new(Mutex::new(ServerEntry::new(config))));
                restored += 1;
            }
        }
        tracing::info!("[ConnectionManager] Restored {} server config(s)", restored);
        Ok(restored)
    }

    /// Rename or relaunch a server. A live session is torn down first; the
    /// server comes back `disconnected` and must be reconnected explicitly.
    pub async fn update_server(
        &self,
        server_id: &str,
        input: UpdateServerInput,
    ) -> Result<ToolServer, EngineError> {
        let entry = self.entry(server_id).await?;
        let (snapshot, session) = {
            let mut e = entry.lock().await;
            if e.state == ConnectionState::Connecting {
                return Err(EngineError::ConcurrentOperation(format!(
                    "{} is connecting; update rejected",
                    server_id
                )));
            }

            let mut next = e.config.clone();
            if let Some(name) = input.name {
                if name.trim().is_empty() {
                    return Err(EngineError::Validation("Server name must not be empty".to_string()));
                }
                next.name = name.trim().to_string();
            }
            if let Some(spec) = input.launch_spec {
                validate_launch_spec(&spec)?;
                next.launch_spec = spec;
            }
            next.updated_at = Utc::now();
            self.storage.upsert_tool_server_config(&next).await?;
            e.config = next;

            let session = match e.state {
                ConnectionState::Connected | ConnectionState::Error => {
                    e.detach(ConnectionState::Disconnected)
                }
                _ => None,
            };
            (e.snapshot(), session)
        };

        if let Some(session) = session {
            self.registry.mark_stale(server_id);
            session.close("server updated").await;
        }
        tracing::info!("[ConnectionManager] Updated {}", server_id);
        Ok(snapshot)
    }

    /// Tear down and forget a server, including its persisted config and tools.
    pub async fn remove_server(&self, server_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(server_id).await?;
        let session = {
            let mut e = entry.lock().await;
            if e.state == ConnectionState::Connecting {
                return Err(EngineError::ConcurrentOperation(format!(
                    "{} is connecting; remove rejected",
                    server_id
                )));
            }
            self.storage.delete_tool_server_config(server_id).await?;
            e.detach(ConnectionState::Disconnected)
        };

        self.servers.write().await.remove(server_id);
        self.registry.remove_server(server_id);
        if let Some(session) = session {
            session.close("server removed").await;
        }
        tracing::info!("[ConnectionManager] Removed {}", server_id);
        Ok(())
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────

    /// Open a session, handshake and discover tools. Failure leaves the server
    /// in `error` with `last_error` set; nothing is retried here.
    pub async fn connect_server(&self, server_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(server_id).await?;
        let (name, spec) = {
            let mut e = entry.lock().await;
            match e.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(EngineError::ConcurrentOperation(format!(
                        "{} is already connecting",
                        server_id
                    )))
                }
                _ => {}
            }
            e.state = ConnectionState::Connecting;
            (e.config.name.clone(), e.config.launch_spec.clone())
        };
        let attempt = ConnectAttempt::new(&entry, server_id);

        tracing::info!("[ConnectionManager] Connecting {} ({})", name, server_id);
        match self.establish(&name, &spec).await {
            Ok((session, tools)) => {
                let capabilities: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
                {
                    let mut e = entry.lock().await;
                    self.registry.register_tools(server_id, tools);
                    e.state = ConnectionState::Connected;
                    e.session = Some(session.clone());
                    e.declared_capabilities = capabilities;
                    e.last_error = None;
                    e.consecutive_health_failures = 0;
                }
                attempt.settle();
                self.watch_session(server_id, entry, session);
                tracing::info!("[ConnectionManager] Connected {} ({})", name, server_id);
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                {
                    let mut e = entry.lock().await;
                    e.state = ConnectionState::Error;
                    e.last_error = Some(message.clone());
                }
                attempt.settle();
                tracing::warn!("[ConnectionManager] Connect {} failed: {}", server_id, message);
                Err(EngineError::Connection(format!("{}: {}", name, message)))
            }
        }
    }

    async fn establish(
        &self,
        name: &str,
        spec: &crate::models::tool_server::LaunchSpec,
    ) -> Result<(Arc<ServerSession>, Vec<ToolDescriptor>), EngineError> {
        let opened = self.transports.open(name, spec).await?;
        let session = ServerSession::start(name, opened);
        let timeout = self.config.connect_timeout();

        let handshake = async {
            session
                .request(protocol::METHOD_INITIALIZE, protocol::initialize_params(), timeout)
                .await?;
            session.notify(protocol::METHOD_INITIALIZED).await?;
            let listing = session
                .request(protocol::METHOD_TOOLS_LIST, serde_json::json!({}), timeout)
                .await?;
            Ok::<_, EngineError>(protocol::parse_tools(&listing))
        };

        match handshake.await {
            Ok(tools) => Ok((session, tools)),
            Err(err) => {
                session.close("handshake failed").await;
                Err(err)
            }
        }
    }

    /// Move the server to `disconnected` if its session dies underneath us.
    /// A session that was already detached (explicit teardown) is ignored.
    fn watch_session(&self, server_id: &str, entry: Entry, session: Arc<ServerSession>) {
        let registry = self.registry.clone();
        let server_id = server_id.to_string();
        let closed = session.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            let mut e = entry.lock().await;
            let current = e.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, &session));
            if current {
                e.detach(ConnectionState::Disconnected);
                e.last_error = Some("transport session lost".to_string());
                drop(e);
                registry.mark_stale(&server_id);
                tracing::warn!("[ConnectionManager] Lost session for {}", server_id);
            }
        });
    }

    /// Idempotent teardown: pending requests fail with `ConnectionClosed` and
    /// the server's tools are kept but marked stale.
    pub async fn disconnect_server(&self, server_id: &str) -> Result<(), EngineError> {
        let entry = self.entry(server_id).await?;
        let session = {
            let mut e = entry.lock().await;
            match e.state {
                ConnectionState::Registered | ConnectionState::Disconnected => return Ok(()),
                ConnectionState::Connecting => {
                    return Err(EngineError::ConcurrentOperation(format!(
                        "{} is connecting; disconnect rejected",
                        server_id
                    )))
                }
                ConnectionState::Connected | ConnectionState::Error => {
                    e.detach(ConnectionState::Disconnected)
                }
            }
        };

        self.registry.mark_stale(server_id);
        if let Some(session) = session {
            session.close("disconnected").await;
        }
        tracing::info!("[ConnectionManager] Disconnected {}", server_id);
        Ok(())
    }

    /// Disconnect everything; used at shutdown.
    pub async fn disconnect_all(&self) {
        let ids: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.disconnect_server(&id).await {
                tracing::warn!("[ConnectionManager] Shutdown disconnect {}: {}", id, e);
            }
        }
    }

    // ─── Requests ───────────────────────────────────────────────────────

    async fn live_session(&self, server_id: &str) -> Result<Arc<ServerSession>, EngineError> {
        let entry = self.entry(server_id).await?;
        let e = entry.lock().await;
        match (&e.state, &e.session) {
            (ConnectionState::Connected, Some(session)) => Ok(session.clone()),
            (state, _) => Err(EngineError::NotConnected(format!(
                "{} is {}",
                server_id,
                state.as_str()
            ))),
        }
    }

    /// Issue one request and wait for its answer, timeout or connection loss.
    pub async fn send_request(
        &self,
        server_id: &str,
        method: &str,
        params: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, EngineError> {
        let session = self.live_session(server_id).await?;
        session
            .request(method, params, timeout.unwrap_or_else(|| self.config.request_timeout()))
            .await
    }

    /// `tools/call` wrapper; `isError: true` answers become `Remote` errors.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<serde_json::Value, EngineError> {
        let result = self
            .send_request(
                server_id,
                protocol::METHOD_TOOLS_CALL,
                serde_json::json!({ "name": tool, "arguments": arguments }),
                timeout,
            )
            .await?;
        match protocol::tool_call_error(&result) {
            Some(message) => Err(EngineError::Remote {
                code: protocol::TOOL_ERROR_CODE,
                message,
            }),
            None => Ok(result),
        }
    }

    /// First connected owner of `tool`, by server id.
    pub async fn find_tool_owner(&self, tool: &str) -> Result<String, EngineError> {
        for owner in self.registry.owners(tool) {
            if let Ok(entry) = self.entry(&owner).await {
                if entry.lock().await.state == ConnectionState::Connected {
                    return Ok(owner);
                }
            }
        }
        Err(EngineError::NotConnected(format!(
            "No connected server offers tool '{}'",
            tool
        )))
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub async fn get_server_status(&self, server_id: &str) -> Result<ToolServer, EngineError> {
        let entry = self.entry(server_id).await?;
        let snapshot = entry.lock().await.snapshot();
        Ok(snapshot)
    }

    /// Snapshot of every server, oldest registration first.
    pub async fn list_server_statuses(&self) -> Vec<ToolServer> {
        let entries: Vec<Entry> = self.servers.read().await.values().cloned().collect();
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries {
            let e = entry.lock().await;
            rows.push((e.config.created_at, e.snapshot()));
        }
        rows.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.server_id.cmp(&b.1.server_id)));
        rows.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, EngineError> {
        self.entry(server_id).await?;
        Ok(self.registry.list_tools(server_id))
    }

    pub fn list_all_tools(&self, include_stale: bool) -> BTreeMap<String, BTreeSet<String>> {
        self.registry.list_all_tools(include_stale)
    }

    // ─── Health ─────────────────────────────────────────────────────────

    /// Probe every connected server once. A server that misses
    /// `health_failure_threshold` probes in a row is moved to `error` and torn
    /// down; it stays there until someone calls `connect_server`.
    pub async fn run_health_checks(&self) {
        let entries: Vec<(String, Entry)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();

        let mut probes = JoinSet::new();
        for (server_id, entry) in entries {
            let session = {
                let e = entry.lock().await;
                match (&e.state, &e.session) {
                    (ConnectionState::Connected, Some(s)) => s.clone(),
                    _ => continue,
                }
            };
            let method = self.config.liveness_method.clone();
            let timeout = self.config.health_check_timeout();
            probes.spawn(async move {
                let result = session.request(&method, serde_json::json!({}), timeout).await;
                (server_id, entry, session, result)
            });
        }

        while let Some(joined) = probes.join_next().await {
            let (server_id, entry, session, result) = match joined {
                Ok(probe) => probe,
                Err(e) => {
                    tracing::error!("[HealthMonitor] Probe task failed: {}", e);
                    continue;
                }
            };
            self.record_probe(&server_id, &entry, &session, result).await;
        }
    }

    async fn record_probe(
        &self,
        server_id: &str,
        entry: &Entry,
        session: &Arc<ServerSession>,
        result: Result<serde_json::Value, EngineError>,
    ) {
        let dead_session = {
            let mut e = entry.lock().await;
            let current = e.session.as_ref().is_some_and(|s| Arc::ptr_eq(s, session));
            if !current {
                return;
            }
            e.last_health_check_at = Some(Utc::now());
            match result {
                // The server answered, even if it does not know the method.
                Ok(_) | Err(EngineError::Remote { .. }) => {
                    e.consecutive_health_failures = 0;
                    None
                }
                Err(err) => {
                    e.consecutive_health_failures += 1;
                    tracing::warn!(
                        "[HealthMonitor] {} probe failed ({}/{}): {}",
                        server_id,
                        e.consecutive_health_failures,
                        self.config.health_failure_threshold,
                        err
                    );
                    if e.consecutive_health_failures >= self.config.health_failure_threshold {
                        e.last_error = Some(format!("Health check failed: {}", err));
                        e.detach(ConnectionState::Error)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(session) = dead_session {
            tracing::warn!("[HealthMonitor] {} marked unhealthy; disconnecting", server_id);
            self.registry.mark_stale(server_id);
            session.close("health check threshold reached").await;
        }
    }
}

fn validate_launch_spec(spec: &crate::models::tool_server::LaunchSpec) -> Result<(), EngineError> {
    use crate::models::tool_server::LaunchSpec;
    match spec {
        LaunchSpec::LocalProcess { command, .. } if command.trim().is_empty() => Err(
            EngineError::Validation("local-process servers require a launch command".to_string()),
        ),
        LaunchSpec::RemoteEndpoint { url, .. }
            if !(url.starts_with("http://") || url.starts_with("https://")) =>
        {
            Err(EngineError::Validation(format!(
                "remote-endpoint URL must be http(s): {}",
                url
            )))
        }
        _ => Ok(()),
    }
}
