//! Shared engine state: one owner for the connection manager, tool registry
//! and workflow engine, with explicit start and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, HealthMonitor};
use crate::db::Database;
use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::store::{SqliteStorage, Storage};
use crate::transport::{DefaultTransportFactory, TransportFactory};
use crate::workflow::{AgentExecutor, StepDispatcher, UnconfiguredAgent, WorkflowEngine};

/// Shared state accessible by every front end (CLI, embedding hosts).
pub struct AppStateInner {
    pub db: Database,
    pub config: EngineConfig,
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<ToolRegistry>,
    pub connections: Arc<ConnectionManager>,
    pub workflows: WorkflowEngine,
    health: Mutex<Option<HealthMonitor>>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Real transports, no agent backend.
    pub fn new(db: Database, config: EngineConfig) -> Self {
        Self::with_collaborators(
            db,
            config,
            Arc::new(DefaultTransportFactory),
            Arc::new(UnconfiguredAgent),
        )
    }

    pub fn with_collaborators(
        db: Database,
        config: EngineConfig,
        transports: Arc<dyn TransportFactory>,
        agent: Arc<dyn AgentExecutor>,
    ) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(db.clone()));
        let registry = Arc::new(ToolRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            storage.clone(),
            registry.clone(),
            transports,
            config.connections.clone(),
        ));
        let dispatcher = Arc::new(StepDispatcher::new(
            connections.clone(),
            agent,
            config.scheduler.clone(),
        ));
        let workflows = WorkflowEngine::new(storage.clone(), dispatcher);
        Self {
            db,
            config,
            storage,
            registry,
            connections,
            workflows,
            health: Mutex::new(None),
        }
    }

    /// Restore registered tool servers and start the health loop.
    pub async fn start(&self) -> Result<(), EngineError> {
        let restored = self.connections.load_from_storage().await?;
        tracing::info!("[AppState] Restored {} tool server(s)", restored);

        let interval = self.config.connections.health_check_interval_secs;
        if interval > 0 {
            let mut health = self.health.lock().await;
            if health.is_none() {
                *health = Some(HealthMonitor::spawn(
                    self.connections.clone(),
                    Duration::from_secs(interval),
                ));
            }
        }
        Ok(())
    }

    /// Stop the health loop, drain running executions, then disconnect
    /// every server.
    pub async fn shutdown(&self) {
        if let Some(monitor) = self.health.lock().await.take() {
            monitor.stop().await;
        }
        self.workflows.shutdown().await;
        self.connections.disconnect_all().await;
        tracing::info!("[AppState] Shut down");
    }
}
