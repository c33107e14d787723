//! SQLite database layer for the flowgate engine.
//!
//! Uses rusqlite with WAL mode for concurrent read performance.
//! All database operations are executed via `tokio::task::spawn_blocking`
//! to avoid blocking the async runtime.

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::EngineError;

/// Thread-safe handle to the SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a SQLite database at the given path.
    pub fn open(db_path: &str) -> Result<Self, EngineError> {
        if db_path == ":memory:" {
            return Self::open_in_memory();
        }

        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(db_path)
            .map_err(|e| EngineError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;

        tracing::info!("SQLite database opened at: {}", db_path);
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EngineError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| EngineError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_tables()?;
        Ok(db)
    }

    /// Execute a closure with access to the database connection.
    /// Automatically handles locking and error conversion.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EngineError::Storage(format!("Lock poisoned: {}", e)))?;
        f(&conn).map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Execute a closure with access to the database connection (async-friendly).
    pub async fn with_conn_async<F, T>(&self, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| EngineError::Storage(format!("Task join error: {}", e)))?
    }

    /// Create all tables if they don't exist.
    fn initialize_tables(&self) -> Result<(), EngineError> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tool_servers (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    transport       TEXT NOT NULL,
                    launch_spec     TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_definitions (
                    id              TEXT PRIMARY KEY,
                    name            TEXT NOT NULL,
                    definition      TEXT NOT NULL,
                    created_at      INTEGER NOT NULL,
                    updated_at      INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_executions (
                    id              TEXT PRIMARY KEY,
                    workflow_id     TEXT NOT NULL,
                    status          TEXT NOT NULL DEFAULT 'pending',
                    input_data      TEXT NOT NULL DEFAULT 'null',
                    session_id      TEXT,
                    user_id         TEXT,
                    request_key     TEXT UNIQUE,
                    error           TEXT,
                    created_at      INTEGER NOT NULL,
                    started_at      INTEGER,
                    completed_at    INTEGER
                );
                CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id);
                CREATE INDEX IF NOT EXISTS idx_executions_status ON workflow_executions(status);

                CREATE TABLE IF NOT EXISTS step_outcomes (
                    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id    TEXT NOT NULL REFERENCES workflow_executions(id) ON DELETE CASCADE,
                    step_id         TEXT NOT NULL,
                    status          TEXT NOT NULL,
                    output          TEXT NOT NULL DEFAULT 'null',
                    error           TEXT,
                    attempt         INTEGER NOT NULL DEFAULT 1,
                    started_at      INTEGER NOT NULL,
                    finished_at     INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_step_outcomes_execution ON step_outcomes(execution_id);
                "
            )
        })
    }
}
