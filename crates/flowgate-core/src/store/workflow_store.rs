use chrono::Utc;
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::workflow::WorkflowDefinition;

/// Published workflow definitions, stored as JSON documents.
#[derive(Clone)]
pub struct WorkflowStore {
    db: Database,
}

impl WorkflowStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn save(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        let body = serde_json::to_string(definition)
            .map_err(|e| EngineError::Storage(format!("Failed to encode workflow: {}", e)))?;
        let id = definition.id.clone();
        let name = definition.name.clone();
        let now = Utc::now().timestamp_millis();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_definitions (id, name, definition, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       definition = excluded.definition,
                       updated_at = excluded.updated_at",
                    rusqlite::params![id, name, body, now],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowDefinition>, EngineError> {
        let id = id.to_string();
        let body: Option<String> = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT definition FROM workflow_definitions WHERE id = ?1",
                    rusqlite::params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|b| decode(&b)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let bodies: Vec<String> = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn
                    .prepare("SELECT definition FROM workflow_definitions ORDER BY created_at ASC")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        bodies.iter().map(|b| decode(b)).collect()
    }
}

fn decode(body: &str) -> Result<WorkflowDefinition, EngineError> {
    serde_json::from_str(body)
        .map_err(|e| EngineError::Storage(format!("Corrupt workflow definition: {}", e)))
}
