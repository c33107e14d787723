use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::tool_server::{LaunchSpec, ToolServerConfig};

#[derive(Clone)]
pub struct ToolServerStore {
    db: Database,
}

impl ToolServerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn upsert(&self, config: &ToolServerConfig) -> Result<(), EngineError> {
        let launch_spec = serde_json::to_string(&config.launch_spec)
            .map_err(|e| EngineError::Storage(format!("Failed to encode launch spec: {}", e)))?;
        let c = config.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO tool_servers (id, name, transport, launch_spec, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(id) DO UPDATE SET
                       name = excluded.name,
                       transport = excluded.transport,
                       launch_spec = excluded.launch_spec,
                       updated_at = excluded.updated_at",
                    rusqlite::params![
                        c.id,
                        c.name,
                        c.transport_kind().to_string(),
                        launch_spec,
                        c.created_at.timestamp_millis(),
                        c.updated_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ToolServerConfig>, EngineError> {
        let id = id.to_string();
        let row = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id, name, launch_spec, created_at, updated_at
                     FROM tool_servers WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_raw,
                )
                .optional()
            })
            .await?;
        row.map(RawServerRow::into_config).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ToolServerConfig>, EngineError> {
        let rows = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, launch_spec, created_at, updated_at
                     FROM tool_servers ORDER BY created_at ASC",
                )?;
                let rows = stmt
                    .query_map([], row_to_raw)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(RawServerRow::into_config).collect()
    }

    pub async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let id = id.to_string();
        let rows = self
            .db
            .with_conn_async(move |conn| {
                conn.execute("DELETE FROM tool_servers WHERE id = ?1", rusqlite::params![id])
            })
            .await?;
        Ok(rows > 0)
    }
}

// ─── helper ────────────────────────────────────────────────────────────────

struct RawServerRow {
    id: String,
    name: String,
    launch_spec: String,
    created_ms: i64,
    updated_ms: i64,
}

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawServerRow> {
    Ok(RawServerRow {
        id: row.get(0)?,
        name: row.get(1)?,
        launch_spec: row.get(2)?,
        created_ms: row.get(3)?,
        updated_ms: row.get(4)?,
    })
}

impl RawServerRow {
    fn into_config(self) -> Result<ToolServerConfig, EngineError> {
        let launch_spec: LaunchSpec = serde_json::from_str(&self.launch_spec).map_err(|e| {
            EngineError::Storage(format!("Corrupt launch spec for server {}: {}", self.id, e))
        })?;
        Ok(ToolServerConfig {
            id: self.id,
            name: self.name,
            launch_spec,
            created_at: chrono::DateTime::from_timestamp_millis(self.created_ms).unwrap_or_default(),
            updated_at: chrono::DateTime::from_timestamp_millis(self.updated_ms).unwrap_or_default(),
        })
    }
}
