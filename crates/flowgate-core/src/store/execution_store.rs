use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::execution::{
    record_latest, ExecutionFilter, ExecutionStatus, StepOutcome, StepResults, StepStatus,
    WorkflowExecution,
};

/// Execution records plus their append-only step outcome log.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

const EXECUTION_COLUMNS: &str = "id, workflow_id, status, input_data, session_id, user_id, \
     request_key, error, created_at, started_at, completed_at";

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or update the execution row. Step results are not written here;
    /// they live in `step_outcomes`.
    pub async fn save(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        let e = execution.clone();
        let input = serde_json::to_string(&e.input_data).unwrap_or_else(|_| "null".to_string());
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions
                       (id, workflow_id, status, input_data, session_id, user_id, request_key,
                        error, created_at, started_at, completed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(id) DO UPDATE SET
                       status = excluded.status,
                       error = excluded.error,
                       started_at = excluded.started_at,
                       completed_at = excluded.completed_at",
                    rusqlite::params![
                        e.execution_id,
                        e.workflow_id,
                        e.status.as_str(),
                        input,
                        e.session_id,
                        e.user_id,
                        e.request_key,
                        e.error,
                        e.created_at.timestamp_millis(),
                        e.started_at.map(|t| t.timestamp_millis()),
                        e.completed_at.map(|t| t.timestamp_millis()),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkflowExecution>, EngineError> {
        let id_owned = id.to_string();
        let execution = self
            .db
            .with_conn_async(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM workflow_executions WHERE id = ?1", EXECUTION_COLUMNS),
                    rusqlite::params![id_owned],
                    |row| Ok(row_to_execution(row)),
                )
                .optional()
            })
            .await?;

        match execution {
            Some(mut execution) => {
                execution.step_results = fold_latest(self.list_outcomes(id).await?);
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }

    pub async fn find_by_request_key(&self, key: &str) -> Result<Option<String>, EngineError> {
        let key = key.to_string();
        self.db
            .with_conn_async(move |conn| {
                conn.query_row(
                    "SELECT id FROM workflow_executions WHERE request_key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await
    }

    pub async fn query(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let workflow_id = filter.workflow_id.clone();
        let status = filter.status.map(|s| s.as_str().to_string());
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);

        let executions = self
            .db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM workflow_executions
                     WHERE (?1 IS NULL OR workflow_id = ?1)
                       AND (?2 IS NULL OR status = ?2)
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT ?3",
                    EXECUTION_COLUMNS
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![workflow_id, status, limit], |row| {
                        Ok(row_to_execution(row))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = Vec::with_capacity(executions.len());
        for mut execution in executions {
            execution.step_results = fold_latest(self.list_outcomes(&execution.execution_id).await?);
            out.push(execution);
        }
        Ok(out)
    }

    pub async fn append_outcome(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<(), EngineError> {
        let execution_id = execution_id.to_string();
        let o = outcome.clone();
        let output = serde_json::to_string(&o.output).unwrap_or_else(|_| "null".to_string());
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO step_outcomes
                       (execution_id, step_id, status, output, error, attempt, started_at, finished_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        execution_id,
                        o.step_id,
                        o.status.as_str(),
                        output,
                        o.error,
                        o.attempt as i64,
                        o.started_at.timestamp_millis(),
                        o.finished_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// All outcomes of an execution in append order.
    pub async fn list_outcomes(&self, execution_id: &str) -> Result<Vec<StepOutcome>, EngineError> {
        let execution_id = execution_id.to_string();
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT step_id, status, output, error, attempt, started_at, finished_at
                     FROM step_outcomes WHERE execution_id = ?1 ORDER BY seq ASC",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![execution_id], |row| Ok(row_to_outcome(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

/// Later attempts supersede earlier ones.
pub(crate) fn fold_latest(outcomes: Vec<StepOutcome>) -> StepResults {
    let mut latest = StepResults::new();
    for outcome in outcomes {
        record_latest(&mut latest, outcome);
    }
    latest
}

// ─── helper ────────────────────────────────────────────────────────────────

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_execution(row: &rusqlite::Row<'_>) -> WorkflowExecution {
    let status: String = row.get(2).unwrap_or_default();
    let input: String = row.get(3).unwrap_or_else(|_| "null".to_string());
    let created_ms: i64 = row.get(8).unwrap_or(0);
    let started_ms: Option<i64> = row.get(9).unwrap_or(None);
    let completed_ms: Option<i64> = row.get(10).unwrap_or(None);

    WorkflowExecution {
        execution_id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        status: ExecutionStatus::from_str(&status).unwrap_or(ExecutionStatus::Failed),
        input_data: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
        session_id: row.get(4).unwrap_or(None),
        user_id: row.get(5).unwrap_or(None),
        request_key: row.get(6).unwrap_or(None),
        step_results: StepResults::new(),
        error: row.get(7).unwrap_or(None),
        created_at: millis(created_ms),
        started_at: started_ms.map(millis),
        completed_at: completed_ms.map(millis),
    }
}

fn row_to_outcome(row: &rusqlite::Row<'_>) -> StepOutcome {
    let status: String = row.get(1).unwrap_or_default();
    let output: String = row.get(2).unwrap_or_else(|_| "null".to_string());
    let attempt: i64 = row.get(4).unwrap_or(0);
    StepOutcome {
        step_id: row.get(0).unwrap_or_default(),
        status: StepStatus::from_str(&status),
        output: serde_json::from_str(&output).unwrap_or(serde_json::Value::Null),
        error: row.get(3).unwrap_or(None),
        attempt: attempt as u32,
        started_at: millis(row.get(5).unwrap_or(0)),
        finished_at: millis(row.get(6).unwrap_or(0)),
    }
}
