pub mod execution_store;
pub mod tool_server_store;
pub mod workflow_store;

pub use execution_store::ExecutionStore;
pub use tool_server_store::ToolServerStore;
pub use workflow_store::WorkflowStore;

use async_trait::async_trait;

use crate::db::Database;
use crate::error::EngineError;
use crate::models::execution::{ExecutionFilter, StepOutcome, WorkflowExecution};
use crate::models::tool_server::ToolServerConfig;
use crate::models::workflow::WorkflowDefinition;

/// Durable storage consumed by the connection manager and the workflow engine.
///
/// Every write either succeeds durably or fails with `EngineError::Storage`.
#[async_trait]
pub trait Storage: Send + Sync {
    // ─── Workflow definitions ───────────────────────────────────────────
    async fn load_workflow_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, EngineError>;
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError>;
    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError>;

    // ─── Executions ─────────────────────────────────────────────────────
    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError>;
    async fn load_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, EngineError>;
    async fn append_step_outcome(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<(), EngineError>;
    async fn load_step_outcomes(&self, execution_id: &str)
        -> Result<Vec<StepOutcome>, EngineError>;
    async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, EngineError>;
    async fn find_execution_by_request_key(
        &self,
        request_key: &str,
    ) -> Result<Option<String>, EngineError>;

    // ─── Tool servers ───────────────────────────────────────────────────
    async fn load_tool_server_configs(&self) -> Result<Vec<ToolServerConfig>, EngineError>;
    async fn upsert_tool_server_config(&self, config: &ToolServerConfig)
        -> Result<(), EngineError>;
    async fn delete_tool_server_config(&self, server_id: &str) -> Result<bool, EngineError>;
}

/// `Storage` backed by the SQLite `Database`.
#[derive(Clone)]
pub struct SqliteStorage {
    pub tool_servers: ToolServerStore,
    pub workflows: WorkflowStore,
    pub executions: ExecutionStore,
}

impl SqliteStorage {
    pub fn new(db: Database) -> Self {
        Self {
            tool_servers: ToolServerStore::new(db.clone()),
            workflows: WorkflowStore::new(db.clone()),
            executions: ExecutionStore::new(db),
        }
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn load_workflow_definition(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowDefinition>, EngineError> {
        self.workflows.get(workflow_id).await
    }

    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), EngineError> {
        self.workflows.save(definition).await
    }

    async fn list_workflow_definitions(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        self.workflows.list().await
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), EngineError> {
        self.executions.save(execution).await
    }

    async fn load_execution(
        &self,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, EngineError> {
        self.executions.get(execution_id).await
    }

    async fn append_step_outcome(
        &self,
        execution_id: &str,
        outcome: &StepOutcome,
    ) -> Result<(), EngineError> {
        self.executions.append_outcome(execution_id, outcome).await
    }

    async fn load_step_outcomes(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepOutcome>, EngineError> {
        self.executions.list_outcomes(execution_id).await
    }

    async fn query_executions(
        &self,
        filter: &ExecutionFilter,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        self.executions.query(filter).await
    }

    async fn find_execution_by_request_key(
        &self,
        request_key: &str,
    ) -> Result<Option<String>, EngineError> {
        self.executions.find_by_request_key(request_key).await
    }

    async fn load_tool_server_configs(&self) -> Result<Vec<ToolServerConfig>, EngineError> {
        self.tool_servers.list().await
    }

    async fn upsert_tool_server_config(
        &self,
        config: &ToolServerConfig,
    ) -> Result<(), EngineError> {
        self.tool_servers.upsert(config).await
    }

    async fn delete_tool_server_config(&self, server_id: &str) -> Result<bool, EngineError> {
        self.tool_servers.delete(server_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::execution::{ExecutionStatus, StepStatus};
    use crate::models::tool_server::LaunchSpec;
    use chrono::Utc;
    use std::collections::HashMap;

    fn storage() -> SqliteStorage {
        SqliteStorage::new(Database::open_in_memory().unwrap())
    }

    fn execution(id: &str, workflow_id: &str) -> WorkflowExecution {
        WorkflowExecution::new(
            id.to_string(),
            workflow_id.to_string(),
            serde_json::json!({"issue": 7}),
            Some("sess-1".to_string()),
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_tool_server_config_crud() {
        let storage = storage();
        let now = Utc::now();
        let config = ToolServerConfig {
            id: "srv-1".to_string(),
            name: "files".to_string(),
            launch_spec: LaunchSpec::LocalProcess {
                command: "fs-tool".to_string(),
                args: vec!["--root".to_string(), "/tmp".to_string()],
                env: HashMap::from([("LOG".to_string(), "1".to_string())]),
                cwd: None,
            },
            created_at: now,
            updated_at: now,
        };
        storage.upsert_tool_server_config(&config).await.unwrap();

        let mut renamed = config.clone();
        renamed.name = "files-v2".to_string();
        storage.upsert_tool_server_config(&renamed).await.unwrap();

        let all = storage.load_tool_server_configs().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "files-v2");
        assert_eq!(all[0].launch_spec, config.launch_spec);

        assert!(storage.delete_tool_server_config("srv-1").await.unwrap());
        assert!(!storage.delete_tool_server_config("srv-1").await.unwrap());
        assert!(storage.load_tool_server_configs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outcomes_keep_append_order_and_fold_latest_attempt() {
        let storage = storage();
        let exec = execution("exec-1", "wf-1");
        storage.save_execution(&exec).await.unwrap();

        let t = Utc::now();
        storage
            .append_step_outcome("exec-1", &StepOutcome::success("zeta", serde_json::json!(1), t, 1))
            .await
            .unwrap();
        storage
            .append_step_outcome("exec-1", &StepOutcome::failure("alpha", "Timeout: slow", t, 1))
            .await
            .unwrap();
        storage
            .append_step_outcome("exec-1", &StepOutcome::success("alpha", serde_json::json!("ok"), t, 2))
            .await
            .unwrap();

        let history = storage.load_step_outcomes("exec-1").await.unwrap();
        let order: Vec<(&str, u32)> =
            history.iter().map(|o| (o.step_id.as_str(), o.attempt)).collect();
        assert_eq!(order, vec![("zeta", 1), ("alpha", 1), ("alpha", 2)]);

        let loaded = storage.load_execution("exec-1").await.unwrap().unwrap();
        let keys: Vec<&str> = loaded.step_results.keys().map(String::as_str).collect();
        assert_eq!(keys, ["zeta", "alpha"]);
        assert_eq!(loaded.step_results["alpha"].status, StepStatus::Success);
        assert_eq!(loaded.step_results["alpha"].attempt, 2);
        assert_eq!(loaded.input_data["issue"], 7);
        assert_eq!(loaded.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn test_query_filters_and_limit() {
        let storage = storage();
        for (id, wf, status) in [
            ("e1", "wf-a", ExecutionStatus::Completed),
            ("e2", "wf-a", ExecutionStatus::Failed),
            ("e3", "wf-b", ExecutionStatus::Completed),
            ("e4", "wf-a", ExecutionStatus::Completed),
        ] {
            let mut exec = execution(id, wf);
            exec.status = status;
            storage.save_execution(&exec).await.unwrap();
        }

        let wf_a = storage
            .query_executions(&ExecutionFilter {
                workflow_id: Some("wf-a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(wf_a.len(), 3);

        let completed_a = storage
            .query_executions(&ExecutionFilter {
                workflow_id: Some("wf-a".to_string()),
                status: Some(ExecutionStatus::Completed),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(completed_a.len(), 2);
        assert!(completed_a.iter().all(|e| e.status == ExecutionStatus::Completed));

        let limited = storage
            .query_executions(&ExecutionFilter { limit: Some(2), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_request_key_lookup_and_status_update() {
        let storage = storage();
        let mut exec = execution("exec-k", "wf-1");
        exec.request_key = Some("req-42".to_string());
        storage.save_execution(&exec).await.unwrap();

        assert_eq!(
            storage.find_execution_by_request_key("req-42").await.unwrap().as_deref(),
            Some("exec-k")
        );
        assert!(storage.find_execution_by_request_key("nope").await.unwrap().is_none());

        exec.status = ExecutionStatus::Running;
        exec.started_at = Some(Utc::now());
        storage.save_execution(&exec).await.unwrap();
        let loaded = storage.load_execution("exec-k").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Running);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_none());
    }
}
