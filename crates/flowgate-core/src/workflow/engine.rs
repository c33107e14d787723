//! Workflow engine — publishes definitions and owns running executions.
//!
//! Every execution is owned by at most one scheduler task. Ownership is
//! taken at the `pending -> running` transition under the `runs` lock, so a
//! retried start (or a replayed `execute_workflow` with the same request
//! key) finds the existing owner instead of creating a second one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::EngineError;
use crate::models::execution::{ExecutionFilter, ExecutionStatus, StepOutcome, WorkflowExecution};
use crate::models::workflow::WorkflowDefinition;
use crate::store::Storage;

use super::dispatch::StepDispatcher;
use super::graph::StepGraph;
use super::history::ExecutionHistory;
use super::scheduler::{RunIdentity, Scheduler};

struct RunHandle {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

pub struct WorkflowEngine {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<StepDispatcher>,
    config: SchedulerConfig,
    runs: Arc<Mutex<HashMap<String, RunHandle>>>,
    /// Serialises request-key lookups with execution creation.
    admission: Mutex<()>,
}

impl WorkflowEngine {
    pub fn new(storage: Arc<dyn Storage>, dispatcher: Arc<StepDispatcher>) -> Self {
        let config = dispatcher.config().clone();
        Self {
            storage,
            dispatcher,
            config,
            runs: Arc::new(Mutex::new(HashMap::new())),
            admission: Mutex::new(()),
        }
    }

    // ─── Definitions ────────────────────────────────────────────────────

    /// Validate and store a definition. Publishing the same id again is only
    /// accepted when the definition is unchanged.
    pub async fn publish_workflow(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        definition.validate()?;
        if let Some(existing) = self.storage.load_workflow_definition(&definition.id).await? {
            if same_definition(&existing, definition) {
                return Ok(());
            }
            return Err(EngineError::Validation(format!(
                "Workflow '{}' is already published with different content",
                definition.id
            )));
        }
        self.storage.save_workflow_definition(definition).await?;
        tracing::info!(
            "[WorkflowEngine] Published workflow '{}' ({} steps)",
            definition.id,
            definition.steps.len()
        );
        Ok(())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, EngineError> {
        self.storage
            .load_workflow_definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {}", workflow_id)))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        self.storage.list_workflow_definitions().await
    }

    // ─── Execution lifecycle ────────────────────────────────────────────

    /// Create an execution of `workflow_id` and start it.
    ///
    /// With a `request_key`, a repeated call returns the execution created by
    /// the first one (starting it if it never left `pending`).
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: serde_json::Value,
        session_id: Option<String>,
        user_id: Option<String>,
        request_key: Option<String>,
    ) -> Result<String, EngineError> {
        let _admission = self.admission.lock().await;

        if let Some(key) = request_key.as_deref() {
            if let Some(existing) = self.storage.find_execution_by_request_key(key).await? {
                tracing::info!(
                    "[WorkflowEngine] Request key '{}' already maps to execution {}",
                    key,
                    existing
                );
                return self.start_execution(&existing).await;
            }
        }

        let definition = self.get_workflow(workflow_id).await?;
        StepGraph::compile(&definition)?;

        let execution = WorkflowExecution::new(
            uuid::Uuid::new_v4().to_string(),
            definition.id.clone(),
            input,
            session_id,
            user_id,
            request_key,
        );
        self.storage.save_execution(&execution).await?;
        tracing::info!(
            "[WorkflowEngine] Created execution {} of '{}'",
            execution.execution_id,
            definition.id
        );
        self.start_execution(&execution.execution_id).await
    }

    /// Take ownership of a `pending` execution and run it in the background.
    /// An execution that is already running or terminal is left alone.
    pub async fn start_execution(&self, execution_id: &str) -> Result<String, EngineError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(execution_id) {
            return Ok(execution_id.to_string());
        }

        let mut execution = self.load(execution_id).await?;
        if execution.status != ExecutionStatus::Pending {
            return Ok(execution_id.to_string());
        }

        let definition = self.get_workflow(&execution.workflow_id).await?;
        let graph = Arc::new(StepGraph::compile(&definition)?);

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.storage.save_execution(&execution).await?;

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let scheduler = Scheduler::new(
            RunIdentity {
                execution_id: execution.execution_id.clone(),
                workflow_id: execution.workflow_id.clone(),
                session_id: execution.session_id.clone(),
                user_id: execution.user_id.clone(),
                input: execution.input_data.clone(),
            },
            graph,
            definition.orchestration_mode,
            definition.max_parallelism.unwrap_or(self.config.max_parallelism),
            self.dispatcher.clone(),
            Arc::new(ExecutionHistory::new(execution_id, self.storage.clone())),
            cancel.clone(),
        );

        let storage = self.storage.clone();
        let owned = self.runs.clone();
        tokio::spawn(async move {
            let id = execution.execution_id.clone();
            match scheduler.run().await {
                Ok(summary) => {
                    execution.status = summary.status;
                    execution.error = summary.error;
                }
                Err(e) => {
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(e.to_string());
                }
            }
            execution.completed_at = Some(Utc::now());
            if let Err(e) = storage.save_execution(&execution).await {
                tracing::error!(
                    "[Scheduler:{}] Could not persist final status {}: {}",
                    id,
                    execution.status,
                    e
                );
            }
            owned.lock().await.remove(&id);
            let _ = done_tx.send(true);
        });

        runs.insert(
            execution_id.to_string(),
            RunHandle { cancel, done: done_rx },
        );
        tracing::info!("[WorkflowEngine] Execution {} is running", execution_id);
        Ok(execution_id.to_string())
    }

    /// Stop dispatching new steps; in-flight steps finish on their own and
    /// the execution then ends `cancelled`.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<(), EngineError> {
        let runs = self.runs.lock().await;
        if let Some(handle) = runs.get(execution_id) {
            handle.cancel.cancel();
            tracing::info!("[WorkflowEngine] Cancel requested for {}", execution_id);
            return Ok(());
        }

        let mut execution = self.load(execution_id).await?;
        match execution.status {
            ExecutionStatus::Running => {
                // Left running by a previous process; nothing is in flight.
                execution.status = ExecutionStatus::Cancelled;
                execution.completed_at = Some(Utc::now());
                self.storage.save_execution(&execution).await?;
                tracing::info!("[WorkflowEngine] Cancelled orphaned execution {}", execution_id);
                Ok(())
            }
            status => Err(EngineError::Validation(format!(
                "Execution {} is {} and cannot be cancelled",
                execution_id, status
            ))),
        }
    }

    /// Suspend until the execution is terminal (or no longer owned by this
    /// engine) and return its persisted state.
    pub async fn wait_for_execution(
        &self,
        execution_id: &str,
    ) -> Result<WorkflowExecution, EngineError> {
        let done = self
            .runs
            .lock()
            .await
            .get(execution_id)
            .map(|h| h.done.clone());
        if let Some(mut done) = done {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        self.load(execution_id).await
    }

    /// Cancel every owned execution and wait for each to drain.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, CancellationToken, watch::Receiver<bool>)> = self
            .runs
            .lock()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.cancel.clone(), h.done.clone()))
            .collect();
        for (_, cancel, _) in &handles {
            cancel.cancel();
        }
        for (id, _, mut done) in handles {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    break;
                }
            }
            tracing::info!("[WorkflowEngine] Execution {} drained", id);
        }
    }

    pub async fn running_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Queries ────────────────────────────────────────────────────────

    pub async fn get_execution(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        self.load(execution_id).await
    }

    /// Every attempt of every step, in append order.
    pub async fn get_execution_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepOutcome>, EngineError> {
        self.load(execution_id).await?;
        self.storage.load_step_outcomes(execution_id).await
    }

    pub async fn get_workflow_executions(
        &self,
        workflow_id: &str,
        status: Option<ExecutionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        self.storage
            .query_executions(&ExecutionFilter {
                workflow_id: Some(workflow_id.to_string()),
                status,
                limit,
            })
            .await
    }

    pub async fn get_all_workflow_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        self.storage
            .query_executions(&ExecutionFilter {
                workflow_id: None,
                status,
                limit,
            })
            .await
    }

    async fn load(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        self.storage
            .load_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Execution {}", execution_id)))
    }
}

fn same_definition(a: &WorkflowDefinition, b: &WorkflowDefinition) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionManager;
    use crate::models::execution::StepStatus;
    use crate::models::tool_server::RegisterServerInput;
    use crate::registry::ToolRegistry;
    use crate::testing::{memory_storage, Reply, ScriptedAgent, ScriptedTransportFactory};
    use std::time::Duration;

    struct Fixture {
        storage: Arc<crate::store::SqliteStorage>,
        connections: Arc<ConnectionManager>,
        agent: Arc<ScriptedAgent>,
        engine: WorkflowEngine,
    }

    fn fixture() -> Fixture {
        let storage = memory_storage();
        let agent = ScriptedAgent::new();
        let factory = ScriptedTransportFactory::mcp(&["search"], |_, args| {
            Reply::Result(serde_json::json!({
                "content": [{"type": "text", "text": format!("results for {}", args["q"])}]
            }))
        });
        let connections = Arc::new(ConnectionManager::new(
            storage.clone(),
            Arc::new(ToolRegistry::new()),
            factory,
            ConnectionConfig::default(),
        ));
        let config = SchedulerConfig {
            retry_delay_ms: 5,
            ..SchedulerConfig::default()
        };
        let dispatcher = Arc::new(StepDispatcher::new(connections.clone(), agent.clone(), config));
        let engine = WorkflowEngine::new(storage.clone(), dispatcher);
        Fixture { storage, connections, agent, engine }
    }

    async fn publish(engine: &WorkflowEngine, yaml: &str) -> String {
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        engine.publish_workflow(&definition).await.unwrap();
        definition.id
    }

    const SLOW: &str = r#"
id: slow
name: slow
steps:
  - { id: a, kind: agent_call, config: { delay_ms: 150 } }
  - { id: b, kind: agent_call, depends_on: [a] }
"#;

    const QUICK: &str = r#"
id: quick
name: quick
steps:
  - { id: a, kind: agent_call }
  - { id: b, kind: agent_call, depends_on: [a] }
"#;

    #[tokio::test]
    async fn test_execute_runs_to_completion() {
        let f = fixture();
        let wf = publish(&f.engine, QUICK).await;

        let id = f
            .engine
            .execute_workflow(&wf, serde_json::json!({"x": 1}), Some("s-1".into()), Some("u-1".into()), None)
            .await
            .unwrap();
        let execution = f.engine.wait_for_execution(&id).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.session_id.as_deref(), Some("s-1"));
        assert!(execution.started_at.is_some());
        assert!(execution.completed_at.is_some());
        assert_eq!(execution.step_results.len(), 2);
        assert!(f.engine.running_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_step_results_follow_settle_order() {
        let f = fixture();
        let wf = publish(
            &f.engine,
            r#"
id: settle-order
name: settle order
orchestration_mode: agentic
steps:
  - { id: a, kind: agent_call, config: { delay_ms: 80 } }
  - { id: z, kind: agent_call }
"#,
        )
        .await;

        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        f.engine.wait_for_execution(&id).await.unwrap();

        let execution = f.engine.get_execution(&id).await.unwrap();
        let order: Vec<&str> = execution.step_results.keys().map(String::as_str).collect();
        assert_eq!(order, ["z", "a"]);

        let json = serde_json::to_string(&execution.step_results).unwrap();
        assert!(json.find("\"z\"").unwrap() < json.find("\"a\"").unwrap());
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_not_found() {
        let f = fixture();
        let err = f
            .engine
            .execute_workflow("nope", serde_json::Value::Null, None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_request_key_is_idempotent() {
        let f = fixture();
        let wf = publish(&f.engine, SLOW).await;

        let first = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, Some("req-1".into()))
            .await
            .unwrap();
        let second = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, Some("req-1".into()))
            .await
            .unwrap();
        assert_eq!(first, second);

        let third = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        assert_ne!(first, third);

        f.engine.wait_for_execution(&first).await.unwrap();
        f.engine.wait_for_execution(&third).await.unwrap();
        assert_eq!(f.engine.get_all_workflow_executions(None, None).await.unwrap().len(), 2);
        // "a" ran once per execution, not once per request.
        let a_runs = f.agent.started().iter().filter(|s| *s == "a").count();
        assert_eq!(a_runs, 2);
    }

    #[tokio::test]
    async fn test_start_execution_is_idempotent() {
        let f = fixture();
        let wf = publish(&f.engine, SLOW).await;
        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(f.engine.start_execution(&id).await.unwrap(), id);
        }
        let done = f.engine.wait_for_execution(&id).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Completed);
        assert_eq!(f.engine.start_execution(&id).await.unwrap(), id);
        assert_eq!(f.agent.started(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancel_running_execution() {
        let f = fixture();
        let wf = publish(&f.engine, SLOW).await;
        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        f.engine.cancel_execution(&id).await.unwrap();
        let execution = f.engine.wait_for_execution(&id).await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        // The in-flight step was allowed to finish before completion was stamped.
        let a = &execution.step_results["a"];
        assert_eq!(a.status, StepStatus::Success);
        assert!(execution.completed_at.unwrap() >= a.finished_at);
        assert!(!execution.step_results.contains_key("b"));
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let f = fixture();
        let wf = publish(&f.engine, QUICK).await;

        let err = f.engine.cancel_execution("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        f.engine.wait_for_execution(&id).await.unwrap();
        let err = f.engine.cancel_execution(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let pending = WorkflowExecution::new("p-1".into(), wf.clone(), serde_json::Value::Null, None, None, None);
        f.storage.save_execution(&pending).await.unwrap();
        let err = f.engine.cancel_execution("p-1").await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut orphan = WorkflowExecution::new("o-1".into(), wf, serde_json::Value::Null, None, None, None);
        orphan.status = ExecutionStatus::Running;
        f.storage.save_execution(&orphan).await.unwrap();
        f.engine.cancel_execution("o-1").await.unwrap();
        let orphan = f.engine.get_execution("o-1").await.unwrap();
        assert_eq!(orphan.status, ExecutionStatus::Cancelled);
        assert!(orphan.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_history_keeps_every_attempt_in_order() {
        let f = fixture();
        let wf = publish(
            &f.engine,
            r#"
id: retry
name: retry
steps:
  - { id: first, kind: agent_call, max_retries: 1, config: { flaky: 1 } }
  - { id: second, kind: agent_call, depends_on: [first] }
"#,
        )
        .await;
        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        let execution = f.engine.wait_for_execution(&id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);

        let history = f.engine.get_execution_history(&id).await.unwrap();
        let trail: Vec<(String, StepStatus, u32)> = history
            .iter()
            .map(|o| (o.step_id.clone(), o.status, o.attempt))
            .collect();
        assert_eq!(
            trail,
            vec![
                ("first".to_string(), StepStatus::Failure, 1),
                ("first".to_string(), StepStatus::Success, 2),
                ("second".to_string(), StepStatus::Success, 1),
            ]
        );
        assert_eq!(execution.step_results["first"].attempt, 2);
    }

    #[tokio::test]
    async fn test_failed_run_records_error_and_filters() {
        let f = fixture();
        let wf = publish(
            &f.engine,
            r#"
id: broken
name: broken
steps:
  - { id: a, kind: agent_call, config: { fail: "bad prompt" } }
"#,
        )
        .await;
        let ok_wf = publish(&f.engine, QUICK).await;

        let failed = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        let done = f.engine.wait_for_execution(&failed).await.unwrap();
        assert_eq!(done.status, ExecutionStatus::Failed);
        assert!(done.error.unwrap().contains("bad prompt"));

        let ok = f
            .engine
            .execute_workflow(&ok_wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        f.engine.wait_for_execution(&ok).await.unwrap();

        let failures = f
            .engine
            .get_all_workflow_executions(Some(ExecutionStatus::Failed), None)
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].execution_id, failed);
        let quick = f.engine.get_workflow_executions(&ok_wf, None, Some(10)).await.unwrap();
        assert_eq!(quick.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_step_routes_through_connected_server() {
        let f = fixture();
        let server = f
            .connections
            .register_server(RegisterServerInput::local_process("search-server", "search-tool"))
            .await
            .unwrap();
        f.connections.connect_server(&server).await.unwrap();

        let wf = publish(
            &f.engine,
            r#"
id: lookup
name: lookup
steps:
  - { id: find, kind: tool_call, tool: search, arguments: { q: "${input.term}" } }
"#,
        )
        .await;
        let id = f
            .engine
            .execute_workflow(&wf, serde_json::json!({"term": "tokio"}), None, None, None)
            .await
            .unwrap();
        let execution = f.engine.wait_for_execution(&id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let output = &execution.step_results["find"].output;
        assert_eq!(output["content"][0]["text"], "results for \"tokio\"");
    }

    #[tokio::test]
    async fn test_publish_rejects_changed_definition() {
        let f = fixture();
        publish(&f.engine, QUICK).await;
        // Same content again is fine.
        publish(&f.engine, QUICK).await;

        let changed = WorkflowDefinition::from_yaml(
            r#"
id: quick
name: quick v2
steps:
  - { id: a, kind: agent_call }
"#,
        )
        .unwrap();
        let err = f.engine.publish_workflow(&changed).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let cyclic = WorkflowDefinition::from_yaml(
            r#"
id: loop
name: loop
steps:
  - { id: a, kind: agent_call, depends_on: [b] }
  - { id: b, kind: agent_call, depends_on: [a] }
"#,
        )
        .unwrap();
        assert!(matches!(
            f.engine.publish_workflow(&cyclic).await,
            Err(EngineError::Validation(_))
        ));
        assert_eq!(f.engine.list_workflows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_running_executions() {
        let f = fixture();
        let wf = publish(&f.engine, SLOW).await;
        let id = f
            .engine
            .execute_workflow(&wf, serde_json::Value::Null, None, None, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        f.engine.shutdown().await;
        assert!(f.engine.running_executions().await.is_empty());
        let execution = f.engine.get_execution(&id).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
    }
}
