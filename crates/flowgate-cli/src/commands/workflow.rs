//! `flowgate workflow` — publish workflows and run them.

use flowgate_core::models::execution::{ExecutionStatus, WorkflowExecution};
use flowgate_core::models::tool_server::ConnectionState;
use flowgate_core::models::workflow::WorkflowDefinition;
use flowgate_core::state::AppState;

use super::{parse_json_arg, print_json, print_serialized};

/// Validate a YAML/JSON definition file and publish it.
pub async fn import(state: &AppState, file: &str) -> Result<String, String> {
    let definition = WorkflowDefinition::from_file(file).map_err(|e| e.to_string())?;
    state
        .workflows
        .publish_workflow(&definition)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "✅ Published '{}' ({} step(s), {:?} mode)",
        definition.id,
        definition.steps.len(),
        definition.orchestration_mode
    );
    Ok(definition.id)
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let workflows = state.workflows.list_workflows().await.map_err(|e| e.to_string())?;
    let rows: Vec<serde_json::Value> = workflows
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "version": w.version,
                "orchestrationMode": w.orchestration_mode,
                "steps": w.steps.len(),
            })
        })
        .collect();
    print_json(&serde_json::Value::Array(rows));
    Ok(())
}

/// Arguments of `flowgate workflow run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub workflow_id: String,
    pub input: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub request_key: Option<String>,
}

/// Connect every registered server, run the workflow to a terminal status
/// and print the execution. Anything but `completed` is an error.
pub async fn run(state: &AppState, args: RunArgs) -> Result<WorkflowExecution, String> {
    let input = match args.input.as_deref() {
        Some(raw) => parse_json_arg("input", raw)?,
        None => serde_json::Value::Null,
    };

    for server in state.connections.list_server_statuses().await {
        if server.connection_state == ConnectionState::Connected {
            continue;
        }
        if let Err(e) = state.connections.connect_server(&server.server_id).await {
            tracing::warn!("[flowgate] Server '{}' unavailable: {}", server.name, e);
        }
    }

    let execution_id = state
        .workflows
        .execute_workflow(
            &args.workflow_id,
            input,
            args.session_id,
            args.user_id,
            args.request_key,
        )
        .await
        .map_err(|e| e.to_string())?;
    let execution = state
        .workflows
        .wait_for_execution(&execution_id)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&execution)?;

    match execution.status {
        ExecutionStatus::Completed => Ok(execution),
        status => Err(format!(
            "Execution {} ended {}{}",
            execution.execution_id,
            status,
            execution
                .error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )),
    }
}

pub async fn executions(
    state: &AppState,
    workflow_id: Option<&str>,
    status: Option<&str>,
    limit: Option<usize>,
) -> Result<(), String> {
    let status = status
        .map(|s| {
            ExecutionStatus::from_str(s).ok_or_else(|| format!("Unknown execution status: {}", s))
        })
        .transpose()?;
    let executions = match workflow_id {
        Some(id) => state.workflows.get_workflow_executions(id, status, limit).await,
        None => state.workflows.get_all_workflow_executions(status, limit).await,
    }
    .map_err(|e| e.to_string())?;
    print_serialized(&executions)
}

/// Every recorded attempt of the execution, oldest first.
pub async fn history(state: &AppState, execution_id: &str) -> Result<(), String> {
    let outcomes = state
        .workflows
        .get_execution_history(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&outcomes)
}

pub async fn cancel(state: &AppState, execution_id: &str) -> Result<(), String> {
    state
        .workflows
        .cancel_execution(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    let execution = state
        .workflows
        .get_execution(execution_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({
        "executionId": execution.execution_id,
        "status": execution.status,
    }));
    Ok(())
}
