//! Integration tests for the flowgate CLI commands.
//!
//! These tests exercise the same code paths as the binary, using
//! in-memory SQLite databases for isolation.

use std::io::Write;
use std::sync::Arc;

use flowgate_cli::commands;
use flowgate_cli::commands::server::AddServerArgs;
use flowgate_cli::commands::workflow::RunArgs;
use flowgate_core::models::execution::{ExecutionStatus, StepStatus};
use flowgate_core::models::tool_server::ConnectionState;
use flowgate_core::state::{AppState, AppStateInner};
use flowgate_core::{Database, EngineConfig};

/// Create an in-memory AppState for testing.
async fn test_state() -> AppState {
    let db = Database::open_in_memory().expect("Failed to open in-memory database");
    let mut config = EngineConfig::default();
    config.connections.health_check_interval_secs = 0;
    let state: AppState = Arc::new(AppStateInner::new(db, config));
    state.start().await.expect("Failed to start state");
    state
}

fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write temp file");
    file
}

fn path_of(file: &tempfile::NamedTempFile) -> String {
    file.path().to_string_lossy().to_string()
}

const BEST_EFFORT: &str = r#"
id: nightly
name: Nightly digest
orchestration_mode: agent
steps:
  - id: notify
    kind: agent_call
    required: false
    max_retries: 0
  - id: done
    kind: join
    depends_on: [notify]
"#;

const REQUIRED: &str = r#"
id: strict
name: Strict digest
steps:
  - id: summarize
    kind: agent_call
    max_retries: 0
  - id: publish
    kind: agent_call
    depends_on: [summarize]
"#;

#[tokio::test]
async fn test_remote_server_without_url_is_rejected() {
    let state = test_state().await;
    let err = commands::server::add(
        &state,
        AddServerArgs {
            name: "search".into(),
            transport: "remote-endpoint".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(err.contains("URL"), "unexpected error: {}", err);
    assert!(state.connections.list_server_statuses().await.is_empty());
}

#[tokio::test]
async fn test_server_add_list_and_remove() {
    let state = test_state().await;
    let local = commands::server::add(
        &state,
        AddServerArgs {
            name: "files".into(),
            transport: "local-process".into(),
            command: Some("files-tool".into()),
            args: vec!["--root".into(), "/tmp".into()],
            env: vec!["LOG=debug".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let remote = commands::server::add(
        &state,
        AddServerArgs {
            name: "search".into(),
            transport: "remote-endpoint".into(),
            url: Some("https://tools.example.com/rpc".into()),
            headers: vec!["Authorization=Bearer t".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap();

    commands::server::list(&state).await.unwrap();
    let servers = state.connections.list_server_statuses().await;
    assert_eq!(servers.len(), 2);
    assert!(servers
        .iter()
        .all(|s| s.connection_state == ConnectionState::Registered));

    commands::server::status(&state, &local).await.unwrap();
    commands::server::remove(&state, &remote).await.unwrap();
    assert_eq!(state.connections.list_server_statuses().await.len(), 1);
    assert!(commands::server::status(&state, &remote).await.is_err());
}

#[tokio::test]
async fn test_bad_env_pair_is_rejected() {
    let state = test_state().await;
    let err = commands::server::add(
        &state,
        AddServerArgs {
            name: "files".into(),
            transport: "local-process".into(),
            command: Some("files-tool".into()),
            env: vec!["LOG".into()],
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(err.contains("KEY=VALUE"));
}

#[tokio::test]
async fn test_connect_failure_leaves_server_in_error() {
    let state = test_state().await;
    let id = commands::server::add(
        &state,
        AddServerArgs {
            name: "ghost".into(),
            transport: "local-process".into(),
            command: Some("flowgate-test-no-such-binary".into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(commands::server::connect(&state, &id).await.is_err());
    let server = state.connections.get_server_status(&id).await.unwrap();
    assert_eq!(server.connection_state, ConnectionState::Error);
    assert!(server.last_error.is_some());
}

#[tokio::test]
async fn test_workflow_import_and_run_best_effort() {
    let state = test_state().await;
    let file = write_temp(".yaml", BEST_EFFORT);
    let id = commands::workflow::import(&state, &path_of(&file)).await.unwrap();
    assert_eq!(id, "nightly");
    commands::workflow::list(&state).await.unwrap();

    let execution = commands::workflow::run(
        &state,
        RunArgs {
            workflow_id: id,
            input: Some(r#"{"day": "monday"}"#.into()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.input_data["day"], "monday");
    assert_eq!(execution.step_results["notify"].status, StepStatus::Failure);
    assert_eq!(execution.step_results["done"].status, StepStatus::Success);
}

#[tokio::test]
async fn test_workflow_run_failure_is_an_error() {
    let state = test_state().await;
    let file = write_temp(".yaml", REQUIRED);
    let id = commands::workflow::import(&state, &path_of(&file)).await.unwrap();

    let err = commands::workflow::run(
        &state,
        RunArgs {
            workflow_id: id.clone(),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(err.contains("failed"), "unexpected error: {}", err);

    let failed = state
        .workflows
        .get_workflow_executions(&id, Some(ExecutionStatus::Failed), None)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let execution = &failed[0];
    assert_eq!(execution.step_results["summarize"].status, StepStatus::Failure);
    assert_eq!(execution.step_results["publish"].status, StepStatus::Skipped);

    commands::workflow::executions(&state, Some(&id), Some("failed"), Some(5))
        .await
        .unwrap();
    commands::workflow::history(&state, &execution.execution_id).await.unwrap();

    // Terminal executions cannot be cancelled.
    assert!(commands::workflow::cancel(&state, &execution.execution_id)
        .await
        .is_err());
    assert!(commands::workflow::executions(&state, None, Some("bogus"), None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_request_key_reuses_execution() {
    let state = test_state().await;
    let file = write_temp(".yaml", BEST_EFFORT);
    let id = commands::workflow::import(&state, &path_of(&file)).await.unwrap();

    let run = |key: &str| RunArgs {
        workflow_id: id.clone(),
        request_key: Some(key.to_string()),
        ..Default::default()
    };
    let first = commands::workflow::run(&state, run("nightly-2024-06-01")).await.unwrap();
    let second = commands::workflow::run(&state, run("nightly-2024-06-01")).await.unwrap();
    assert_eq!(first.execution_id, second.execution_id);

    let all = state
        .workflows
        .get_all_workflow_executions(None, None)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_invalid_workflow_is_not_published() {
    let state = test_state().await;
    let file = write_temp(
        ".yaml",
        r#"
id: broken
name: Broken
steps:
  - id: a
    kind: agent_call
    depends_on: [missing]
"#,
    );
    let err = commands::workflow::import(&state, &path_of(&file)).await.unwrap_err();
    assert!(err.contains("missing"), "unexpected error: {}", err);
    assert!(state.workflows.list_workflows().await.unwrap().is_empty());

    let err = commands::workflow::run(
        &state,
        RunArgs {
            workflow_id: "broken".into(),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    assert!(err.contains("Not found"));
}

#[tokio::test]
async fn test_config_file_is_loaded() {
    let file = write_temp(
        ".yaml",
        r#"
db_path: "from-config.db"
connections:
  request_timeout_ms: 2000
scheduler:
  max_parallelism: 2
"#,
    );
    let config = commands::load_config(Some(&path_of(&file)), None).unwrap();
    assert_eq!(config.db_path, "from-config.db");
    assert_eq!(config.connections.request_timeout_ms, 2000);
    assert_eq!(config.connections.health_failure_threshold, 3);
    assert_eq!(config.scheduler.max_parallelism, 2);

    let config = commands::load_config(Some(&path_of(&file)), Some(":memory:")).unwrap();
    assert_eq!(config.db_path, ":memory:");
    assert!(commands::load_config(Some("/nonexistent/flowgate.yaml"), None).is_err());
}
