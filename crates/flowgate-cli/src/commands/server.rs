//! `flowgate server` — tool server administration.

use std::time::Duration;

use flowgate_core::models::tool_server::{RegisterServerInput, TransportKind};
use flowgate_core::state::AppState;

use super::{parse_json_arg, parse_pairs, print_json, print_serialized};

/// Arguments of `flowgate server add`.
#[derive(Debug, Clone, Default)]
pub struct AddServerArgs {
    pub name: String,
    pub transport: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    pub headers: Vec<String>,
}

pub async fn add(state: &AppState, args: AddServerArgs) -> Result<String, String> {
    let transport_kind: TransportKind = args.transport.parse()?;
    let input = RegisterServerInput {
        name: args.name,
        transport_kind,
        command: args.command,
        args: args.args,
        env: parse_pairs(&args.env)?,
        cwd: args.cwd,
        url: args.url,
        headers: parse_pairs(&args.headers)?,
    };
    let server_id = state
        .connections
        .register_server(input)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "serverId": server_id }));
    Ok(server_id)
}

pub async fn list(state: &AppState) -> Result<(), String> {
    let servers = state.connections.list_server_statuses().await;
    print_serialized(&servers)
}

pub async fn status(state: &AppState, server_id: &str) -> Result<(), String> {
    let server = state
        .connections
        .get_server_status(server_id)
        .await
        .map_err(|e| e.to_string())?;
    print_serialized(&server)
}

/// Connect and print the discovered tools. The session lives as long as
/// this process.
pub async fn connect(state: &AppState, server_id: &str) -> Result<(), String> {
    let result = state.connections.connect_server(server_id).await;
    let server = state
        .connections
        .get_server_status(server_id)
        .await
        .map_err(|e| e.to_string())?;
    result.map_err(|e| e.to_string())?;
    let tools = state.connections.list_tools(server_id).await.map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "server": server, "tools": tools }));
    Ok(())
}

pub async fn disconnect(state: &AppState, server_id: &str) -> Result<(), String> {
    state
        .connections
        .disconnect_server(server_id)
        .await
        .map_err(|e| e.to_string())?;
    status(state, server_id).await
}

pub async fn remove(state: &AppState, server_id: &str) -> Result<(), String> {
    state
        .connections
        .remove_server(server_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&serde_json::json!({ "removed": server_id }));
    Ok(())
}

/// With a server id: that server's last discovered tools. Without: the
/// tool -> owners map.
pub async fn tools(state: &AppState, server_id: Option<&str>, include_stale: bool) -> Result<(), String> {
    match server_id {
        Some(id) => {
            let tools = state.connections.list_tools(id).await.map_err(|e| e.to_string())?;
            print_serialized(&tools)
        }
        None => print_serialized(&state.connections.list_all_tools(include_stale)),
    }
}

/// Connect if needed, then invoke one tool.
pub async fn call(
    state: &AppState,
    server_id: &str,
    tool: &str,
    arguments: &str,
    timeout_ms: Option<u64>,
) -> Result<(), String> {
    let arguments = parse_json_arg("args", arguments)?;
    state
        .connections
        .connect_server(server_id)
        .await
        .map_err(|e| e.to_string())?;
    let result = state
        .connections
        .call_tool(server_id, tool, arguments, timeout_ms.map(Duration::from_millis))
        .await
        .map_err(|e| e.to_string())?;
    print_json(&result);
    Ok(())
}
