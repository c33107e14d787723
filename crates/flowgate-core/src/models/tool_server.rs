use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How the engine reaches a tool server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON-RPC over stdio.
    LocalProcess,
    /// HTTP endpoint; one POST per request/response pair.
    RemoteEndpoint,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::LocalProcess => write!(f, "local-process"),
            TransportKind::RemoteEndpoint => write!(f, "remote-endpoint"),
        }
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local-process" | "stdio" => Ok(TransportKind::LocalProcess),
            "remote-endpoint" | "http" => Ok(TransportKind::RemoteEndpoint),
            other => Err(format!("Unknown TransportKind: {}", other)),
        }
    }
}

/// Everything needed to open a session, per transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LaunchSpec {
    #[serde(rename_all = "camelCase")]
    LocalProcess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RemoteEndpoint {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl LaunchSpec {
    pub fn kind(&self) -> TransportKind {
        match self {
            LaunchSpec::LocalProcess { .. } => TransportKind::LocalProcess,
            LaunchSpec::RemoteEndpoint { .. } => TransportKind::RemoteEndpoint,
        }
    }
}

/// Lifecycle state of a tool server as seen by the connection manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Registered,
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        }
    }

    /// States from which `connect_server` may start a new attempt.
    pub fn can_connect(&self) -> bool {
        matches!(self, Self::Registered | Self::Disconnected | Self::Error)
    }
}

/// A persisted tool server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServerConfig {
    pub id: String,
    pub name: String,
    pub launch_spec: LaunchSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolServerConfig {
    pub fn transport_kind(&self) -> TransportKind {
        self.launch_spec.kind()
    }
}

/// Read-only snapshot of a tool server's configuration and live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolServer {
    pub server_id: String,
    pub name: String,
    pub transport_kind: TransportKind,
    pub launch_spec: LaunchSpec,
    pub declared_capabilities: Vec<String>,
    pub connection_state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_health_failures: u32,
}

/// A tool as advertised by a server's `tools/list` answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::Value::Null,
        }
    }
}

/// Input for registering a new tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServerInput {
    pub name: String,
    pub transport_kind: TransportKind,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RegisterServerInput {
    pub fn local_process(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport_kind: TransportKind::LocalProcess,
            command: Some(command.into()),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
        }
    }

    pub fn remote_endpoint(name: impl Into<String>, url: Option<String>) -> Self {
        Self {
            name: name.into(),
            transport_kind: TransportKind::RemoteEndpoint,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url,
            headers: HashMap::new(),
        }
    }

    /// Check the input against its transport kind and build the launch spec.
    pub fn launch_spec(&self) -> Result<LaunchSpec, EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("Server name must not be empty".to_string()));
        }
        match self.transport_kind {
            TransportKind::LocalProcess => {
                let command = non_blank(self.command.as_deref()).ok_or_else(|| {
                    EngineError::Validation(
                        "local-process servers require a launch command".to_string(),
                    )
                })?;
                Ok(LaunchSpec::LocalProcess {
                    command: command.to_string(),
                    args: self.args.clone(),
                    env: self.env.clone(),
                    cwd: self.cwd.clone(),
                })
            }
            TransportKind::RemoteEndpoint => {
                let url = non_blank(self.url.as_deref()).ok_or_else(|| {
                    EngineError::Validation("remote-endpoint servers require a URL".to_string())
                })?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(EngineError::Validation(format!(
                        "remote-endpoint URL must be http(s): {}",
                        url
                    )));
                }
                Ok(LaunchSpec::RemoteEndpoint {
                    url: url.to_string(),
                    headers: self.headers.clone(),
                })
            }
        }
    }
}

/// Input for updating an existing tool server. Absent fields keep their value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServerInput {
    pub name: Option<String>,
    pub launch_spec: Option<LaunchSpec>,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
