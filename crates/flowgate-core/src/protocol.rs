//! JSON-RPC 2.0 framing for the tool protocol.
//!
//! Every request carries a numeric correlation id plus a method/params pair;
//! every response echoes the id with either `result` or `error`. Frames are
//! single lines of JSON.

use serde::{Deserialize, Serialize};

use crate::models::tool_server::ToolDescriptor;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_PING: &str = "ping";

/// Code used when a tool reports `isError: true` in an otherwise valid answer.
pub const TOOL_ERROR_CODE: i64 = -32000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl RpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A notification frame (no id, no answer expected).
pub fn notification_frame(method: &str) -> String {
    serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "method": method }).to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// What an inbound frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Answer to one of our requests.
    Response {
        id: u64,
        outcome: Result<serde_json::Value, RpcError>,
    },
    /// Server-initiated notification; the engine does not act on these.
    Notification { method: String },
    /// Server-initiated request; not supported by this client.
    Request { id: serde_json::Value, method: String },
    /// Anything that is not a JSON-RPC message we understand.
    Malformed(String),
}

pub fn classify(line: &str) -> Inbound {
    let msg: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Inbound::Malformed(format!("not JSON: {}", e)),
    };

    let id = msg.get("id").filter(|v| !v.is_null());
    let method = msg.get("method").and_then(|m| m.as_str());

    match (id, method) {
        (Some(id), Some(method)) => Inbound::Request {
            id: id.clone(),
            method: method.to_string(),
        },
        (None, Some(method)) => Inbound::Notification {
            method: method.to_string(),
        },
        (Some(id), None) => {
            let Some(id) = id.as_u64() else {
                return Inbound::Malformed(format!("non-numeric response id: {}", id));
            };
            if let Some(error) = msg.get("error") {
                let error = serde_json::from_value::<RpcError>(error.clone()).unwrap_or_else(|_| {
                    RpcError {
                        code: error["code"].as_i64().unwrap_or(0),
                        message: error.to_string(),
                        data: None,
                    }
                });
                Inbound::Response { id, outcome: Err(error) }
            } else if let Some(result) = msg.get("result") {
                Inbound::Response { id, outcome: Ok(result.clone()) }
            } else {
                Inbound::Malformed(format!("response {} has neither result nor error", id))
            }
        }
        (None, None) => Inbound::Malformed("missing id and method".to_string()),
    }
}

pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "flowgate",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

/// Extract the tool list from a `tools/list` result.
pub fn parse_tools(result: &serde_json::Value) -> Vec<ToolDescriptor> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value::<ToolDescriptor>(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// A `tools/call` result flagged `isError` is a business failure.
/// The message is the concatenated text content.
pub fn tool_call_error(result: &serde_json::Value) -> Option<String> {
    if !result.get("isError").and_then(|v| v.as_bool()).unwrap_or(false) {
        return None;
    }
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "tool reported an error".to_string());
    Some(text)
}
