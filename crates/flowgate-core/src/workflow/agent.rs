//! Agent-call collaborator.
//!
//! The engine hands an `agent_call` step's (templated) config and a context
//! to an `AgentExecutor` and treats the call as an opaque async operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// What an agent sees about the run it is part of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub input: serde_json::Value,
    /// `{ "<stepId>": { "output": ... } }` for every upstream step that finished
    pub steps: serde_json::Value,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn invoke_agent(
        &self,
        config: &serde_json::Value,
        context: &AgentContext,
    ) -> Result<serde_json::Value, EngineError>;
}

/// Default when no agent backend is wired in: every agent step fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAgent;

#[async_trait]
impl AgentExecutor for UnconfiguredAgent {
    async fn invoke_agent(
        &self,
        _config: &serde_json::Value,
        context: &AgentContext,
    ) -> Result<serde_json::Value, EngineError> {
        Err(EngineError::Agent(format!(
            "No agent executor configured for step '{}'",
            context.step_id
        )))
    }
}
