//! Running one step: per-attempt timeout, bounded retry of transient
//! failures, and a history entry for every attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::connection::ConnectionManager;
use crate::error::EngineError;
use crate::models::execution::StepOutcome;
use crate::models::workflow::{StepKind, StepSpec};

use super::agent::{AgentContext, AgentExecutor};
use super::history::ExecutionHistory;
use super::template;

pub struct StepDispatcher {
    connections: Arc<ConnectionManager>,
    agent: Arc<dyn AgentExecutor>,
    config: SchedulerConfig,
}

/// Everything a step invocation may read.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub agent: AgentContext,
    /// `{ "input": ..., "steps": { "<id>": { "output": ... } } }`
    pub template: serde_json::Value,
}

impl StepDispatcher {
    pub fn new(
        connections: Arc<ConnectionManager>,
        agent: Arc<dyn AgentExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self { connections, agent, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run the step to its final outcome. Every attempt is appended to
    /// `history`; the returned outcome is the last one appended. `Err` means
    /// history could not be written.
    ///
    /// Cancellation never interrupts an attempt in progress; it only stops
    /// further retries, including one already waiting out its delay.
    pub async fn run_step(
        &self,
        step: &StepSpec,
        context: &StepContext,
        history: &ExecutionHistory,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let timeout = Duration::from_secs(
            step.timeout_secs
                .unwrap_or(self.config.default_step_timeout_secs),
        );
        let max_retries = step.max_retries.unwrap_or(self.config.default_max_retries);
        let mut attempt: u32 = 1;

        loop {
            let started_at = Utc::now();
            let result = match tokio::time::timeout(timeout, self.invoke(step, context)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Timeout(format!(
                    "step '{}' exceeded {}s",
                    step.id,
                    timeout.as_secs()
                ))),
            };

            let err = match result {
                Ok(output) => {
                    let outcome = StepOutcome::success(&step.id, output, started_at, attempt);
                    history.append(outcome.clone()).await?;
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            let outcome = StepOutcome::failure(&step.id, err.to_string(), started_at, attempt);
            history.append(outcome.clone()).await?;

            let retry = err.is_transient() && attempt <= max_retries && !cancel.is_cancelled();
            if !retry {
                return Ok(outcome);
            }
            tracing::warn!(
                "[Scheduler:{}] Step '{}' attempt {} failed ({}); retrying",
                context.agent.execution_id,
                step.id,
                attempt,
                err
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(outcome),
                _ = tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)) => {}
            }
            attempt += 1;
        }
    }

    async fn invoke(
        &self,
        step: &StepSpec,
        context: &StepContext,
    ) -> Result<serde_json::Value, EngineError> {
        match &step.kind {
            StepKind::ToolCall { tool, server, arguments } => {
                let server_id = match server {
                    Some(server_id) => server_id.clone(),
                    None => self.connections.find_tool_owner(tool).await?,
                };
                let arguments = template::resolve(arguments, &context.template);
                self.connections
                    .call_tool(&server_id, tool, arguments, None)
                    .await
            }
            StepKind::AgentCall { config } => {
                let config = template::resolve(config, &context.template);
                self.agent.invoke_agent(&config, &context.agent).await
            }
            StepKind::Branch { .. } | StepKind::Join => Err(EngineError::Validation(format!(
                "{} step '{}' is evaluated by the scheduler",
                step.kind.label(),
                step.id
            ))),
        }
    }
}
