use indexmap::IndexMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `pending -> running -> {completed | failed | cancelled}`; nothing else.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failure,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "skipped" => Self::Skipped,
            _ => Self::Failure,
        }
    }
}

/// Terminal record of one attempt of one step. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempt: u32,
}

impl StepOutcome {
    pub fn success(
        step_id: &str,
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Success,
            output,
            error: None,
            started_at,
            finished_at: Utc::now(),
            attempt,
        }
    }

    pub fn failure(
        step_id: &str,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        attempt: u32,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Failure,
            output: serde_json::Value::Null,
            error: Some(error.into()),
            started_at,
            finished_at: Utc::now(),
            attempt,
        }
    }

    pub fn skipped(step_id: &str, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Skipped,
            output: serde_json::Value::Null,
            error: Some(reason.into()),
            started_at: now,
            finished_at: now,
            attempt: 0,
        }
    }
}

/// Latest outcome per step id, ordered by when that outcome was appended.
pub type StepResults = IndexMap<String, StepOutcome>;

/// Fold one appended outcome into `results`. A later attempt replaces the
/// step's earlier entry and moves to the end.
pub fn record_latest(results: &mut StepResults, outcome: StepOutcome) {
    results.shift_remove(&outcome.step_id);
    results.insert(outcome.step_id.clone(), outcome);
}

/// One run of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub input_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Caller-supplied idempotency key for `execute_workflow`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    /// Latest outcome per step, in the order the outcomes were appended
    #[serde(default)]
    pub step_results: StepResults,
    /// Why the run ended `failed`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(
        execution_id: String,
        workflow_id: String,
        input_data: serde_json::Value,
        session_id: Option<String>,
        user_id: Option<String>,
        request_key: Option<String>,
    ) -> Self {
        Self {
            execution_id,
            workflow_id,
            status: ExecutionStatus::Pending,
            input_data,
            session_id,
            user_id,
            request_key,
            step_results: StepResults::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Filter for execution history queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFilter {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
}
