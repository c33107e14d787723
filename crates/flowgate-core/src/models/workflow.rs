//! Workflow definition types.
//!
//! A workflow is a DAG of steps, usually authored in YAML:
//!
//! ```yaml
//! id: "triage"
//! name: "Issue triage"
//! orchestration_mode: hybrid   # agent | agentic | hybrid
//! max_parallelism: 4
//!
//! steps:
//!   - id: fetch
//!     kind: tool_call
//!     server: github
//!     tool: get_issue
//!     arguments:
//!       number: "${input.issue}"
//!
//!   - id: classify
//!     kind: agent_call
//!     depends_on: [fetch]
//!     config:
//!       prompt: "Classify: ${steps.fetch.output.title}"
//!
//!   - id: is_bug
//!     kind: branch
//!     depends_on: [classify]
//!     condition: { step: classify, path: label, equals: "bug" }
//!     when_true: [open_ticket]
//!     when_false: [reply]
//!
//!   - id: open_ticket
//!     kind: tool_call
//!     tool: create_ticket
//!     depends_on: [is_bug]
//!     parallel: false
//!
//!   - id: reply
//!     kind: tool_call
//!     tool: post_comment
//!     depends_on: [is_bug]
//!     required: false
//!
//!   - id: done
//!     kind: join
//!     depends_on: [open_ticket, reply]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::workflow::graph::StepGraph;

/// Top-level workflow definition. Immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier used by `execute_workflow`
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Version string
    #[serde(default = "default_version")]
    pub version: String,

    /// Dispatch policy for the step graph
    #[serde(default)]
    pub orchestration_mode: OrchestrationMode,

    /// Overrides the engine-wide in-flight bound for this workflow
    #[serde(default)]
    pub max_parallelism: Option<usize>,

    /// Steps; order only matters for tie-breaking among ready steps
    pub steps: Vec<StepSpec>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_true() -> bool {
    true
}

/// How much of the graph's parallelism a run may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationMode {
    /// One step in flight at a time
    Agent,
    /// Ready steps run concurrently up to the parallelism bound
    #[default]
    Agentic,
    /// Per-step: `parallel: false` steps run alone behind a barrier
    Hybrid,
}

/// A single node of the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id, unique within the workflow
    pub id: String,

    /// Optional display name
    #[serde(default)]
    pub name: Option<String>,

    /// What the step does
    #[serde(flatten)]
    pub kind: StepKind,

    /// Upstream steps that must be terminal before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// A required step failing fails the run and skips its dependents;
    /// a best-effort step failing hands its dependents a null output
    #[serde(default = "default_true")]
    pub required: bool,

    /// Hybrid mode only: `false` makes the step a barrier
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Per-attempt timeout in seconds (engine default when absent)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Retries on transient failure (engine default when absent)
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// The step variants and their configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a tool through the connection manager
    ToolCall {
        tool: String,
        /// Owning server; resolved through the tool registry when absent
        #[serde(default)]
        server: Option<String>,
        #[serde(default)]
        arguments: serde_json::Value,
    },
    /// Call the external agent executor
    AgentCall {
        #[serde(default)]
        config: serde_json::Value,
    },
    /// Enable a subset of its dependents based on an upstream output
    Branch {
        condition: BranchCondition,
        #[serde(default)]
        when_true: Vec<String>,
        #[serde(default)]
        when_false: Vec<String>,
    },
    /// Runs once every upstream is terminal, whatever the outcome
    Join,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::ToolCall { .. } => "tool_call",
            StepKind::AgentCall { .. } => "agent_call",
            StepKind::Branch { .. } => "branch",
            StepKind::Join => "join",
        }
    }
}

/// Predicate over an upstream step's output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BranchCondition {
    /// Upstream step whose output is inspected
    pub step: String,
    /// Dotted path into the output (`a.b.0.c`)
    #[serde(default)]
    pub path: Option<String>,
    /// Compare against this value; JSON truthiness when absent
    #[serde(default)]
    pub equals: Option<serde_json::Value>,
}

impl StepSpec {
    pub fn is_join(&self) -> bool {
        matches!(self.kind, StepKind::Join)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl WorkflowDefinition {
    /// Parse a workflow definition from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EngineError::Validation(format!("Failed to parse workflow YAML: {}", e)))
    }

    /// Load a workflow definition from a YAML or JSON file.
    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Validation(format!("Failed to read workflow file '{}': {}", path, e))
        })?;
        if path.ends_with(".json") {
            serde_json::from_str(&content).map_err(|e| {
                EngineError::Validation(format!("Failed to parse workflow JSON: {}", e))
            })
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Check the graph invariants: unique ids, known dependencies, no cycles,
    /// well-formed branch and join steps.
    pub fn validate(&self) -> Result<(), EngineError> {
        StepGraph::compile(self).map(|_| ())
    }

    pub fn step(&self, step_id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
id: "wf-1"
name: "Test Flow"
steps:
  - id: "a"
    kind: tool_call
    tool: "echo"
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "Test Flow");
        assert_eq!(wf.orchestration_mode, OrchestrationMode::Agentic);
        assert_eq!(wf.steps.len(), 1);
        assert!(wf.steps[0].required);
        assert!(wf.steps[0].parallel);
        assert_eq!(wf.steps[0].kind.label(), "tool_call");
        wf.validate().unwrap();
    }

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
id: "triage"
name: "Issue triage"
version: "2.0"
orchestration_mode: hybrid
max_parallelism: 2
steps:
  - id: fetch
    kind: tool_call
    server: github
    tool: get_issue
    arguments:
      number: "${input.issue}"
    timeout_secs: 20
    max_retries: 1
  - id: classify
    kind: agent_call
    depends_on: [fetch]
    config:
      prompt: "Classify ${steps.fetch.output.title}"
  - id: is_bug
    kind: branch
    depends_on: [classify]
    condition: { step: classify, path: label, equals: "bug" }
    when_true: [open_ticket]
    when_false: [reply]
  - id: open_ticket
    kind: tool_call
    tool: create_ticket
    depends_on: [is_bug]
    parallel: false
  - id: reply
    kind: tool_call
    tool: post_comment
    depends_on: [is_bug]
    required: false
  - id: done
    kind: join
    depends_on: [open_ticket, reply]
"#;
        let wf = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(wf.version, "2.0");
        assert_eq!(wf.orchestration_mode, OrchestrationMode::Hybrid);
        assert_eq!(wf.max_parallelism, Some(2));
        assert_eq!(wf.steps.len(), 6);

        let fetch = wf.step("fetch").unwrap();
        assert_eq!(fetch.timeout_secs, Some(20));
        match &fetch.kind {
            StepKind::ToolCall { tool, server, arguments } => {
                assert_eq!(tool, "get_issue");
                assert_eq!(server.as_deref(), Some("github"));
                assert_eq!(arguments["number"], "${input.issue}");
            }
            other => panic!("unexpected kind: {:?}", other),
        }

        match &wf.step("is_bug").unwrap().kind {
            StepKind::Branch { condition, when_true, when_false } => {
                assert_eq!(condition.step, "classify");
                assert_eq!(condition.equals, Some(serde_json::json!("bug")));
                assert_eq!(when_true, &vec!["open_ticket".to_string()]);
                assert_eq!(when_false, &vec!["reply".to_string()]);
            }
            other => panic!("unexpected kind: {:?}", other),
        }

        assert!(!wf.step("open_ticket").unwrap().parallel);
        assert!(!wf.step("reply").unwrap().required);
        assert!(wf.step("done").unwrap().is_join());
        wf.validate().unwrap();
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let yaml = r#"
id: "x"
name: "x"
steps:
  - id: a
    kind: teleport
"#;
        assert!(matches!(
            WorkflowDefinition::from_yaml(yaml),
            Err(EngineError::Validation(_))
        ));
    }
}
