//! Step scheduler — drives one execution's step graph to a terminal status.
//!
//! Ready tracking follows the arena in `StepGraph`: each step keeps a count
//! of unsettled upstream steps, decremented as outcomes land; a step is
//! considered exactly when its count reaches zero. At that point it either
//! runs or, if an upstream outcome doomed it, is recorded `skipped`.
//!
//! - A required step's permanent failure dooms every transitive dependent,
//!   joins included, and fails the run. Independent branches keep going.
//! - A best-effort failure hands dependents a `null` output.
//! - A branch dooms the targets it did not select; that skip cascades
//!   through their descendants but stops at joins.
//!
//! `branch` and `join` steps are evaluated in place; tool and agent calls
//! run as tasks, bounded by the orchestration mode.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::models::execution::{ExecutionStatus, StepOutcome, StepStatus};
use crate::models::workflow::{OrchestrationMode, StepKind};

use super::agent::AgentContext;
use super::dispatch::{StepContext, StepDispatcher};
use super::graph::StepGraph;
use super::history::ExecutionHistory;
use super::template;

/// How the run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: ExecutionStatus,
    pub error: Option<String>,
}

/// Identity of the execution being driven.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub execution_id: String,
    pub workflow_id: String,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub input: serde_json::Value,
}

/// Why a step will not run. Ordered by precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Doom {
    None,
    Branch,
    Failure,
}

struct RunState {
    remaining: Vec<usize>,
    doom: Vec<Doom>,
    doom_reason: Vec<Option<String>>,
    settled: Vec<bool>,
    branch_taken: HashMap<usize, bool>,
    /// `{ "<stepId>": { "output": ... } }`
    outputs: serde_json::Map<String, serde_json::Value>,
    ready: VecDeque<usize>,
    failure: Option<String>,
}

impl RunState {
    fn new(graph: &StepGraph) -> Self {
        let n = graph.len();
        Self {
            remaining: (0..n).map(|i| graph.deps(i).len()).collect(),
            doom: vec![Doom::None; n],
            doom_reason: vec![None; n],
            settled: vec![false; n],
            branch_taken: HashMap::new(),
            outputs: serde_json::Map::new(),
            ready: graph.roots().into_iter().collect(),
            failure: None,
        }
    }

    fn record_output(&mut self, step_id: &str, output: serde_json::Value) {
        self.outputs
            .insert(step_id.to_string(), serde_json::json!({ "output": output }));
    }

    fn output_of(&self, step_id: &str) -> &serde_json::Value {
        self.outputs
            .get(step_id)
            .and_then(|o| o.get("output"))
            .unwrap_or(&serde_json::Value::Null)
    }
}

pub struct Scheduler {
    run: RunIdentity,
    graph: Arc<StepGraph>,
    mode: OrchestrationMode,
    max_parallelism: usize,
    dispatcher: Arc<StepDispatcher>,
    history: Arc<ExecutionHistory>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        run: RunIdentity,
        graph: Arc<StepGraph>,
        mode: OrchestrationMode,
        max_parallelism: usize,
        dispatcher: Arc<StepDispatcher>,
        history: Arc<ExecutionHistory>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run,
            graph,
            mode,
            max_parallelism: max_parallelism.max(1),
            dispatcher,
            history,
            cancel,
        }
    }

    /// Drive the graph until nothing is runnable and nothing is in flight.
    ///
    /// `Err` means history could not be written; in-flight steps are still
    /// drained before returning.
    pub async fn run(self) -> Result<RunSummary, EngineError> {
        let exec_id = self.run.execution_id.clone();
        tracing::info!(
            "[Scheduler:{}] Running {} step(s) of {} ({:?}, parallelism {})",
            exec_id,
            self.graph.len(),
            self.run.workflow_id,
            self.mode,
            self.max_parallelism
        );

        let mut state = RunState::new(&self.graph);
        let mut in_flight: JoinSet<(usize, Result<StepOutcome, EngineError>)> = JoinSet::new();
        let mut task_steps: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut barrier: Option<usize> = None;
        let mut fatal: Option<EngineError> = None;

        loop {
            while fatal.is_none() && !self.cancel.is_cancelled() {
                let Some(&next) = state.ready.front() else { break };
                if !self.may_start(next, in_flight.len(), barrier) {
                    break;
                }
                state.ready.pop_front();

                let step = self.graph.step(next);
                if matches!(step.kind, StepKind::Branch { .. } | StepKind::Join) {
                    let outcome = self.evaluate_in_place(next, &mut state);
                    if let Err(e) = self.history.append(outcome.clone()).await {
                        fatal = Some(e);
                        break;
                    }
                    if let Err(e) = self.settle(next, outcome, &mut state).await {
                        fatal = Some(e);
                    }
                    continue;
                }

                if self.mode == OrchestrationMode::Hybrid && !step.parallel {
                    barrier = Some(next);
                }
                tracing::debug!("[Scheduler:{}] Dispatching '{}'", exec_id, step.id);
                let step = step.clone();
                let context = self.step_context(&step.id, &state);
                let dispatcher = self.dispatcher.clone();
                let history = self.history.clone();
                let cancel = self.cancel.clone();
                let task = in_flight.spawn(async move {
                    let result = dispatcher.run_step(&step, &context, &history, &cancel).await;
                    (next, result)
                });
                task_steps.insert(task.id(), next);
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            match joined {
                Ok((task, (idx, result))) => {
                    task_steps.remove(&task);
                    if barrier == Some(idx) {
                        barrier = None;
                    }
                    match result {
                        Ok(outcome) if fatal.is_none() => {
                            if let Err(e) = self.settle(idx, outcome, &mut state).await {
                                fatal = Some(e);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            fatal.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!("[Scheduler:{}] Step task aborted: {}", exec_id, e);
                    let Some(idx) = task_steps.remove(&e.id()) else {
                        continue;
                    };
                    if barrier == Some(idx) {
                        barrier = None;
                    }
                    if fatal.is_some() {
                        continue;
                    }
                    if let Err(err) = self.record_lost(idx, &e.to_string(), &mut state).await {
                        fatal = Some(err);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            tracing::error!("[Scheduler:{}] History write failed: {}", exec_id, e);
            return Err(e);
        }

        let unsettled = state.settled.iter().any(|s| !s);
        let summary = if self.cancel.is_cancelled() && unsettled {
            RunSummary { status: ExecutionStatus::Cancelled, error: None }
        } else if let Some(reason) = state.failure.take() {
            RunSummary { status: ExecutionStatus::Failed, error: Some(reason) }
        } else {
            RunSummary { status: ExecutionStatus::Completed, error: None }
        };
        tracing::info!("[Scheduler:{}] Finished: {}", exec_id, summary.status);
        Ok(summary)
    }

    /// A step task that died without reporting still gets a `failure`
    /// outcome, so its dependents are settled like any other failure.
    async fn record_lost(
        &self,
        idx: usize,
        reason: &str,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let step_id = &self.graph.step(idx).id;
        let attempt = self
            .history
            .results()
            .await
            .get(step_id)
            .map_or(1, |previous| previous.attempt + 1);
        let outcome = StepOutcome::failure(
            step_id,
            format!("step task aborted: {}", reason),
            chrono::Utc::now(),
            attempt,
        );
        self.history.append(outcome.clone()).await?;
        self.settle(idx, outcome, state).await
    }

    fn may_start(&self, next: usize, in_flight: usize, barrier: Option<usize>) -> bool {
        if barrier.is_some() {
            return false;
        }
        match self.mode {
            OrchestrationMode::Agent => in_flight == 0,
            OrchestrationMode::Agentic => in_flight < self.max_parallelism,
            OrchestrationMode::Hybrid => {
                if self.graph.step(next).parallel {
                    in_flight < self.max_parallelism
                } else {
                    in_flight == 0
                }
            }
        }
    }

    fn step_context(&self, step_id: &str, state: &RunState) -> StepContext {
        let steps = serde_json::Value::Object(state.outputs.clone());
        StepContext {
            template: serde_json::json!({ "input": self.run.input, "steps": steps }),
            agent: AgentContext {
                execution_id: self.run.execution_id.clone(),
                workflow_id: self.run.workflow_id.clone(),
                step_id: step_id.to_string(),
                session_id: self.run.session_id.clone(),
                user_id: self.run.user_id.clone(),
                input: self.run.input.clone(),
                steps,
            },
        }
    }

    fn evaluate_in_place(&self, idx: usize, state: &mut RunState) -> StepOutcome {
        let step = self.graph.step(idx);
        let started_at = chrono::Utc::now();
        let output = match &step.kind {
            StepKind::Branch { condition, .. } => {
                let upstream = state.output_of(&condition.step);
                let value = match condition.path.as_deref() {
                    Some(path) => template::lookup(upstream, path).unwrap_or(&serde_json::Value::Null),
                    None => upstream,
                };
                let taken = match &condition.equals {
                    Some(expected) => value == expected,
                    None => truthy(value),
                };
                state.branch_taken.insert(idx, taken);
                tracing::debug!("[Scheduler:{}] Branch '{}' -> {}", self.run.execution_id, step.id, taken);
                serde_json::json!({ "result": taken })
            }
            _ => {
                let upstream: serde_json::Map<String, serde_json::Value> = self
                    .graph
                    .deps(idx)
                    .iter()
                    .map(|&d| {
                        let id = &self.graph.step(d).id;
                        (id.clone(), state.output_of(id).clone())
                    })
                    .collect();
                serde_json::Value::Object(upstream)
            }
        };
        StepOutcome::success(&step.id, output, started_at, 1)
    }

    /// Fold a terminal outcome into the ready tracking, recording `skipped`
    /// for every dependent it dooms.
    async fn settle(
        &self,
        idx: usize,
        outcome: StepOutcome,
        state: &mut RunState,
    ) -> Result<(), EngineError> {
        let mut pending = vec![(idx, outcome)];
        while let Some((i, outcome)) = pending.pop() {
            state.settled[i] = true;
            let step = self.graph.step(i);

            let (cascade, reason) = match outcome.status {
                StepStatus::Success => {
                    state.record_output(&step.id, outcome.output);
                    (Doom::None, None)
                }
                StepStatus::Failure if step.required => {
                    let error = outcome.error.unwrap_or_default();
                    state
                        .failure
                        .get_or_insert_with(|| format!("step '{}' failed: {}", step.id, error));
                    (Doom::Failure, Some(format!("upstream step '{}' failed", step.id)))
                }
                StepStatus::Failure => {
                    tracing::info!(
                        "[Scheduler:{}] Best-effort step '{}' failed; continuing",
                        self.run.execution_id,
                        step.id
                    );
                    state.record_output(&step.id, serde_json::Value::Null);
                    (Doom::None, None)
                }
                StepStatus::Skipped => (state.doom[i], state.doom_reason[i].clone()),
            };

            let not_taken: &[String] = match (&step.kind, state.branch_taken.get(&i)) {
                (StepKind::Branch { when_true, when_false, .. }, Some(&taken)) => {
                    if taken {
                        when_false
                    } else {
                        when_true
                    }
                }
                _ => &[],
            };

            for &d in self.graph.dependents(i) {
                let dependent = self.graph.step(d);
                let (mut edge, mut edge_reason) = (cascade, reason.clone());
                if edge == Doom::None && not_taken.contains(&dependent.id) {
                    edge = Doom::Branch;
                    edge_reason = Some(format!("branch '{}' did not select this step", step.id));
                }
                if edge == Doom::Branch && dependent.is_join() {
                    edge = Doom::None;
                }
                if edge > state.doom[d] {
                    state.doom[d] = edge;
                    state.doom_reason[d] = edge_reason;
                }

                state.remaining[d] -= 1;
                if state.remaining[d] > 0 {
                    continue;
                }
                if state.doom[d] == Doom::None {
                    state.ready.push_back(d);
                } else {
                    let why = state.doom_reason[d].clone().unwrap_or_default();
                    let skipped = StepOutcome::skipped(&dependent.id, why);
                    self.history.append(skipped.clone()).await?;
                    pending.push((d, skipped));
                }
            }
        }
        Ok(())
    }
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(items) => !items.is_empty(),
        serde_json::Value::Object(map) => !map.is_empty(),
    }
}
