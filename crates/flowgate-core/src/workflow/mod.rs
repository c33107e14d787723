//! Workflow engine — DAG step scheduling over tool servers and agents.
//!
//! # Architecture
//!
//! ```text
//! workflow.yaml ──► WorkflowDefinition ──► StepGraph (validated arena)
//!                                              │
//!                   WorkflowEngine ──────► Scheduler (one per execution)
//!                                              │
//!                                        StepDispatcher
//!                                         │          │
//!                               ConnectionManager   AgentExecutor
//!                                              │
//!                                       ExecutionHistory ──► Storage
//! ```

pub mod agent;
pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod history;
pub mod scheduler;
pub mod template;

pub use agent::{AgentContext, AgentExecutor, UnconfiguredAgent};
pub use dispatch::{StepContext, StepDispatcher};
pub use engine::WorkflowEngine;
pub use graph::StepGraph;
pub use history::ExecutionHistory;
pub use scheduler::{RunIdentity, RunSummary, Scheduler};
