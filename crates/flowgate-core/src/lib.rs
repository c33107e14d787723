//! Flowgate Core — tool-server connections and durable workflow execution.
//!
//! This crate holds the engine itself: the connection manager for external
//! tool servers (stdio processes or HTTP endpoints speaking JSON-RPC), the
//! tool registry, and the workflow engine that schedules step graphs over
//! them and records every outcome in SQLite. It has no front end of its
//! own; `flowgate-cli` drives it from the command line.

pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod store;
pub mod transport;
pub mod workflow;

#[cfg(test)]
mod testing;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::EngineError;
pub use state::{AppState, AppStateInner};
