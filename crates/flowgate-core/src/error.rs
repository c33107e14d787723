//! Core error type for the flowgate engine.
//!
//! `EngineError` is used throughout the core domain (connections, stores,
//! scheduler). Payloads are plain strings so the error is `Clone` and can be
//! recorded inside step outcomes and handed to several waiters.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server not connected: {0}")]
    NotConnected(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Remote error [{code}]: {message}")]
    Remote { code: i64, message: String },

    #[error("Concurrent operation: {0}")]
    ConcurrentOperation(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Transient failures are worth another attempt by the scheduler.
    /// Everything else (bad input, business errors, exclusivity) is final.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_) | EngineError::Transport(_) | EngineError::ConnectionClosed(_)
        )
    }

    /// Short machine-friendly label, used in persisted outcomes and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Connection(_) => "connection",
            EngineError::Transport(_) => "transport",
            EngineError::NotConnected(_) => "not_connected",
            EngineError::ConnectionClosed(_) => "connection_closed",
            EngineError::Timeout(_) => "timeout",
            EngineError::Remote { .. } => "remote",
            EngineError::ConcurrentOperation(_) => "concurrent_operation",
            EngineError::Agent(_) => "agent",
            EngineError::Storage(_) => "storage",
        }
    }
}
