//! Transport layer: one session per connected tool server.
//!
//! Two shapes exist:
//! - local process: frames are written to the child's stdin and inbound
//!   frames arrive on a background stream (`OpenedSession::inbound`); the
//!   stream ending means the process is gone.
//! - remote endpoint: each frame is one HTTP call and the reply comes back
//!   from `send` directly. There is no inbound stream.

pub mod http;
pub mod stdio;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::models::tool_server::LaunchSpec;

pub use http::HttpTransport;
pub use stdio::StdioTransport;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Process error: {0}")]
    Process(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection closed")]
    Closed,
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => EngineError::ConnectionClosed("transport closed".to_string()),
            other => EngineError::Transport(other.to_string()),
        }
    }
}

/// An open session to one tool server.
#[async_trait]
pub trait TransportSession: Send + Sync {
    /// Write one frame. Request/response transports return the reply frame.
    async fn send(&self, frame: String) -> Result<Option<String>, TransportError>;

    /// Release the session. Closing twice is harmless.
    async fn close(&self) -> Result<(), TransportError>;
}

pub struct OpenedSession {
    pub session: Arc<dyn TransportSession>,
    /// Unsolicited inbound frames; `None` for request/response transports.
    pub inbound: Option<mpsc::Receiver<String>>,
}

/// Opens sessions from launch specs. Swappable so tests can script servers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, server_name: &str, spec: &LaunchSpec)
        -> Result<OpenedSession, TransportError>;
}

/// Spawns child processes and builds HTTP clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(
        &self,
        server_name: &str,
        spec: &LaunchSpec,
    ) -> Result<OpenedSession, TransportError> {
        match spec {
            LaunchSpec::LocalProcess { command, args, env, cwd } => {
                let (transport, inbound) =
                    StdioTransport::spawn(server_name, command, args, env, cwd.as_deref()).await?;
                Ok(OpenedSession {
                    session: Arc::new(transport),
                    inbound: Some(inbound),
                })
            }
            LaunchSpec::RemoteEndpoint { url, headers } => {
                let transport = HttpTransport::new(server_name, url, headers.clone())?;
                Ok(OpenedSession {
                    session: Arc::new(transport),
                    inbound: None,
                })
            }
        }
    }
}
