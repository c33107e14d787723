//! ServerSession — request/response multiplexing over one transport session.
//!
//! Each request gets a fresh correlation id and a slot in the pending table.
//! The slot is resolved exactly once: by the matching answer, by the
//! caller's timeout, or by the session closing. Whoever removes the slot
//! from the table owns the resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::protocol::{self, Inbound, RpcRequest};
use crate::transport::{OpenedSession, TransportSession};

type Resolution = Result<serde_json::Value, EngineError>;

/// One in-flight exchange.
pub struct PendingRequest {
    pub method: String,
    pub issued_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    tx: oneshot::Sender<Resolution>,
}

/// Correlation id → pending slot. Critical sections never await.
#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    inner: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

impl PendingTable {
    fn insert(&self, id: u64, request: PendingRequest) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, request);
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn drain(&self) -> Vec<(u64, PendingRequest)> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn contains(&self, id: u64) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// Removes an abandoned slot when the requesting future is dropped
/// (for example when a step timeout fires around it).
struct SlotGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

pub struct ServerSession {
    name: String,
    transport: Arc<dyn TransportSession>,
    pending: PendingTable,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    closed: CancellationToken,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ServerSession {
    /// Wrap an opened transport session and start the inbound demultiplexer.
    pub fn start(name: &str, opened: OpenedSession) -> Arc<Self> {
        let pending = PendingTable::default();
        let alive = Arc::new(AtomicBool::new(true));
        let closed = CancellationToken::new();

        let reader = opened.inbound.map(|inbound| {
            tokio::spawn(demultiplex(
                name.to_string(),
                inbound,
                pending.clone(),
                alive.clone(),
                closed.clone(),
            ))
        });

        Arc::new(Self {
            name: name.to_string(),
            transport: opened.session,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            closed,
            reader: Mutex::new(reader),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Fires once the session is gone, whether closed locally or lost.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its answer, the timeout, or session loss.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, EngineError> {
        if !self.is_alive() {
            return Err(EngineError::NotConnected(format!(
                "{} session is closed",
                self.name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = RpcRequest::new(id, method, params)
            .to_frame()
            .map_err(|e| EngineError::Validation(format!("Unencodable params for {}: {}", method, e)))?;

        let (tx, mut rx) = oneshot::channel();
        let issued_at = Utc::now();
        let timeout_at = issued_at
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        self.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at,
                timeout_at,
                tx,
            },
        );
        let _slot = SlotGuard { table: &self.pending, id };

        let exchange = async {
            match self.transport.send(frame).await {
                Ok(Some(reply)) => dispatch_inbound(&self.name, &self.pending, &reply),
                Ok(None) => {}
                Err(e) => return Err(EngineError::from(e)),
            }
            Ok((&mut rx).await)
        };

        let failure = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(Ok(resolution))) => return resolution,
            Ok(Ok(Err(_))) => EngineError::ConnectionClosed(format!(
                "{} dropped request {} (id={})",
                self.name, method, id
            )),
            Ok(Err(send_err)) => send_err,
            Err(_) => EngineError::Timeout(format!(
                "No answer to {} from {} within {}ms (id={})",
                method,
                self.name,
                timeout.as_millis(),
                id
            )),
        };

        if self.pending.take(id).is_some() {
            return Err(failure);
        }
        // Resolved concurrently with the failure above; that resolution wins.
        rx.await.unwrap_or(Err(failure))
    }

    /// Send a notification; no answer is expected.
    pub async fn notify(&self, method: &str) -> Result<(), EngineError> {
        let frame = protocol::notification_frame(method);
        self.transport.send(frame).await.map(|_| ()).map_err(EngineError::from)
    }

    /// Close the session. Every pending request resolves with `ConnectionClosed`.
    pub async fn close(&self, reason: &str) {
        self.alive.store(false, Ordering::SeqCst);
        fail_pending(&self.name, &self.pending, reason);
        if let Err(e) = self.transport.close().await {
            tracing::warn!("[ServerSession:{}] Close failed: {}", self.name, e);
        }
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
        self.closed.cancel();
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, id: u64) -> bool {
        self.pending.contains(id)
    }
}

// ─── Inbound demultiplexing ────────────────────────────────────────────────

async fn demultiplex(
    name: String,
    mut inbound: mpsc::Receiver<String>,
    pending: PendingTable,
    alive: Arc<AtomicBool>,
    closed: CancellationToken,
) {
    while let Some(line) = inbound.recv().await {
        dispatch_inbound(&name, &pending, &line);
    }
    alive.store(false, Ordering::SeqCst);
    fail_pending(&name, &pending, "stream closed");
    tracing::info!("[ServerSession:{}] Inbound stream ended", name);
    closed.cancel();
}

fn dispatch_inbound(name: &str, pending: &PendingTable, line: &str) {
    match protocol::classify(line) {
        Inbound::Response { id, outcome } => match pending.take(id) {
            Some(slot) => {
                let resolution = outcome.map_err(|e| EngineError::Remote {
                    code: e.code,
                    message: e.message,
                });
                let _ = slot.tx.send(resolution);
            }
            None => {
                tracing::warn!(
                    "[ServerSession:{}] Dropping response with unknown id {}",
                    name,
                    id
                );
            }
        },
        Inbound::Notification { method } => {
            tracing::debug!("[ServerSession:{}] Notification: {}", name, method);
        }
        Inbound::Request { id, method } => {
            tracing::debug!(
                "[ServerSession:{}] Ignoring server request {} (id={})",
                name,
                method,
                id
            );
        }
        Inbound::Malformed(reason) => {
            tracing::debug!(
                "[ServerSession:{}] Unrecognised frame ({}): {}",
                name,
                reason,
                preview(line, 200)
            );
        }
    }
}

/// At most `max` bytes of `line`, cut on a char boundary.
fn preview(line: &str, max: usize) -> &str {
    if line.len() <= max {
        return line;
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

fn fail_pending(name: &str, pending: &PendingTable, reason: &str) {
    let drained = pending.drain();
    if !drained.is_empty() {
        tracing::info!(
            "[ServerSession:{}] Failing {} pending request(s): {}",
            name,
            drained.len(),
            reason
        );
    }
    for (id, slot) in drained {
        let _ = slot.tx.send(Err(EngineError::ConnectionClosed(format!(
            "{}: {} (id={}) {}",
            name, slot.method, id, reason
        ))));
    }
}
