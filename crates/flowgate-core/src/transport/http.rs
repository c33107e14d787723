//! Remote-endpoint transport: one HTTP POST per frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::{header, Client};

use super::{TransportError, TransportSession};

pub struct HttpTransport {
    name: String,
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    closed: AtomicBool,
}

impl HttpTransport {
    /// Build the client. No network I/O happens until the first `send`.
    pub fn new(
        name: &str,
        url: &str,
        headers: HashMap<String, String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            client,
            url: url.to_string(),
            headers,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl TransportSession for HttpTransport {
    async fn send(&self, frame: String) -> Result<Option<String>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut req = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        for (key, value) in &self.headers {
            req = req.header(key, value);
        }

        let response = req
            .body(frame)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP {}: {}", status, body)));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        // Notifications are acknowledged with an empty body (202).
        if body.trim().is_empty() {
            return Ok(None);
        }
        tracing::trace!("[HttpTransport:{}] <- {}", self.name, body);
        Ok(Some(body.trim().to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
