//! Local-process transport: newline-delimited JSON-RPC over a child's stdio.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};

use super::{TransportError, TransportSession};

/// Inbound frames buffered between the stdout reader and the demultiplexer.
const INBOUND_BUFFER: usize = 256;

pub struct StdioTransport {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
}

impl StdioTransport {
    /// Spawn the server process and start the background stdout/stderr readers.
    ///
    /// The returned receiver yields one trimmed stdout line per frame and ends
    /// when the process closes its stdout (normally: when it exits).
    pub async fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<(Self, mpsc::Receiver<String>), TransportError> {
        tracing::info!(
            "[StdioTransport:{}] Spawning: {} {}",
            name,
            command,
            args.join(" ")
        );

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Process(format!("Failed to spawn '{}': {}", command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Process("No stdin on child process".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Process("No stdout on child process".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let name = name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::debug!("[StdioTransport:{} stderr] {}", name, line);
                    }
                }
            });
        }

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let reader_name = name.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if tx.send(line.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[StdioTransport:{}] stdout read failed: {}", reader_name, e);
                        break;
                    }
                }
            }
            tracing::info!("[StdioTransport:{}] stdout closed", reader_name);
        });

        Ok((
            Self {
                name: name.to_string(),
                stdin: Mutex::new(Some(stdin)),
                child: Mutex::new(Some(child)),
            },
            rx,
        ))
    }
}

#[async_trait]
impl TransportSession for StdioTransport {
    async fn send(&self, frame: String) -> Result<Option<String>, TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(frame.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(None)
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping stdin gives well-behaved servers a chance to exit on EOF.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("[StdioTransport:{}] kill: {}", self.name, e);
            }
        }
        tracing::info!("[StdioTransport:{}] Closed", self.name);
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lines_round_trip_through_cat() {
        let (transport, mut inbound) =
            StdioTransport::spawn("cat", "cat", &[], &HashMap::new(), None)
                .await
                .unwrap();

        transport.send(r#"{"id":1}"#.to_string()).await.unwrap();
        transport.send(r#"{"id":2}"#.to_string()).await.unwrap();
        assert_eq!(inbound.recv().await.as_deref(), Some(r#"{"id":1}"#));
        assert_eq!(inbound.recv().await.as_deref(), Some(r#"{"id":2}"#));

        transport.close().await.unwrap();
        assert_eq!(inbound.recv().await, None);
        assert!(matches!(
            transport.send("{}".to_string()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_process_exit_ends_stream() {
        let (_transport, mut inbound) = StdioTransport::spawn(
            "short-lived",
            "sh",
            &["-c".to_string(), "echo hello".to_string()],
            &HashMap::new(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(inbound.recv().await.as_deref(), Some("hello"));
        assert_eq!(inbound.recv().await, None);
    }
}
