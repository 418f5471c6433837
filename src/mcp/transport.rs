//! Transports for external tool servers.
//!
//! Both transports move one JSON message per call: stdio servers speak
//! newline-delimited JSON over a child process, HTTP servers answer each
//! POST with either a JSON body or a short SSE stream of `data:` lines.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};

use crate::error::TychoError;

/// One-message-at-a-time duplex channel to a tool server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send(&self, message: &str) -> Result<(), TychoError>;
    async fn receive(&self) -> Result<String, TychoError>;
}

/// Child-process transport speaking newline-delimited JSON.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the server process. The child is killed when the transport
    /// is dropped. Must be called from within a tokio runtime.
    pub fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, TychoError> {
        tracing::debug!(command, ?args, "spawning tool server");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                TychoError::Configuration(format!("command not found: {command}"))
            } else {
                TychoError::Io(err)
            }
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TychoError::Protocol("tool server has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TychoError::Protocol("tool server has no stdout".to_string()))?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
        })
    }

    pub async fn is_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(None))
    }
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, message: &str) -> Result<(), TychoError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(message.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn receive(&self) -> Result<String, TychoError> {
        let mut stdout = self.stdout.lock().await;
        loop {
            let mut line = String::new();
            let bytes = stdout.read_line(&mut line).await?;
            if bytes == 0 {
                let mut child = self.child.lock().await;
                return match child.try_wait() {
                    Ok(Some(status)) => Err(TychoError::Protocol(format!(
                        "tool server exited with {status}"
                    ))),
                    _ => Err(TychoError::Protocol(
                        "tool server closed stdout".to_string(),
                    )),
                };
            }

            let line = line.trim();
            // Non-JSON lines are server chatter, skip them.
            if line.starts_with('{') {
                return Ok(line.to_string());
            }
            if !line.is_empty() {
                tracing::debug!(line, "skipping non-JSON server output");
            }
        }
    }
}

/// HTTP transport: each `send` POSTs one message and queues whatever the
/// server answered with, `receive` drains the queue in order.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    inbox_tx: mpsc::UnboundedSender<String>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
        }
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, message: &str) -> Result<(), TychoError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("accept", "application/json, text/event-stream")
            .body(message.to_string())
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await?;

        if content_type.contains("text/event-stream") {
            for line in body.lines() {
                if let Some(payload) = line.strip_prefix("data:") {
                    let payload = payload.trim();
                    if !payload.is_empty() {
                        let _ = self.inbox_tx.send(payload.to_string());
                    }
                }
            }
        } else if !body.trim().is_empty() {
            let _ = self.inbox_tx.send(body.trim().to_string());
        }
        Ok(())
    }

    async fn receive(&self) -> Result<String, TychoError> {
        let mut inbox = self.inbox_rx.lock().await;
        inbox
            .recv()
            .await
            .ok_or_else(|| TychoError::Protocol("transport inbox closed".to_string()))
    }
}
