//! External tool server client.
//!
//! One client per server. Requests are correlated by id through a pending
//! map; a background task drains the transport and resolves the matching
//! waiter, so concurrent requests never race on the read side.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::TychoError;
use crate::mcp::protocol::{
    ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, McpToolDef, ToolCallParams, ToolCallResult, ToolsListResult,
    PROTOCOL_VERSION,
};
use crate::mcp::transport::McpTransport;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type PendingMap = Arc<RwLock<HashMap<i64, oneshot::Sender<Result<Value, TychoError>>>>>;

pub struct McpClient {
    name: String,
    transport: Arc<dyn McpTransport>,
    next_id: AtomicI64,
    pending: PendingMap,
    tools: RwLock<Vec<McpToolDef>>,
    request_timeout: Duration,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl McpClient {
    /// Wrap a transport and start the background receive loop. Must be
    /// called from within a tokio runtime.
    pub fn new(name: impl Into<String>, transport: Arc<dyn McpTransport>) -> Self {
        let name = name.into();
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let recv_transport = transport.clone();
        let recv_pending = pending.clone();
        let recv_name = name.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    received = recv_transport.receive() => match received {
                        Ok(message) => {
                            if let Err(err) = resolve_message(&message, &recv_pending).await {
                                tracing::warn!(server = %recv_name, %err, "bad server message");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(server = %recv_name, %err, "connection lost");
                            let mut pending = recv_pending.write().await;
                            for (_, tx) in pending.drain() {
                                let _ = tx.send(Err(TychoError::Protocol(
                                    "connection lost".to_string(),
                                )));
                            }
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            transport,
            next_id: AtomicI64::new(1),
            pending,
            tools: RwLock::new(Vec::new()),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handshake: `initialize` request followed by the `initialized`
    /// notification. Must complete before any tool call.
    pub async fn initialize(&self) -> Result<InitializeResult, TychoError> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        tracing::debug!(server = %self.name, protocol = %result.protocol_version, "initialized");

        self.notify("notifications/initialized", None).await?;
        Ok(result)
    }

    /// Fetch and cache the server's tool catalog.
    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>, TychoError> {
        let result: ToolsListResult = self.request("tools/list", None).await?;
        tracing::debug!(server = %self.name, tools = result.tools.len(), "listed tools");
        *self.tools.write().await = result.tools.clone();
        Ok(result.tools)
    }

    pub async fn cached_tools(&self) -> Vec<McpToolDef> {
        self.tools.read().await.clone()
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, TychoError> {
        let params = ToolCallParams {
            name: name.to_string(),
            arguments: if arguments.is_null() {
                None
            } else {
                Some(arguments)
            },
        };
        self.request("tools/call", Some(serde_json::to_value(params)?))
            .await
    }

    async fn request<R: for<'de> serde::Deserialize<'de>>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R, TychoError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);
        if let Err(err) = self.transport.send(&json).await {
            self.pending.write().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(serde_json::from_value(value)?),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TychoError::Protocol("request dropped".to_string())),
            Err(_) => {
                self.pending.write().await.remove(&id);
                Err(TychoError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TychoError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification)?;
        self.transport.send(&json).await
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
    }
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient").field("name", &self.name).finish()
    }
}

/// Resolve one incoming message against the pending map. Responses wake
/// their waiter; notifications are logged and dropped.
async fn resolve_message(message: &str, pending: &PendingMap) -> Result<(), TychoError> {
    let response: JsonRpcResponse = serde_json::from_str(message)?;

    if let Some(id) = response.id {
        let mut pending = pending.write().await;
        if let Some(tx) = pending.remove(&id) {
            let outcome = match response.error {
                Some(error) => Err(TychoError::Protocol(format!(
                    "server error {}: {}",
                    error.code, error.message
                ))),
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(outcome);
        }
        return Ok(());
    }

    if let Some(method) = &response.method {
        tracing::debug!(%method, "server notification");
    }
    Ok(())
}
