//! `ProtocolHandler`: JSON-RPC request/response correlation, the
//! `initialize` handshake, and incoming-message classification (spec §4.2).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};

use crate::error::GatewayError;
use crate::transport::Transport;

/// Default per-call deadline when a caller doesn't specify one (spec §6).
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Server-reported handshake result, kept for status reporting.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolInfo {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(rename = "serverInfo", default)]
    pub server_info: Option<Value>,
}

/// A tool definition as it appears on the wire from `tools/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolDefinitionWire {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
    #[serde(rename = "outputSchema", default)]
    pub output_schema: Option<Value>,
}

/// Invoked when an inbound message has no `id` (a notification).
pub type NotificationHandler = Arc<dyn Fn(String, Option<Value>) + Send + Sync>;

/// Invoked when the remote end sends us a request (`id` + `method`, no
/// `result`/`error`). Returning `Err` sends back a JSON-RPC error object.
pub type RequestHandler =
    Arc<dyn Fn(String, Option<Value>) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

struct PendingEntry {
    tx: oneshot::Sender<crate::Result<Value>>,
}

/// Owns id allocation, the pending-request table, and dispatch of inbound
/// messages for a single server connection. One handler per `ServerClient`.
pub struct ProtocolHandler {
    server_id: String,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<i64, PendingEntry>>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    request_handler: Mutex<Option<RequestHandler>>,
}

impl ProtocolHandler {
    pub fn new(server_id: impl Into<String>) -> Arc<Self> {
        Arc::new(ProtocolHandler {
            server_id: server_id.into(),
            transport: Mutex::new(None),
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            notification_handler: Mutex::new(None),
            request_handler: Mutex::new(None),
        })
    }

    pub async fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.notification_handler.lock().await = Some(handler);
    }

    pub async fn set_request_handler(&self, handler: RequestHandler) {
        *self.request_handler.lock().await = Some(handler);
    }

    /// Wires the transport's read loop into this handler's dispatch, then
    /// stores the transport for outbound sends.
    pub async fn start(self: &Arc<Self>, transport: Arc<dyn Transport>) -> crate::Result<()> {
        let handler_for_msg = self.clone();
        let message_handler: crate::transport::MessageHandler = Arc::new(move |value| {
            let handler = handler_for_msg.clone();
            tokio::spawn(async move { handler.handle_incoming(value).await });
        });

        let server_id = self.server_id.clone();
        let error_handler: crate::transport::ErrorHandler = Arc::new(move |msg| {
            tracing::warn!(server = %server_id, error = %msg, "transport read error");
        });

        transport.start(message_handler, error_handler).await?;
        *self.transport.lock().await = Some(transport);
        Ok(())
    }

    async fn handle_incoming(self: Arc<Self>, value: Value) {
        let id = value.get("id").cloned();
        let has_result_or_error = value.get("result").is_some() || value.get("error").is_some();
        let method = value.get("method").and_then(|m| m.as_str()).map(|s| s.to_string());

        if let (Some(id_val), true) = (id.clone(), has_result_or_error) {
            self.handle_response(id_val, value).await;
        } else if let (None, Some(method)) = (id.clone(), method.clone()) {
            self.handle_notification(method, value).await;
        } else if let (Some(id_val), Some(method)) = (id, method) {
            self.handle_incoming_request(id_val, method, value).await;
        } else {
            tracing::debug!(server = %self.server_id, "dropped unclassifiable message");
        }
    }

    async fn handle_response(&self, id_val: Value, value: Value) {
        let Some(id) = id_val.as_i64() else {
            tracing::debug!(server = %self.server_id, "response with non-integer id ignored");
            return;
        };
        let entry = self.pending.lock().await.remove(&id);
        if let Some(entry) = entry {
            let result = if let Some(err) = value.get("error") {
                Err(GatewayError::Protocol(self.server_id.clone(), err.to_string()))
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = entry.tx.send(result);
        }
    }

    async fn handle_notification(&self, method: String, value: Value) {
        let handler = self.notification_handler.lock().await.clone();
        if let Some(handler) = handler {
            let params = value.get("params").cloned();
            handler(method, params);
        }
    }

    async fn handle_incoming_request(&self, id_val: Value, method: String, value: Value) {
        let params = value.get("params").cloned();
        let handler = self.request_handler.lock().await.clone();

        let reply = match handler {
            Some(h) => match h(method, params).await {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id_val, "result": result}),
                Err(msg) => json!({
                    "jsonrpc": "2.0",
                    "id": id_val,
                    "error": {"code": -32603, "message": msg},
                }),
            },
            None => json!({
                "jsonrpc": "2.0",
                "id": id_val,
                "error": {"code": -32601, "message": "Method not found"},
            }),
        };

        if let Some(transport) = self.transport.lock().await.clone() {
            let _ = transport.send(&reply).await;
        }
    }

    /// Send a request and await its matching response, or time out.
    pub async fn send_request(
        self: &Arc<Self>,
        method: &str,
        params: Option<Value>,
        timeout_ms: u64,
    ) -> crate::Result<Value> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Lifecycle(format!("protocol handler for '{}' not started", self.server_id)))?;

        if timeout_ms == 0 {
            return Err(GatewayError::Timeout(self.server_id.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, PendingEntry { tx });

        let request = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});

        if let Err(e) = transport.send(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::Lifecycle(format!("protocol handler for '{}' stopped", self.server_id))),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(self.server_id.clone()))
            }
        }
    }

    pub async fn send_notification(&self, method: &str, params: Option<Value>) -> crate::Result<()> {
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or_else(|| GatewayError::Lifecycle(format!("protocol handler for '{}' not started", self.server_id)))?;
        let notification = json!({"jsonrpc": "2.0", "method": method, "params": params});
        transport.send(&notification).await
    }

    /// Perform the `initialize`/`notifications/initialized` handshake.
    pub async fn initialize(self: &Arc<Self>, client_name: &str, client_version: &str, timeout_ms: u64) -> crate::Result<ProtocolInfo> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"roots": {"listRoots": false}, "sampling": {}},
            "clientInfo": {"name": client_name, "version": client_version},
        });
        let result = self.send_request("initialize", Some(params), timeout_ms).await?;
        let info: ProtocolInfo = serde_json::from_value(result)
            .map_err(|e| GatewayError::Protocol(self.server_id.clone(), e.to_string()))?;
        self.send_notification("notifications/initialized", None).await?;
        Ok(info)
    }

    pub async fn list_tools(self: &Arc<Self>, timeout_ms: u64) -> crate::Result<Vec<ToolDefinitionWire>> {
        let result = self.send_request("tools/list", Some(json!({})), timeout_ms).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| GatewayError::Protocol(self.server_id.clone(), e.to_string()))
    }

    pub async fn call_tool(self: &Arc<Self>, name: &str, arguments: Value, timeout_ms: u64) -> crate::Result<Value> {
        let params = json!({"name": name, "arguments": arguments});
        self.send_request("tools/call", Some(params), timeout_ms).await
    }

    /// Fail every pending request and release the transport.
    pub async fn stop(&self) {
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            let _ = entry.tx.send(Err(GatewayError::Lifecycle(format!(
                "protocol handler for '{}' stopped",
                self.server_id
            ))));
        }
        drop(pending);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.stop().await;
        }
    }

    pub fn is_active(&self) -> bool {
        // Checked via try_lock so status queries never block on an in-flight
        // send/receive; a locked transport mutex means work is in progress,
        // which itself implies liveness.
        match self.transport.try_lock() {
            Ok(guard) => guard.as_ref().map(|t| t.is_active()).unwrap_or(false),
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::StdioTransport;
    use crate::config::FramingKind;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, BufReader, AsyncBufReadExt};

    async fn connected_pair() -> (Arc<ProtocolHandler>, tokio::io::DuplexStream) {
        let (client_side, server_side) = duplex(8192);
        let (read_half, write_half) = tokio::io::split(client_side);
        let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new("srv", read_half, write_half, FramingKind::Line));
        let handler = ProtocolHandler::new("srv");
        handler.start(transport).await.unwrap();
        (handler, server_side)
    }

    #[tokio::test]
    async fn test_send_request_matches_response_by_id() {
        let (handler, mut server_side) = connected_pair().await;

        let fake_server = tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server_side);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].clone();
            let response = json!({"jsonrpc": "2.0", "id": id, "result": {"ok": true}});
            server_side.write_all(format!("{response}\n").as_bytes()).await.unwrap();
            server_side
        });

        let result = handler.send_request("ping", None, 1000).await.unwrap();
        assert_eq!(result["ok"], json!(true));
        fake_server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_request_times_out_with_no_response() {
        let (handler, _server_side) = connected_pair().await;
        let result = handler.send_request("ping", None, 30).await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_zero_timeout_fails_without_sending() {
        let (handler, mut server_side) = connected_pair().await;
        let result = handler.send_request("ping", None, 0).await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));

        // Nothing should have been written to the wire.
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_millis(20), server_side.read(&mut buf)).await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_error_response_maps_to_protocol_error() {
        let (handler, mut server_side) = connected_pair().await;

        tokio::spawn(async move {
            let mut reader = BufReader::new(&mut server_side);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].clone();
            let response = json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": "boom"}});
            server_side.write_all(format!("{response}\n").as_bytes()).await.unwrap();
        });

        let result = handler.send_request("tools/call", None, 1000).await;
        assert!(matches!(result, Err(GatewayError::Protocol(_, _))));
    }

    #[tokio::test]
    async fn test_notification_without_id_invokes_handler() {
        let (handler, mut server_side) = connected_pair().await;
        let received: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        handler
            .set_notification_handler(Arc::new(move |method, _params| {
                received_clone.lock().unwrap().push(method);
            }))
            .await;

        let notification = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}});
        server_side.write_all(format!("{notification}\n").as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(received.lock().unwrap().as_slice(), ["notifications/progress"]);
    }

    #[tokio::test]
    async fn test_stop_fails_pending_requests() {
        let (handler, _server_side) = connected_pair().await;
        let handler_clone = handler.clone();
        let call = tokio::spawn(async move { handler_clone.send_request("ping", None, 5000).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handler.stop().await;
        let result = call.await.unwrap();
        assert!(matches!(result, Err(GatewayError::Lifecycle(_))));
    }
}
