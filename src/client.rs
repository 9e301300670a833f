//! `ServerClient`: binds one `ProcessHandle` + `StdioTransport` +
//! `ProtocolHandler` and exposes the pull-based `connect`/`disconnect`/
//! `callTool`/`listTools`/`status` API a `ConnectionPool` drives (spec §4.3).

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::{ServerConfig, TransportKind};
use crate::error::GatewayError;
use crate::events::{Event, EventPayload, SharedEventSink};
use crate::process::{ProcessHandle, ProcessManager};
use crate::protocol::{ProtocolHandler, ToolDefinitionWire};
use crate::transport::{ChildStdioTransport, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub server_id: String,
    pub status: ServerConnectionStatus,
    pub last_connected: Option<Instant>,
    pub last_error: Option<String>,
    pub tool_count: usize,
    pub response_time_ms: Option<u64>,
}

struct ClientState {
    process: Option<ProcessHandle>,
    protocol: Option<Arc<ProtocolHandler>>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
    last_response_time_ms: Option<u64>,
}

/// One managed connection to one MCP server. `ConnectionPool` holds several
/// of these per server; they all share one `CircuitBreaker` since a breaker
/// guards the server as a whole, not an individual connection attempt.
pub struct ServerClient {
    config: ServerConfig,
    breaker: Arc<CircuitBreaker>,
    events: SharedEventSink,
    state: Mutex<ClientState>,
}

impl ServerClient {
    pub fn new(config: ServerConfig, breaker: Arc<CircuitBreaker>, events: SharedEventSink) -> Self {
        ServerClient {
            config,
            breaker,
            events,
            state: Mutex::new(ClientState {
                process: None,
                protocol: None,
                connected_at: None,
                last_error: None,
                last_response_time_ms: None,
            }),
        }
    }

    fn is_connected_locked(state: &mut ClientState) -> bool {
        let protocol_active = state.protocol.as_ref().map(|p| p.is_active()).unwrap_or(false);
        let process_alive = state.process.as_mut().map(|p| p.is_alive()).unwrap_or(false);
        protocol_active && process_alive
    }

    /// Spawn the process, wire up the transport for the server's configured
    /// framing, and perform the `initialize` handshake. Idempotent: a call on
    /// an already-connected client is a no-op. Checks the circuit breaker
    /// first and fails fast without spawning anything if it is OPEN.
    pub async fn connect(&self) -> crate::Result<()> {
        let mut state = self.state.lock().await;
        if Self::is_connected_locked(&mut state) {
            return Ok(());
        }

        self.breaker.try_acquire().await?;

        if self.config.transport == TransportKind::Http {
            self.breaker.record_failure().await;
            let err = GatewayError::Transport(self.config.name.clone(), "HTTP transport is not implemented".into());
            state.last_error = Some(err.to_string());
            return Err(err);
        }

        let manager = ProcessManager::new();
        let mut process = match manager.spawn(&self.config) {
            Ok(p) => p,
            Err(e) => {
                self.breaker.record_failure().await;
                state.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        let stdout = process.stdout.take();
        let stdin = process.stdin.take();
        let (stdout, stdin) = match (stdout, stdin) {
            (Some(o), Some(i)) => (o, i),
            _ => {
                self.breaker.record_failure().await;
                process.terminate().await;
                let err = GatewayError::Transport(self.config.name.clone(), "missing stdio pipes".into());
                state.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let transport: Arc<dyn Transport> =
            Arc::new(ChildStdioTransport::new(self.config.name.clone(), stdout, stdin, self.config.framing));
        let protocol = ProtocolHandler::new(self.config.name.clone());

        let handshake: crate::Result<()> = async {
            protocol.start(transport).await?;
            protocol.initialize("nimbus-gateway", env!("CARGO_PKG_VERSION"), self.config.timeout_ms).await?;
            Ok(())
        }
        .await;

        match handshake {
            Ok(()) => {
                self.breaker.record_success().await;
                state.process = Some(process);
                state.protocol = Some(protocol);
                state.connected_at = Some(Instant::now());
                state.last_error = None;
                self.events
                    .emit(Event::new("client", EventPayload::ComponentInitialized { component: format!("client:{}", self.config.name) }));
                Ok(())
            }
            Err(e) => {
                self.breaker.record_failure().await;
                protocol.stop().await;
                process.terminate().await;
                state.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// SIGTERM-then-SIGKILL the child and release the transport/protocol.
    /// Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        if let Some(protocol) = state.protocol.take() {
            protocol.stop().await;
        }
        if let Some(mut process) = state.process.take() {
            process.terminate().await;
        }
        state.connected_at = None;
    }

    pub async fn is_connected(&self) -> bool {
        let mut state = self.state.lock().await;
        Self::is_connected_locked(&mut state)
    }

    pub async fn list_tools(&self) -> crate::Result<Vec<ToolDefinitionWire>> {
        self.breaker.try_acquire().await?;
        let protocol = {
            let mut state = self.state.lock().await;
            if !Self::is_connected_locked(&mut state) {
                return Err(GatewayError::Lifecycle(format!("server '{}' not connected", self.config.name)));
            }
            state.protocol.clone().unwrap()
        };

        let result = protocol.list_tools(self.config.timeout_ms).await;
        self.record_outcome(&result).await;
        result
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> crate::Result<Value> {
        self.breaker.try_acquire().await?;
        let protocol = {
            let mut state = self.state.lock().await;
            if !Self::is_connected_locked(&mut state) {
                return Err(GatewayError::Lifecycle(format!("server '{}' not connected", self.config.name)));
            }
            state.protocol.clone().unwrap()
        };

        let start = Instant::now();
        let result = protocol.call_tool(name, arguments, self.config.timeout_ms).await;
        let elapsed = start.elapsed().as_millis() as u64;
        self.state.lock().await.last_response_time_ms = Some(elapsed);
        self.record_outcome(&result).await;
        result
    }

    async fn record_outcome<T>(&self, result: &crate::Result<T>) {
        match result {
            Ok(_) => self.breaker.record_success().await,
            Err(e) if e.is_retryable() => self.breaker.record_failure().await,
            Err(_) => {} // tool-level protocol errors don't indicate server unreachability
        }
    }

    pub async fn status(&self) -> ServerStatus {
        let mut state = self.state.lock().await;
        let connected = Self::is_connected_locked(&mut state);
        ServerStatus {
            server_id: self.config.name.clone(),
            status: if connected {
                ServerConnectionStatus::Connected
            } else if state.last_error.is_some() {
                ServerConnectionStatus::Error
            } else {
                ServerConnectionStatus::Disconnected
            },
            last_connected: state.connected_at,
            last_error: state.last_error.clone(),
            tool_count: 0,
            response_time_ms: state.last_response_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::events::noop_sink;
    use crate::test_support::{broken_server_config, fake_server_config, unresponsive_server_config};

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("srv", CircuitBreakerConfig::default()))
    }

    #[tokio::test]
    async fn test_connect_and_call_tool_against_fake_server() {
        let config = fake_server_config("srv");
        let client = ServerClient::new(config, breaker(), noop_sink());
        client.connect().await.expect("connect should succeed");
        assert!(client.is_connected().await);

        let tools = client.list_tools().await.expect("list_tools");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = client.call_tool("echo", serde_json::json!({"text": "hi"})).await.expect("call_tool");
        assert_eq!(result["output"], serde_json::json!("ok"));

        client.disconnect().await;
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_records_circuit_breaker_failure() {
        let config = broken_server_config("srv");
        let breaker = breaker();
        let client = ServerClient::new(config, breaker.clone(), noop_sink());
        let result = client.connect().await;
        assert!(result.is_err());
        assert_eq!(breaker.snapshot().await.failure_count, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_disconnects_cleanly() {
        let config = unresponsive_server_config("srv");
        let client = ServerClient::new(config, breaker(), noop_sink());
        let result = client.connect().await;
        assert!(matches!(result, Err(GatewayError::Timeout(_))));
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_call_tool_before_connect_is_lifecycle_error() {
        let config = fake_server_config("srv");
        let client = ServerClient::new(config, breaker(), noop_sink());
        let result = client.call_tool("echo", serde_json::json!({})).await;
        assert!(matches!(result, Err(GatewayError::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_http_transport_is_rejected_without_spawning() {
        let mut config = fake_server_config("srv");
        config.transport = TransportKind::Http;
        let client = ServerClient::new(config, breaker(), noop_sink());
        let result = client.connect().await;
        assert!(matches!(result, Err(GatewayError::Transport(_, _))));
    }
}
