//! `ToolManager`: the single public façade — initialize servers, execute
//! tools with the retry policy applied, refresh the registry, and report
//! status (spec §4.7).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::circuit_breaker::CircuitBreakerStatus;
use crate::client::ServerStatus;
use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::events::{Event, EventPayload, SharedEventSink};
use crate::pool::ConnectionPool;
use crate::registry::{ToolDefinition, ToolRegistry};
use crate::retry::RetryPolicy;

const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub server_id: String,
    pub tool_id: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub tool_id: String,
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

pub struct ToolManager {
    registry: Arc<ToolRegistry>,
    pool: Arc<ConnectionPool>,
    retry_policy: RetryPolicy,
    events: SharedEventSink,
    initialized: AtomicBool,
}

impl ToolManager {
    pub fn new(pool: Arc<ConnectionPool>, registry: Arc<ToolRegistry>, retry_policy: RetryPolicy, events: SharedEventSink) -> Self {
        ToolManager { registry, pool, retry_policy, events, initialized: AtomicBool::new(false) }
    }

    /// Start every server's pool and list its tools into the registry.
    /// Never fails as a whole — each server's outcome is reported
    /// individually so one bad server doesn't block the rest.
    pub async fn initialize_with_configs(&self, configs: Vec<ServerConfig>) -> Vec<(String, crate::Result<()>)> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            let server_id = config.name.clone();
            let outcome = self.initialize_one(config).await;
            if let Err(ref e) = outcome {
                self.events.emit(Event::new(
                    "manager",
                    EventPayload::ErrorOccurred { context: format!("initialize:{server_id}"), message: e.to_string() },
                ));
            }
            results.push((server_id, outcome));
        }
        self.initialized.store(true, Ordering::SeqCst);
        results
    }

    async fn initialize_one(&self, config: ServerConfig) -> crate::Result<()> {
        let server_id = config.name.clone();
        self.pool.initialize_server(config).await?;
        let tools = self.list_tools_for_server(&server_id).await?;
        for tool in tools {
            self.registry.register_tool(tool);
        }
        Ok(())
    }

    async fn list_tools_for_server(&self, server_id: &str) -> crate::Result<Vec<ToolDefinition>> {
        let handle = self.pool.acquire(server_id, DEFAULT_ACQUIRE_TIMEOUT_MS).await?;
        let wire = handle.client.list_tools().await;
        self.pool.release(server_id, handle.connection_id).await;
        wire.map(|tools| {
            tools
                .into_iter()
                .map(|t| ToolDefinition {
                    server_id: server_id.to_string(),
                    name: t.name,
                    description: t.description.unwrap_or_default(),
                    input_schema: t.input_schema,
                    output_schema: t.output_schema,
                })
                .collect()
        })
    }

    /// Re-list tools for every connected server and atomically replace each
    /// server's entries in the registry.
    pub async fn refresh_tool_registry(&self) -> crate::Result<()> {
        for server_id in self.pool.server_ids() {
            match self.list_tools_for_server(&server_id).await {
                Ok(tools) => self.registry.replace_server_tools(&server_id, tools),
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "tool registry refresh failed for server");
                }
            }
        }
        Ok(())
    }

    /// Execute one tool call with the retry policy applied. Never returns
    /// `Err` for a tool-execution failure — those become `ToolResult{success:
    /// false, ..}`; `Err` is reserved for programmer errors (manager not
    /// initialized, unknown tool id, server/tool mismatch).
    pub async fn execute_tool(&self, call: ToolCall) -> crate::Result<ToolResult> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(GatewayError::Lifecycle("tool manager not initialized".into()));
        }

        let start = Instant::now();
        let tool_id = call.tool_id.clone();

        let definition = self
            .registry
            .get_tool_definition(&tool_id)
            .ok_or_else(|| GatewayError::UnknownTool(tool_id.clone()))?;
        if definition.server_id != call.server_id {
            return Err(GatewayError::ServerMismatch(tool_id, definition.server_id));
        }

        if let Err(e @ GatewayError::CircuitOpen(_)) = self.pool.try_acquire_breaker(&call.server_id).await {
            let elapsed = start.elapsed().as_millis() as u64;
            let result = ToolResult {
                tool_id: tool_id.clone(),
                success: false,
                output: None,
                error: Some(e.to_string()),
                execution_time_ms: elapsed,
            };
            self.emit_executed(&result);
            return Ok(result);
        }

        let pool = self.pool.clone();
        let server_id = call.server_id.clone();
        let name = definition.name.clone();
        let arguments = call.arguments.clone();

        let attempt = self
            .retry_policy
            .execute(|| {
                let pool = pool.clone();
                let server_id = server_id.clone();
                let name = name.clone();
                let arguments = arguments.clone();
                async move {
                    let handle = pool.acquire(&server_id, DEFAULT_ACQUIRE_TIMEOUT_MS).await?;
                    let result = handle.client.call_tool(&name, arguments).await;
                    pool.release(&server_id, handle.connection_id).await;
                    result
                }
            })
            .await;

        let elapsed = start.elapsed().as_millis() as u64;
        let result = match attempt {
            Ok(output) => {
                self.registry.update_tool_usage(&tool_id, elapsed as f64);
                ToolResult { tool_id, success: true, output: Some(output), error: None, execution_time_ms: elapsed }
            }
            Err(e) => ToolResult { tool_id, success: false, output: None, error: Some(e.to_string()), execution_time_ms: elapsed },
        };
        self.emit_executed(&result);
        Ok(result)
    }

    fn emit_executed(&self, result: &ToolResult) {
        self.events.emit(Event::new(
            "manager",
            EventPayload::ToolExecuted {
                tool_id: result.tool_id.clone(),
                success: result.success,
                execution_time_ms: result.execution_time_ms,
            },
        ));
    }

    /// Run a batch of calls concurrently, preserving input order in the
    /// output `Vec`.
    pub async fn execute_batch(&self, calls: Vec<ToolCall>) -> Vec<crate::Result<ToolResult>> {
        let futures = calls.into_iter().map(|call| self.execute_tool(call));
        futures::future::join_all(futures).await
    }

    pub async fn server_status(&self, server_id: &str) -> Option<ServerStatus> {
        let mut status = self.pool.server_status(server_id).await?;
        status.tool_count = self.registry.get_tools_for_server(server_id).len();
        Some(status)
    }

    pub async fn all_server_statuses(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::new();
        for server_id in self.pool.server_ids() {
            if let Some(status) = self.server_status(&server_id).await {
                statuses.push(status);
            }
        }
        statuses
    }

    pub async fn circuit_breaker_status(&self, server_id: &str) -> Option<CircuitBreakerStatus> {
        self.pool.circuit_breaker_status(server_id).await
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn shutdown(&self) {
        self.pool.close_all().await;
        self.initialized.store(false, Ordering::SeqCst);
        self.events
            .emit(Event::new("manager", EventPayload::ComponentShutdown { component: "tool_manager".into() }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::events::noop_sink;
    use crate::test_support::fake_server_config;

    fn tight_pool_config() -> PoolConfig {
        PoolConfig {
            min_connections: 1,
            max_connections: 2,
            idle_timeout_ms: 60_000,
            connection_timeout_ms: 1000,
            health_check_interval_ms: 60_000,
            max_retries: 3,
            ..Default::default()
        }
    }

    fn manager() -> ToolManager {
        let pool = Arc::new(ConnectionPool::new(tight_pool_config(), noop_sink()));
        let registry = Arc::new(ToolRegistry::new());
        ToolManager::new(pool, registry, RetryPolicy::default(), noop_sink())
    }

    #[tokio::test]
    async fn test_initialize_registers_tools() {
        let manager = manager();
        let results = manager.initialize_with_configs(vec![fake_server_config("srv")]).await;
        assert!(results[0].1.is_ok());
        assert_eq!(manager.registry().get_all_tools().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_tool_success() {
        let manager = manager();
        manager.initialize_with_configs(vec![fake_server_config("srv")]).await;

        let result = manager
            .execute_tool(ToolCall { server_id: "srv".into(), tool_id: "srv/echo".into(), arguments: serde_json::json!({"text": "hi"}) })
            .await
            .expect("execute_tool should not error for a known tool");

        assert!(result.success);
        assert_eq!(result.output.unwrap()["output"], serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool_is_error() {
        let manager = manager();
        manager.initialize_with_configs(vec![fake_server_config("srv")]).await;
        let result = manager
            .execute_tool(ToolCall { server_id: "srv".into(), tool_id: "srv/nope".into(), arguments: serde_json::json!({}) })
            .await;
        assert!(matches!(result, Err(GatewayError::UnknownTool(_))));
    }

    #[tokio::test]
    async fn test_execute_before_initialize_is_lifecycle_error() {
        let manager = manager();
        let result = manager
            .execute_tool(ToolCall { server_id: "srv".into(), tool_id: "srv/echo".into(), arguments: serde_json::json!({}) })
            .await;
        assert!(matches!(result, Err(GatewayError::Lifecycle(_))));
    }

    #[tokio::test]
    async fn test_server_mismatch_is_error() {
        let manager = manager();
        manager.initialize_with_configs(vec![fake_server_config("srv")]).await;
        let result = manager
            .execute_tool(ToolCall { server_id: "other".into(), tool_id: "srv/echo".into(), arguments: serde_json::json!({}) })
            .await;
        assert!(matches!(result, Err(GatewayError::ServerMismatch(_, _))));
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovers_after_reset_timeout() {
        use crate::circuit_breaker::{BreakerState, CircuitBreakerConfig};
        use crate::test_support::flaky_then_recovers_server_config;
        use std::time::Duration;

        let pool_config = PoolConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_millis(60),
                half_open_max_calls: 3,
            },
            ..tight_pool_config()
        };
        let pool = Arc::new(ConnectionPool::new(pool_config, noop_sink()));
        let registry = Arc::new(ToolRegistry::new());
        // One attempt per `execute_tool` call, so each call below maps to
        // exactly one breaker-gated `tools/call`, not the default policy's
        // internal retries.
        let retry_policy = RetryPolicy { max_attempts: 1, ..RetryPolicy::default() };
        let manager = ToolManager::new(pool, registry, retry_policy, noop_sink());

        manager
            .initialize_with_configs(vec![flaky_then_recovers_server_config("srv")])
            .await;

        let call = || ToolCall {
            server_id: "srv".into(),
            tool_id: "srv/echo".into(),
            arguments: serde_json::json!({"text": "hi"}),
        };

        // Two timeouts trip the breaker open (failure_threshold=2).
        for _ in 0..2 {
            let result = manager.execute_tool(call()).await.unwrap();
            assert!(!result.success);
        }
        let status = manager.circuit_breaker_status("srv").await.unwrap();
        assert_eq!(status.state, BreakerState::Open);

        // Still inside resetTimeout: fails fast without touching the server.
        let result = manager.execute_tool(call()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("circuit open"));

        tokio::time::sleep(Duration::from_millis(80)).await;

        // resetTimeout has elapsed: this call transitions through HALF_OPEN
        // and, since the fake server now answers, closes the breaker again.
        let result = manager.execute_tool(call()).await.unwrap();
        assert!(result.success);
        let status = manager.circuit_breaker_status("srv").await.unwrap();
        assert_eq!(status.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_execute_batch_preserves_order() {
        let manager = manager();
        manager.initialize_with_configs(vec![fake_server_config("srv")]).await;
        let calls = vec![
            ToolCall { server_id: "srv".into(), tool_id: "srv/echo".into(), arguments: serde_json::json!({}) },
            ToolCall { server_id: "srv".into(), tool_id: "srv/nope".into(), arguments: serde_json::json!({}) },
        ];
        let results = manager.execute_batch(calls).await;
        assert!(results[0].as_ref().unwrap().success);
        assert!(matches!(results[1], Err(GatewayError::UnknownTool(_))));
    }
}
