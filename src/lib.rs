//! Host-side runtime for orchestrating external JSON-RPC "tool servers" over
//! stdio: subprocess lifecycle, framed bidirectional messaging, per-server
//! connection pooling, per-server circuit breaking, a tool registry, and a
//! priority work queue with an elastic worker pool.

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus};
pub use client::{ServerClient, ServerConnectionStatus, ServerStatus};
pub use config::{parse_env_ref, resolve_env_vars, FramingKind, GatewayConfig, PoolConfig, QueueConfig, RawServerConfig, ServerConfig, TransportKind};
pub use error::{GatewayError, Result};
pub use events::{ChannelEventSink, Event, EventPayload, EventSink, NoopEventSink, SharedEventSink};
pub use manager::{ToolCall, ToolManager, ToolResult};
pub use pool::{ConnectionPool, PoolStats, PooledConnectionHandle};
pub use process::{ProcessHandle, ProcessManager};
pub use protocol::{ProtocolHandler, ProtocolInfo, ToolDefinitionWire};
pub use queue::{DeadLetterConfig, EnqueueMeta, MessageQueue, MessageQueueConfig, Priority, PriorityBoostConfig, PriorityQueue, Processor, QueuedMessage, WorkerPool, WorkerPoolConfig};
pub use registry::{ToolDefinition, ToolRegistry, ToolRegistryEntry};
pub use retry::RetryPolicy;
pub use transport::{ChildStdioTransport, ErrorHandler, MessageHandler, StdioTransport, Transport};
