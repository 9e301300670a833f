//! Error types for gateway operations.

use thiserror::Error;

/// Main error type for gateway operations, one variant per error kind in the
/// taxonomy: transport, protocol, timeout, lifecycle, capacity,
/// circuit-breaker, process.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// I/O failure, unparseable frame, or premature EOF on a server's transport.
    #[error("transport error for server '{0}': {1}")]
    Transport(String, String),

    /// The server returned a JSON-RPC `error` object; carried as-is.
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),

    /// A request exceeded its deadline.
    #[error("call timeout for server '{0}'")]
    Timeout(String),

    /// Operation attempted on an uninitialised or already-shutdown component.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Queue full, pool exhausted, or connection acquire timed out.
    #[error("capacity exceeded for '{0}': {1}")]
    Capacity(String, String),

    /// The circuit breaker for a server is OPEN; the call was rejected fast.
    #[error("circuit open for server '{0}'")]
    CircuitOpen(String),

    /// Process spawn failure or unexpected exit.
    #[error("process error for server '{0}': {1}")]
    Process(String, String),

    /// Duplicate server name found while loading configuration.
    #[error("duplicate server name: {0}")]
    DuplicateServer(String),

    /// Invalid configuration for a named server.
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// No tool registered under this key.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// `ToolCall.server_id` did not match the registered tool's server.
    #[error("tool '{0}' does not belong to server '{1}'")]
    ServerMismatch(String, String),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// True for error kinds the retry policy is allowed to retry:
    /// transport, timeout, and process errors. Protocol errors (the tool
    /// itself returned an error) and circuit-open rejections are never
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(..) | GatewayError::Timeout(..) | GatewayError::Process(..)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_display() {
        let err = GatewayError::Transport("srv".to_string(), "broken pipe".to_string());
        assert_eq!(err.to_string(), "transport error for server 'srv': broken pipe");
    }

    #[test]
    fn test_circuit_open_display() {
        let err = GatewayError::CircuitOpen("srv".to_string());
        assert_eq!(err.to_string(), "circuit open for server 'srv'");
    }

    #[test]
    fn test_call_timeout_display() {
        let err = GatewayError::Timeout("srv".to_string());
        assert_eq!(err.to_string(), "call timeout for server 'srv'");
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(GatewayError::Transport("s".into(), "x".into()).is_retryable());
        assert!(GatewayError::Timeout("s".into()).is_retryable());
        assert!(GatewayError::Process("s".into(), "x".into()).is_retryable());
        assert!(!GatewayError::Protocol("s".into(), "x".into()).is_retryable());
        assert!(!GatewayError::CircuitOpen("s".into()).is_retryable());
    }
}
