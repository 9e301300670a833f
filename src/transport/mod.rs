//! Framed bidirectional messaging over a child process's stdio (spec §4.1).

mod stdio;

pub use stdio::StdioTransport;

use std::sync::Arc;

use async_trait::async_trait;

/// Callback invoked for each successfully parsed inbound JSON-RPC message.
pub type MessageHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Callback invoked when a frame fails to parse, or the underlying stream
/// errors. The transport itself survives — only the malformed frame or the
/// next read is skipped.
pub type ErrorHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Object-safe seam so `ProtocolHandler` can hold a transport without being
/// generic over the concrete reader/writer pair — `StdioTransport<R, W>`
/// implements this for any `AsyncRead`/`AsyncWrite` pair, production code
/// uses [`ChildStdioTransport`], tests use an in-memory duplex pipe.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self, message_handler: MessageHandler, error_handler: ErrorHandler) -> crate::Result<()>;
    async fn stop(&self);
    async fn send(&self, message: &serde_json::Value) -> crate::Result<()>;
    fn is_active(&self) -> bool;
}

/// The concrete transport used for real child processes.
pub type ChildStdioTransport = StdioTransport<tokio::process::ChildStdout, tokio::process::ChildStdin>;
