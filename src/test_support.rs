//! Shared test fixtures: a tiny shell-scripted fake MCP server speaking
//! line-delimited JSON-RPC, used to exercise `ServerClient`/`ConnectionPool`
//! without depending on any real external tool server binary.

use std::collections::HashMap;

use crate::config::{FramingKind, ServerConfig, TransportKind};

/// A config whose command answers `initialize`, `tools/list`, and
/// `tools/call` with fixed responses. Relies on `ProtocolHandler`'s
/// monotonic id allocator starting at 0, so it only works for a
/// freshly-connected client calling in that exact order.
pub(crate) fn fake_server_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), FAKE_SERVER_SCRIPT.to_string()],
        env: HashMap::new(),
        transport: TransportKind::Stdio,
        framing: FramingKind::Line,
        timeout_ms: 5000,
        max_retries: 3,
    }
}

/// A config whose command reads stdin but never answers `initialize` —
/// `connect()` will time out.
pub(crate) fn unresponsive_server_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), "cat >/dev/null".to_string()],
        env: HashMap::new(),
        transport: TransportKind::Stdio,
        framing: FramingKind::Line,
        timeout_ms: 200,
        max_retries: 3,
    }
}

/// A config naming a command that does not exist, for connect-failure tests.
pub(crate) fn broken_server_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: "/this/command/does/not/exist-gateway".to_string(),
        args: vec![],
        env: HashMap::new(),
        transport: TransportKind::Stdio,
        framing: FramingKind::Line,
        timeout_ms: 1000,
        max_retries: 3,
    }
}

/// A config whose `tools/call` handler silently drops the first two calls
/// (so the client times out waiting for a reply) and answers every call
/// after that — used to drive a real circuit breaker through
/// open → half-open → closed without depending on actual server
/// unreachability.
pub(crate) fn flaky_then_recovers_server_config(name: &str) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        command: "sh".to_string(),
        args: vec!["-c".to_string(), FLAKY_RECOVERY_SERVER_SCRIPT.to_string()],
        env: HashMap::new(),
        transport: TransportKind::Stdio,
        framing: FramingKind::Line,
        timeout_ms: 150,
        max_retries: 3,
    }
}

const FLAKY_RECOVERY_SERVER_SCRIPT: &str = r#"
calls=0
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n' "$id"
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes input text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n' "$id"
      ;;
    *'"method":"tools/call"'*)
      calls=$((calls + 1))
      if [ "$calls" -le 2 ]; then
        : # swallow the request; the client times out waiting for a reply
      else
        printf '{"jsonrpc":"2.0","id":%s,"result":{"output":"ok"}}\n' "$id"
      fi
      ;;
  esac
done
"#;

const FAKE_SERVER_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":0,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"fake","version":"0"}}}\n'
      ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"echo","description":"echoes input text","inputSchema":{"type":"object","properties":{"text":{"type":"string"}},"required":["text"]}}]}}\n'
      ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":2,"result":{"output":"ok"}}\n'
      ;;
  esac
done
"#;
