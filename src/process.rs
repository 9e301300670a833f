//! Subprocess lifecycle: spawn, stderr capture, and termination with a
//! SIGTERM-then-SIGKILL grace period.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use crate::config::{resolve_env_vars, ServerConfig};
use crate::error::GatewayError;

/// Grace period between SIGTERM and SIGKILL on disconnect (spec §4.3/§5).
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Fixed-capacity ring buffer of the most recent stderr lines from a child,
/// kept for diagnostics.
#[derive(Debug, Default)]
pub struct StderrBuffer {
    capacity: usize,
    lines: std::collections::VecDeque<String>,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        StderrBuffer {
            capacity,
            lines: std::collections::VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn recent(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// A live child process plus the pipes a transport needs.
pub struct ProcessHandle {
    pub process_id: Option<u32>,
    pub start_time: Instant,
    child: Child,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
}

impl ProcessHandle {
    pub fn stderr_tail(&self) -> Arc<Mutex<StderrBuffer>> {
        self.stderr_buf.clone()
    }

    /// True while the OS process has not exited. Uses `try_wait`, which does
    /// not block.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM, then SIGKILL after [`KILL_GRACE`] if the process has not
    /// exited. Idempotent: killing an already-exited child is a no-op.
    pub async fn terminate(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.process_id {
                // SAFETY: libc::kill with a pid we spawned and a standard signal.
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        let waited = tokio::time::timeout(KILL_GRACE, self.child.wait()).await;
        if waited.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

/// Spawns and supervises `ProcessHandle`s for stdio-transport servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager
    }

    /// Spawn the configured command with piped stdin/stdout/stderr, start a
    /// background stderr-drain task, and return the handle.
    pub fn spawn(&self, config: &ServerConfig) -> crate::Result<ProcessHandle> {
        let mut cmd = Command::new(&config.command);
        if !config.args.is_empty() {
            cmd.args(&config.args);
        }
        if !config.env.is_empty() {
            cmd.envs(resolve_env_vars(&config.env));
        }
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| GatewayError::Process(config.name.clone(), e.to_string()))?;

        let process_id = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_buf = Arc::new(Mutex::new(StderrBuffer::new(100)));
        if let Some(stderr) = stderr {
            start_stderr_drain(stderr, config.name.clone(), stderr_buf.clone());
        }

        Ok(ProcessHandle {
            process_id,
            start_time: Instant::now(),
            child,
            stdin,
            stdout,
            stderr_buf,
        })
    }
}

/// Drain a child's stderr in the background, logging each line at debug
/// level and keeping the tail in `stderr_buf` for diagnostics.
fn start_stderr_drain(stderr: ChildStderr, name: String, stderr_buf: Arc<Mutex<StderrBuffer>>) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(server = %name, line = %line, "server stderr");
                    stderr_buf.lock().await.push(line);
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_config(command: &str) -> ServerConfig {
        ServerConfig {
            name: "test".to_string(),
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            transport: crate::config::TransportKind::Stdio,
            framing: crate::config::FramingKind::Line,
            timeout_ms: 5000,
            max_retries: 3,
        }
    }

    #[test]
    fn test_spawn_bad_command_is_process_error() {
        let manager = ProcessManager::new();
        let config = make_config("/this/command/does/not/exist-gateway");
        let result = manager.spawn(&config);
        assert!(matches!(result, Err(GatewayError::Process(name, _)) if name == "test"));
    }

    #[test]
    fn test_stderr_buffer_drops_oldest() {
        let mut buf = StderrBuffer::new(2);
        buf.push("a".to_string());
        buf.push("b".to_string());
        buf.push("c".to_string());
        assert_eq!(buf.recent(), vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_spawn_and_terminate_echo() {
        let manager = ProcessManager::new();
        let config = make_config("cat");
        let mut handle = manager.spawn(&config).expect("spawn cat");
        assert!(handle.is_alive());
        handle.terminate().await;
    }
}
