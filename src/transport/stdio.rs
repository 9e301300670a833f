//! `StdioTransport`: the line-delimited and Content-Length framings over a
//! generic reader/writer pair (spec §4.1).
//!
//! Generic over the stream types so production code can use a child
//! process's real pipes ([`super::ChildStdioTransport`]) while tests wire up
//! an in-memory duplex pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::FramingKind;
use crate::error::GatewayError;
use crate::transport::{ErrorHandler, MessageHandler, Transport};

/// One side reads, one side writes; `start()` may only be called once.
pub struct StdioTransport<R, W> {
    server_id: String,
    framing: FramingKind,
    reader: Mutex<Option<R>>,
    writer: Arc<Mutex<W>>,
    active: Arc<AtomicBool>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl<R, W> StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(server_id: impl Into<String>, reader: R, writer: W, framing: FramingKind) -> Self {
        StdioTransport {
            server_id: server_id.into(),
            framing,
            reader: Mutex::new(Some(reader)),
            writer: Arc::new(Mutex::new(writer)),
            active: Arc::new(AtomicBool::new(false)),
            read_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl<R, W> Transport for StdioTransport<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn start(&self, message_handler: MessageHandler, error_handler: ErrorHandler) -> crate::Result<()> {
        let reader = self.reader.lock().await.take().ok_or_else(|| {
            GatewayError::Lifecycle(format!("transport for '{}' already started", self.server_id))
        })?;

        let active = self.active.clone();
        active.store(true, Ordering::SeqCst);
        let framing = self.framing;
        let server_id = self.server_id.clone();

        let handle = tokio::spawn(async move {
            match framing {
                FramingKind::Line => read_line_loop(reader, &message_handler, &error_handler).await,
                FramingKind::ContentLength => {
                    read_content_length_loop(reader, &message_handler, &error_handler).await
                }
            }
            active.store(false, Ordering::SeqCst);
            tracing::debug!(server = %server_id, "transport read loop ended");
        });

        *self.read_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.read_task.lock().await.take() {
            handle.abort();
        }
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &serde_json::Value) -> crate::Result<()> {
        let mut writer = self.writer.lock().await;
        let err = |e: std::io::Error| GatewayError::Transport(self.server_id.clone(), e.to_string());
        match self.framing {
            FramingKind::Line => {
                let body = serde_json::to_string(message)
                    .map_err(|e| GatewayError::Transport(self.server_id.clone(), e.to_string()))?;
                writer.write_all(body.as_bytes()).await.map_err(err)?;
                writer.write_all(b"\n").await.map_err(err)?;
            }
            FramingKind::ContentLength => {
                let body = serde_json::to_vec(message)
                    .map_err(|e| GatewayError::Transport(self.server_id.clone(), e.to_string()))?;
                let header = format!("Content-Length: {}\r\n\r\n", body.len());
                writer.write_all(header.as_bytes()).await.map_err(err)?;
                writer.write_all(&body).await.map_err(err)?;
            }
        }
        writer.flush().await.map_err(err)
    }
}

async fn read_line_loop<R>(reader: R, message_handler: &MessageHandler, error_handler: &ErrorHandler)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<serde_json::Value>(trimmed) {
                    Ok(value) => message_handler(value),
                    Err(e) => error_handler(format!("malformed line: {e}")),
                }
            }
            Ok(None) => break,
            Err(e) => {
                error_handler(format!("read error: {e}"));
                break;
            }
        }
    }
}

async fn read_content_length_loop<R>(reader: R, message_handler: &MessageHandler, error_handler: &ErrorHandler)
where
    R: AsyncRead + Unpin,
{
    let mut buf_reader = BufReader::new(reader);
    loop {
        let mut content_length: Option<usize> = None;
        loop {
            let mut header_line = String::new();
            match buf_reader.read_line(&mut header_line).await {
                Ok(0) => return, // EOF
                Ok(_) => {}
                Err(e) => {
                    error_handler(format!("header read error: {e}"));
                    return;
                }
            }
            let trimmed = header_line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }
            if let Some(value) = trimmed.strip_prefix("Content-Length:") {
                content_length = value.trim().parse().ok();
            }
        }

        let Some(len) = content_length else {
            error_handler("missing or invalid Content-Length header".to_string());
            continue;
        };

        let mut body = vec![0u8; len];
        if let Err(e) = buf_reader.read_exact(&mut body).await {
            error_handler(format!("body read error: {e}"));
            return;
        }

        match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(value) => message_handler(value),
            Err(e) => error_handler(format!("malformed frame: {e}")),
        }
    }
}
