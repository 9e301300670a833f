//! Typed event bus so an out-of-scope shell can observe lifecycle, pool, and
//! queue activity without the core depending on any particular UI or
//! telemetry backend.
//!
//! The core never owns a process-global bus; callers inject an `EventSink`
//! at construction (`ToolManager`, `ConnectionPool`, `MessageQueue` each take
//! one), defaulting to [`NoopEventSink`].

use std::sync::Arc;
use std::time::SystemTime;

/// One event kind per surface listed in spec §6. Payloads carry just enough
/// identifying information for an observer to correlate events without
/// reaching back into the core's internal state.
#[derive(Debug, Clone)]
pub enum EventPayload {
    ComponentInitialized { component: String },
    ComponentShutdown { component: String },
    ToolExecuted { tool_id: String, success: bool, execution_time_ms: u64 },
    PoolFull { server_id: String },
    ConnectionCreated { server_id: String, connection_id: u64 },
    ConnectionAcquired { server_id: String, connection_id: u64 },
    ConnectionReleased { server_id: String, connection_id: u64 },
    ConnectionClosed { server_id: String, connection_id: u64 },
    HealthCheckPassed { server_id: String, connection_id: u64 },
    HealthCheckFailed { server_id: String, connection_id: u64 },
    MessageEnqueued { message_id: String, priority: u8 },
    MessageProcessing { message_id: String },
    MessageCompleted { message_id: String },
    MessageFailed { message_id: String, retry_count: u32 },
    WorkerStarted { worker_id: u64 },
    WorkerStopped { worker_id: u64 },
    QueueFull { max_queue_size: usize },
    ErrorOccurred { context: String, message: String },
}

/// A single emitted event, as delivered to an `EventSink`.
#[derive(Debug, Clone)]
pub struct Event {
    pub timestamp: SystemTime,
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Event {
            timestamp: SystemTime::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Injected collaborator that receives events. Implementations must not
/// block the caller for long — `ChannelEventSink` hands off to a bounded
/// broadcast channel and returns immediately.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Default sink: discards every event. Used whenever no sink is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: Event) {}
}

/// Sink backed by a `tokio::sync::broadcast` channel; any number of
/// observers may `subscribe()` independently. Events are dropped for lagging
/// subscribers per broadcast-channel semantics rather than applying
/// backpressure to the emitting task.
#[derive(Clone)]
pub struct ChannelEventSink {
    tx: tokio::sync::broadcast::Sender<Event>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        ChannelEventSink { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: Event) {
        // A send error only means there are currently no subscribers; that is
        // not a failure condition for the emitting task.
        let _ = self.tx.send(event);
    }
}

/// Convenience alias used throughout the core for an injected sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopEventSink)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_sink_does_not_panic() {
        let sink = NoopEventSink;
        sink.emit(Event::new("test", EventPayload::QueueFull { max_queue_size: 10 }));
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_to_subscriber() {
        let sink = ChannelEventSink::new(16);
        let mut rx = sink.subscribe();
        sink.emit(Event::new(
            "test",
            EventPayload::ToolExecuted {
                tool_id: "srv/echo".into(),
                success: true,
                execution_time_ms: 5,
            },
        ));
        let received = rx.recv().await.expect("event delivered");
        assert_eq!(received.source, "test");
        assert!(matches!(received.payload, EventPayload::ToolExecuted { success: true, .. }));
    }

    #[test]
    fn test_emit_with_no_subscribers_does_not_error() {
        let sink = ChannelEventSink::new(4);
        sink.emit(Event::new("test", EventPayload::WorkerStarted { worker_id: 1 }));
    }
}
