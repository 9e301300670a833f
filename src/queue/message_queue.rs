//! `MessageQueue`: priority-aware inbound workload controller binding
//! `PriorityQueue` to an elastic `WorkerPool`, with retry/dead-letter
//! semantics (spec §4.8).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::GatewayError;
use crate::events::{Event, EventPayload, SharedEventSink};

use super::priority::{Priority, PriorityQueue, QueuedMessage};
use super::worker_pool::{WorkerPool, WorkerPoolConfig};

/// Boost an enqueued message to `HIGH` when it looks like a command, comes
/// from an admin user, or its text contains a configured keyword.
#[derive(Debug, Clone, Default)]
pub struct PriorityBoostConfig {
    pub commands: bool,
    pub admin_users: HashSet<String>,
    pub keywords: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub max_retries: u32,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        DeadLetterConfig { enabled: true, max_retries: 3 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageQueueConfig {
    pub max_queue_size: usize,
    pub worker_pool: WorkerPoolConfig,
    pub priority_boost: PriorityBoostConfig,
    pub dead_letter: DeadLetterConfig,
}

/// Caller-supplied context influencing the effective priority of an enqueued
/// message: whether the payload reads as a command, the originating user
/// (checked against `priority_boost.admin_users`), and free text (checked
/// against `priority_boost.keywords`).
#[derive(Debug, Clone, Default)]
pub struct EnqueueMeta {
    pub is_command: bool,
    pub user_id: Option<String>,
    pub text: Option<String>,
}

/// A processor consumes one `QueuedMessage` and reports success or failure;
/// failure carries the reason for logging, not for retry branching (retry
/// count drives that).
pub type Processor = Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct Shared {
    queue: Mutex<PriorityQueue>,
    dead_letter: Mutex<Vec<QueuedMessage>>,
    notify: Notify,
    shutdown: AtomicBool,
    worker_pool: Arc<WorkerPool>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    processor: Mutex<Option<Processor>>,
    config: MessageQueueConfig,
    events: SharedEventSink,
    next_message_id: std::sync::atomic::AtomicU64,
}

/// Owns the priority heap, the worker pool's bookkeeping, and the live
/// worker task handles. `start` spawns `minWorkers` workers against a
/// caller-supplied `Processor`; `stop` drains in-flight work before
/// returning.
pub struct MessageQueue {
    shared: Arc<Shared>,
}

impl MessageQueue {
    pub fn new(config: MessageQueueConfig, events: SharedEventSink) -> Self {
        let worker_pool = Arc::new(WorkerPool::new(config.worker_pool.clone(), events.clone()));
        let shared = Arc::new(Shared {
            queue: Mutex::new(PriorityQueue::new()),
            dead_letter: Mutex::new(Vec::new()),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            worker_pool,
            worker_handles: Mutex::new(Vec::new()),
            processor: Mutex::new(None),
            config,
            events,
            next_message_id: std::sync::atomic::AtomicU64::new(0),
        });
        MessageQueue { shared }
    }

    fn effective_priority(&self, requested: Option<Priority>, meta: &EnqueueMeta) -> Priority {
        if let Some(p) = requested {
            return p;
        }
        let boost = &self.shared.config.priority_boost;
        let is_admin = meta.user_id.as_ref().map(|u| boost.admin_users.contains(u)).unwrap_or(false);
        let has_keyword = meta
            .text
            .as_deref()
            .map(|t| boost.keywords.iter().any(|k| t.contains(k.as_str())))
            .unwrap_or(false);
        if (boost.commands && meta.is_command) || is_admin || has_keyword {
            Priority::High
        } else {
            Priority::Normal
        }
    }

    /// Reject with `Capacity` if the queue is already at `maxQueueSize`;
    /// otherwise compute the effective priority and push.
    pub async fn enqueue(&self, payload: serde_json::Value, priority: Option<Priority>, meta: EnqueueMeta) -> crate::Result<String> {
        let mut queue = self.shared.queue.lock().await;
        if queue.len() >= self.shared.config.max_queue_size {
            self.shared
                .events
                .emit(Event::new("queue", EventPayload::QueueFull { max_queue_size: self.shared.config.max_queue_size }));
            return Err(GatewayError::Capacity("message_queue".into(), "queue full".into()));
        }

        let id = format!("msg-{}", self.shared.next_message_id.fetch_add(1, Ordering::SeqCst));
        let effective_priority = self.effective_priority(priority, &meta);
        let message = QueuedMessage {
            id: id.clone(),
            payload,
            priority: effective_priority,
            enqueue_time: Instant::now(),
            retry_count: 0,
            metadata: Default::default(),
        };
        queue.enqueue(message);
        drop(queue);

        self.shared
            .events
            .emit(Event::new("queue", EventPayload::MessageEnqueued { message_id: id.clone(), priority: effective_priority as u8 }));
        self.shared.notify.notify_one();
        Ok(id)
    }

    /// Spawn `minWorkers` worker tasks driven by `processor`.
    pub async fn start(&self, processor: Processor) {
        *self.shared.processor.lock().await = Some(processor);
        for _ in 0..self.shared.worker_pool.min_workers() {
            spawn_worker(self.shared.clone()).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    pub async fn dead_letter_snapshot(&self) -> Vec<QueuedMessage> {
        self.shared.dead_letter.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.shared.queue.lock().await.clear();
        self.shared.dead_letter.lock().await.clear();
    }

    /// Signal shutdown and await every worker's current iteration finishing.
    pub async fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.worker_handles.lock().await);
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Spawn one worker task and register its handle so `stop` can join it and
/// a later scale-up/scale-down decision can see it counted.
async fn spawn_worker(shared: Arc<Shared>) {
    let worker_id = shared.worker_pool.next_worker_id();
    shared.worker_pool.mark_spawned(worker_id);
    let worker_shared = shared.clone();
    let handle = tokio::spawn(async move {
        run_worker(worker_shared, worker_id).await;
    });
    shared.worker_handles.lock().await.push(handle);
}

async fn run_worker(shared: Arc<Shared>, worker_id: u64) {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let message = { shared.queue.lock().await.dequeue() };
        let Some(message) = message else {
            let idle_timeout = shared.worker_pool.idle_timeout();
            let should_exit = shared.worker_pool.should_scale_down();
            tokio::select! {
                _ = shared.notify.notified() => continue,
                _ = tokio::time::sleep(idle_timeout), if should_exit => break,
            }
        };

        shared.worker_pool.mark_busy();
        shared
            .events
            .emit(Event::new("queue", EventPayload::MessageProcessing { message_id: message.id.clone() }));

        let depth = shared.queue.lock().await.len();
        if shared.worker_pool.should_scale_up(depth) {
            spawn_worker(shared.clone()).await;
        }

        let processor = shared.processor.lock().await.clone();
        let outcome = match processor {
            Some(processor) => processor(message.clone()).await,
            None => Err("no processor configured".to_string()),
        };
        shared.worker_pool.mark_idle();

        match outcome {
            Ok(()) => {
                shared
                    .events
                    .emit(Event::new("queue", EventPayload::MessageCompleted { message_id: message.id.clone() }));
            }
            Err(reason) => {
                handle_failure(&shared, message, reason).await;
            }
        }
    }
    shared.worker_pool.mark_stopped(worker_id);
}

async fn handle_failure(shared: &Arc<Shared>, mut message: QueuedMessage, reason: String) {
    message.retry_count += 1;
    shared.events.emit(Event::new(
        "queue",
        EventPayload::MessageFailed { message_id: message.id.clone(), retry_count: message.retry_count },
    ));
    tracing::warn!(message_id = %message.id, retry_count = message.retry_count, error = %reason, "message processing failed");

    if shared.config.dead_letter.enabled && message.retry_count >= shared.config.dead_letter.max_retries {
        shared.dead_letter.lock().await.push(message);
        return;
    }

    message.priority = message.priority.bump_toward_low();
    let mut queue = shared.queue.lock().await;
    queue.enqueue(message);
    drop(queue);
    shared.notify.notify_one();
}
