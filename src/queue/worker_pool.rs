//! `WorkerPool`: sizing policy and live-count bookkeeping for the
//! `MessageQueue`'s worker tasks (spec §4.8). The pool itself only tracks
//! counts and decides when to scale; `MessageQueue` owns the actual worker
//! task handles and drives spawn/stop decisions from these signals.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::events::{Event, EventPayload, SharedEventSink};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_idle_timeout: Duration,
    pub autoscale: bool,
    pub scaling_threshold: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            min_workers: 1,
            max_workers: 8,
            worker_idle_timeout: Duration::from_secs(30),
            autoscale: true,
            scaling_threshold: 4,
        }
    }
}

/// Tracks how many workers are alive and how many are currently busy, and
/// answers whether the pool should grow or shrink. Holds no task handles
/// itself — `MessageQueue` is the one actually spawning/joining tasks.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    active_workers: AtomicUsize,
    busy_workers: AtomicUsize,
    next_worker_id: AtomicU64,
    events: SharedEventSink,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, events: SharedEventSink) -> Self {
        WorkerPool {
            config,
            active_workers: AtomicUsize::new(0),
            busy_workers: AtomicUsize::new(0),
            next_worker_id: AtomicU64::new(0),
            events,
        }
    }

    pub fn min_workers(&self) -> usize {
        self.config.min_workers
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.worker_idle_timeout
    }

    pub fn autoscale_enabled(&self) -> bool {
        self.config.autoscale
    }

    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn mark_spawned(&self, worker_id: u64) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        self.events.emit(Event::new("worker_pool", EventPayload::WorkerStarted { worker_id }));
    }

    pub fn mark_stopped(&self, worker_id: u64) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
        self.events.emit(Event::new("worker_pool", EventPayload::WorkerStopped { worker_id }));
    }

    pub fn mark_busy(&self) {
        self.busy_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_idle(&self) {
        self.busy_workers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Scale up when autoscale is on, the pool has room, and the queue depth
    /// exceeds `scalingThreshold` per currently-active worker.
    pub fn should_scale_up(&self, queue_depth: usize) -> bool {
        if !self.config.autoscale {
            return false;
        }
        let active = self.active_count();
        if active >= self.config.max_workers {
            return false;
        }
        queue_depth > active.max(1) * self.config.scaling_threshold
    }

    /// Scale down toward `minWorkers` only; callers decide when idle timeout
    /// has actually elapsed for a specific worker.
    pub fn should_scale_down(&self) -> bool {
        self.active_count() > self.config.min_workers
    }
}
