//! `PriorityQueue`: a min-heap of `QueuedMessage` ordered by
//! `(priority asc, enqueueTime asc)` (spec §4.8). All operations are
//! O(log n).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

/// `CRITICAL=0, HIGH=1, NORMAL=2, LOW=3` — lower value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    /// One step toward `Low`, saturating — used to demote a message on retry.
    pub fn bump_toward_low(self) -> Priority {
        match self {
            Priority::Critical => Priority::High,
            Priority::High => Priority::Normal,
            Priority::Normal | Priority::Low => Priority::Low,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub enqueue_time: Instant,
    pub retry_count: u32,
    pub metadata: HashMap<String, String>,
}

/// Wraps a `QueuedMessage` with a monotonic sequence number so FIFO-within-
/// priority holds even if two messages land on the same `Instant` (coarse
/// clock resolution on some platforms).
struct HeapEntry {
    message: QueuedMessage,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// `BinaryHeap` is a max-heap; invert so lower priority value and earlier
    /// sequence number sort "greater" and come out first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .message
            .priority
            .cmp(&self.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
}

impl PriorityQueue {
    pub fn new() -> Self {
        PriorityQueue { heap: BinaryHeap::new(), next_seq: 0 }
    }

    pub fn enqueue(&mut self, message: QueuedMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(HeapEntry { message, seq });
    }

    pub fn dequeue(&mut self) -> Option<QueuedMessage> {
        self.heap.pop().map(|e| e.message)
    }

    pub fn peek(&self) -> Option<&QueuedMessage> {
        self.heap.peek().map(|e| &e.message)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn count_by_priority(&self) -> HashMap<Priority, usize> {
        let mut counts = HashMap::new();
        for entry in &self.heap {
            *counts.entry(entry.message.priority).or_insert(0) += 1;
        }
        counts
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
