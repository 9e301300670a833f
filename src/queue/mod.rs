//! Inbound workload controller: priority heap + elastic worker pool +
//! retry/dead-letter semantics (spec §4.8).

mod message_queue;
mod priority;
mod worker_pool;

pub use message_queue::{DeadLetterConfig, EnqueueMeta, MessageQueue, MessageQueueConfig, PriorityBoostConfig, Processor};
pub use priority::{Priority, PriorityQueue, QueuedMessage};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
