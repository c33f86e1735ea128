//! Work queue: at-least-once delivery of job-ready messages with leases.
//!
//! A message carries only the job id. The queue is a trigger, never a
//! ledger: workers always re-read the job row before acting.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod memory;
pub mod redis_queue;

pub use memory::MemoryWorkQueue;
pub use redis_queue::RedisWorkQueue;

/// Payload serialized onto the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
}

/// Handle for one leased delivery; used to extend or delete it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl Receipt {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for Receipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to one consumer, hidden from others until its lease ends.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: JobMessage,
    pub receipt: Receipt,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a job-ready message. Failure is always reported to the caller.
    async fn publish(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Wait up to `wait` for a message and lease it for `lease`.
    async fn receive(&self, lease: Duration, wait: Duration)
        -> Result<Option<Delivery>, QueueError>;

    /// Reset the lease to expire `duration` from now. A short duration makes
    /// the message visible again soon.
    async fn extend(&self, receipt: &Receipt, duration: Duration) -> Result<(), QueueError>;

    /// Remove the message for good. Call only after the job row is committed.
    async fn delete(&self, receipt: &Receipt) -> Result<(), QueueError>;

    /// Messages waiting to be received.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The lease expired and the message may already be with another consumer.
    #[error("Lease {0} is no longer held")]
    LeaseLost(Receipt),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}
