//! Durable FIFO job transport between intake and the matching engine.
//!
//! The Redis backend keeps two lists: the queue proper and a processing list.
//! A lease atomically moves the oldest job into the processing list; the
//! acknowledgement removes it after the step completes. Jobs stranded in the
//! processing list by a crash are moved back to the front of the queue on
//! startup, so consumption stays strictly FIFO across restarts.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::models::Order;

/// Work items consumed one at a time by the matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Carries the full order snapshot as persisted, including its id.
    Submit { order: Order },
    /// Carries only the id; the engine decides whether the cancel takes
    /// effect.
    Cancel { order_id: Uuid },
}

/// A job handed to the consumer, held until acknowledged.
#[derive(Debug)]
pub struct LeasedJob {
    pub job: Job,
    payload: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("job codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError>;

    /// Block until the oldest job is available and lease it.
    async fn lease(&self) -> Result<LeasedJob, QueueError>;

    /// Acknowledge a completed job, releasing its lease.
    async fn ack(&self, lease: LeasedJob) -> Result<(), QueueError>;
}

/// Seconds a single blocking pop waits before re-issuing; keeps the blocking
/// connection responsive to reconnects.
const BLOCK_SECONDS: u64 = 5;

/// Redis-list queue.
///
/// Uses a dedicated connection for the blocking pop so leases never starve
/// enqueue and acknowledge traffic multiplexed on the shared connection.
pub struct RedisQueue {
    conn: ConnectionManager,
    blocking: tokio::sync::Mutex<ConnectionManager>,
    queue_key: String,
    processing_key: String,
}

impl RedisQueue {
    pub async fn connect(client: &redis::Client, key_prefix: &str) -> Result<Self, QueueError> {
        let conn = client.get_connection_manager().await?;
        let blocking = tokio::sync::Mutex::new(client.get_connection_manager().await?);
        Ok(Self {
            conn,
            blocking,
            queue_key: format!("{}:jobs", key_prefix),
            processing_key: format!("{}:jobs:processing", key_prefix),
        })
    }

    /// Move jobs stranded in the processing list back to the front of the
    /// queue, preserving their original order. Returns the number restored.
    pub async fn recover_inflight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut restored = 0;
        loop {
            let moved: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.queue_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            if moved.is_none() {
                break;
            }
            restored += 1;
        }
        Ok(restored)
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        let payload = serde_json::to_string(job)?;
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lease(&self) -> Result<LeasedJob, QueueError> {
        let mut conn = self.blocking.lock().await;
        loop {
            let payload: Option<String> = redis::cmd("BLMOVE")
                .arg(&self.queue_key)
                .arg(&self.processing_key)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(BLOCK_SECONDS)
                .query_async(&mut *conn)
                .await?;
            if let Some(payload) = payload {
                let job = serde_json::from_str(&payload)?;
                return Ok(LeasedJob {
                    job,
                    payload: Some(payload),
                });
            }
        }
    }

    async fn ack(&self, lease: LeasedJob) -> Result<(), QueueError> {
        if let Some(payload) = lease.payload {
            let mut conn = self.conn.clone();
            let _: () = redis::cmd("LREM")
                .arg(&self.processing_key)
                .arg(1)
                .arg(payload)
                .query_async(&mut conn)
                .await?;
        }
        Ok(())
    }
}

/// In-memory queue for tests and local development.
#[derive(Default)]
pub struct MemoryQueue {
    jobs: parking_lot::Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<(), QueueError> {
        self.jobs.lock().push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn lease(&self) -> Result<LeasedJob, QueueError> {
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.jobs.lock().pop_front() {
                return Ok(LeasedJob { job, payload: None });
            }
            notified.await;
        }
    }

    async fn ack(&self, _lease: LeasedJob) -> Result<(), QueueError> {
        Ok(())
    }
}
