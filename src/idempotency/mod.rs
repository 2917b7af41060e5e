//! Idempotency gate: at most one accepted submission per key within TTL.
//!
//! The claim is a single compare-and-set with TTL, so concurrent submissions
//! with the same key race through exactly one winner. The gate fails closed:
//! if the store is unreachable the submission is rejected rather than
//! admitted unguarded.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The key was absent and is now claimed.
    New,
    /// The key was already claimed within its TTL.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("idempotency store unreachable: {0}")]
    Unavailable(#[from] redis::RedisError),
}

#[async_trait]
pub trait IdempotencyGate: Send + Sync {
    async fn claim(&self, key: &str) -> Result<Claim, GateError>;
}

fn gate_key(key: &str) -> String {
    format!("idempotency:{}", key)
}

/// Redis-backed gate. `SET key sentinel NX EX ttl` creates the key and sets
/// its expiry in one atomic operation.
pub struct RedisGate {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisGate {
    pub fn new(conn: ConnectionManager, ttl_seconds: u64) -> Self {
        Self { conn, ttl_seconds }
    }
}

#[async_trait]
impl IdempotencyGate for RedisGate {
    async fn claim(&self, key: &str) -> Result<Claim, GateError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(gate_key(key))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_seconds)
            .query_async(&mut conn)
            .await?;

        Ok(if set.is_some() {
            Claim::New
        } else {
            Claim::Duplicate
        })
    }
}

/// In-memory gate for tests and local development; same claim semantics with
/// lazy expiry.
pub struct MemoryGate {
    entries: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl MemoryGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }
}

#[async_trait]
impl IdempotencyGate for MemoryGate {
    async fn claim(&self, key: &str) -> Result<Claim, GateError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(claimed_at) if now.duration_since(*claimed_at) < self.ttl => Ok(Claim::Duplicate),
            _ => {
                entries.insert(key.to_string(), now);
                Ok(Claim::New)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_claim_wins_second_is_duplicate() {
        let gate = MemoryGate::new(Duration::from_secs(60));
        assert_eq!(gate.claim("abc").await.unwrap(), Claim::New);
        assert_eq!(gate.claim("abc").await.unwrap(), Claim::Duplicate);
        assert_eq!(gate.claim("other").await.unwrap(), Claim::New);
    }

    #[tokio::test]
    async fn expired_claim_can_be_retaken() {
        let gate = MemoryGate::new(Duration::from_millis(0));
        assert_eq!(gate.claim("abc").await.unwrap(), Claim::New);
        assert_eq!(gate.claim("abc").await.unwrap(), Claim::New);
    }
}
