use std::time::Duration;

use async_trait::async_trait;

use crate::error::{KvError, LockError, QueueError};
use crate::types::{LockGuard, Message, MessageId};

/// Keyed cache with optional expiry.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Atomically increments the integer counter at `key`, creating it at
    /// zero first if absent, and returns the new value.
    ///
    /// Counters are stored as decimal text so `get` returns the same value.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;
}

/// Leaseable work queue.
///
/// Delivery is at-least-once: a received message stays invisible to other
/// consumers until its visibility timeout elapses, after which it is
/// delivered again unless it has been acknowledged.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError>;

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError>;

    /// Leases up to `max` visible messages in one call. May return fewer.
    async fn lease(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError>;

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError>;

    /// Deletes every listed message that still exists and returns how many
    /// were removed. Unknown ids are skipped rather than reported.
    async fn ack_batch(&self, queue: &str, message_ids: &[MessageId])
        -> Result<usize, QueueError>;

    async fn nack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError>;
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Takes the lock if nobody holds it. Returns `None` when it is held.
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError>;
}

#[async_trait]
pub trait LockOps: Send + Sync {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError>;
}
