use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{KvError, LockError, QueueError};
use crate::traits::{KvBackend, LockBackend, LockOps, QueueBackend};
use crate::types::{LockGuard, Message, MessageId};

#[derive(Debug, Clone)]
struct KvEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    data: Arc<RwLock<HashMap<String, KvEntry>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(entry) => {
                if !entry.is_live(Instant::now()) {
                    drop(data);
                    let mut data = self.data.write().await;
                    data.remove(key);
                    return Ok(None);
                }
                Ok(Some(entry.value.clone()))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        let mut data = self.data.write().await;
        let expires_at = ttl.map(|d| Instant::now() + d);
        data.insert(
            key.to_string(),
            KvEntry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut data = self.data.write().await;
        Ok(data.remove(key).is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut data = self.data.write().await;
        let now = Instant::now();

        let (current, expires_at) = match data.get(key) {
            Some(entry) if entry.is_live(now) => {
                let text = std::str::from_utf8(&entry.value).map_err(|_| KvError::NotACounter {
                    key: key.to_string(),
                })?;
                let value: i64 = text.parse().map_err(|_| KvError::NotACounter {
                    key: key.to_string(),
                })?;
                (value, entry.expires_at)
            }
            _ => (0, None),
        };

        let next = current + 1;
        data.insert(
            key.to_string(),
            KvEntry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }
}

#[derive(Debug, Clone)]
struct QueueEntry {
    message: Message,
    visible_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    queues: Arc<Mutex<HashMap<String, VecDeque<QueueEntry>>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages in `queue`, leased or not.
    pub async fn len(&self, queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Payloads of every message in `queue`, in enqueue order.
    pub async fn payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.queues.lock().await;
        queues
            .get(queue)
            .map(|q| q.iter().map(|e| e.message.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = queues.entry(queue.to_string()).or_default();

        let id = MessageId::new(Uuid::new_v4().to_string());
        let entry = QueueEntry {
            message: Message {
                id: id.clone(),
                payload: message.to_vec(),
                attempt: 0,
                enqueued_at: SystemTime::now(),
            },
            visible_at: Instant::now(),
        };

        queue_data.push_back(entry);
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<Message>, QueueError> {
        let mut leased = self.lease(queue, 1, visibility_timeout).await?;
        Ok(leased.pop())
    }

    async fn lease(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Message>, QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = match queues.get_mut(queue) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };

        let now = Instant::now();
        let mut leased = Vec::new();
        for entry in queue_data.iter_mut() {
            if leased.len() >= max {
                break;
            }
            if entry.visible_at <= now {
                entry.visible_at = now + visibility_timeout;
                entry.message.attempt += 1;
                leased.push(entry.message.clone());
            }
        }

        Ok(leased)
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        let initial_len = queue_data.len();
        queue_data.retain(|entry| entry.message.id != *message_id);

        if queue_data.len() == initial_len {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }

        Ok(())
    }

    async fn ack_batch(
        &self,
        queue: &str,
        message_ids: &[MessageId],
    ) -> Result<usize, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(queue_data) = queues.get_mut(queue) else {
            return Ok(0);
        };

        let doomed: HashSet<&MessageId> = message_ids.iter().collect();
        let initial_len = queue_data.len();
        queue_data.retain(|entry| !doomed.contains(&entry.message.id));

        Ok(initial_len - queue_data.len())
    }

    async fn nack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let queue_data = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_string()))?;

        for entry in queue_data.iter_mut() {
            if entry.message.id == *message_id {
                entry.visible_at = Instant::now();
                return Ok(());
            }
        }

        Err(QueueError::MessageNotFound(message_id.to_string()))
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryLock {
    locks: Mutex<HashMap<String, LockEntry>>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockOps for MemoryLock {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut locks = self.locks.lock().await;
        match locks.get(resource) {
            Some(entry) if entry.token == token => {
                locks.remove(resource);
                Ok(())
            }
            Some(_) => Err(LockError::NotHeld),
            None => Ok(()),
        }
    }
}

/// Cloneable handle over a shared [`MemoryLock`] table.
#[derive(Debug, Clone, Default)]
pub struct MemoryLockProvider {
    inner: Arc<MemoryLock>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryLock::new()),
        }
    }
}

#[async_trait]
impl LockOps for MemoryLockProvider {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        self.inner.release(resource, token).await
    }
}

#[async_trait]
impl LockBackend for MemoryLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut locks = self.inner.locks.lock().await;
        let now = Instant::now();

        if let Some(entry) = locks.get(resource) {
            if entry.expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        locks.insert(
            resource.to_string(),
            LockEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );

        drop(locks);

        Ok(Some(LockGuard::new(
            resource.to_string(),
            token,
            Arc::new(self.clone()) as Arc<dyn LockOps>,
        )))
    }
}
