//! Valkey/Redis adapter for KV and Lock backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{KvError, LockError};
use crate::traits::{KvBackend, LockBackend, LockOps};
use crate::types::LockGuard;

async fn connect_pool(url: &str, pool_size: usize) -> Result<Pool, String> {
    let pool = Config::from_url(url)
        .builder()
        .map_err(|e| e.to_string())?
        .max_size(pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| e.to_string())?;

    let mut conn = pool.get().await.map_err(|e| e.to_string())?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await
        .map_err(|e| e.to_string())?;

    Ok(pool)
}

/// Valkey/Redis KV backend.
#[derive(Clone)]
pub struct ValkeyKv {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyKv {
    /// Connects and pings the server before returning.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, KvError> {
        let pool = connect_pool(url, pool_size)
            .await
            .map_err(KvError::Connection)?;
        Ok(Self { pool, namespace })
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, key),
            None => key.to_string(),
        }
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, KvError> {
        self.pool
            .get()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KvBackend for ValkeyKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let mut conn = self.conn().await?;
        let result: Option<Vec<u8>> = conn
            .get(self.prefixed_key(key))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(result)
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed_key(key);

        match ttl {
            Some(duration) => {
                let seconds = duration.as_secs().max(1);
                conn.set_ex::<_, _, ()>(&prefixed, value, seconds)
                    .await
                    .map_err(|e| KvError::Backend(e.to_string()))?;
            }
            None => {
                conn.set::<_, _, ()>(&prefixed, value)
                    .await
                    .map_err(|e| KvError::Backend(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn
            .del(self.prefixed_key(key))
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        conn.incr(self.prefixed_key(key), 1i64)
            .await
            .map_err(|e| {
                if e.to_string().contains("not an integer") {
                    KvError::NotACounter {
                        key: key.to_string(),
                    }
                } else {
                    KvError::Backend(e.to_string())
                }
            })
    }
}

/// Valkey/Redis Lock backend.
#[derive(Clone)]
pub struct ValkeyLock {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyLock {
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, LockError> {
        let pool = connect_pool(url, pool_size)
            .await
            .map_err(LockError::Connection)?;
        Ok(Self { pool, namespace })
    }

    fn lock_key(&self, resource: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:lock:{}", ns, resource),
            None => format!("lock:{}", resource),
        }
    }
}

#[async_trait]
impl LockOps for ValkeyLock {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let key = self.lock_key(resource);

        // 1 = released, 0 = already gone, -1 = someone else holds it
        let script = redis::Script::new(
            r#"
            local current = redis.call('GET', KEYS[1])
            if current == ARGV[1] then
                return redis.call('DEL', KEYS[1])
            elseif current == false then
                return 0
            else
                return -1
            end
            "#,
        );

        let result: i64 = script
            .key(&key)
            .arg(token)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if result < 0 {
            return Err(LockError::NotHeld);
        }

        Ok(())
    }
}

/// Provider that holds an Arc<ValkeyLock> for use with LockBackend.
#[derive(Clone)]
pub struct ValkeyLockProvider {
    inner: Arc<ValkeyLock>,
}

impl ValkeyLockProvider {
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, LockError> {
        let lock = ValkeyLock::new(url, namespace, pool_size).await?;
        Ok(Self {
            inner: Arc::new(lock),
        })
    }
}

#[async_trait]
impl LockOps for ValkeyLockProvider {
    async fn release(&self, resource: &str, token: &str) -> Result<(), LockError> {
        self.inner.release(resource, token).await
    }
}

#[async_trait]
impl LockBackend for ValkeyLockProvider {
    async fn try_acquire(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<Option<LockGuard>, LockError> {
        let mut conn = self
            .inner
            .pool
            .get()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let key = self.inner.lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let seconds = ttl.as_secs().max(1);

        // SET key token NX EX seconds
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut *conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if result.is_some() {
            Ok(Some(LockGuard::new(
                resource.to_string(),
                token,
                Arc::new(self.clone()) as Arc<dyn LockOps>,
            )))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for ValkeyKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyKv")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ValkeyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyLock")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ValkeyLockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyLockProvider")
            .field("inner", &self.inner)
            .finish()
    }
}
