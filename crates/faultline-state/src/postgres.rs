//! PostgreSQL adapter for Queue backend.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::QueueError;
use crate::traits::QueueBackend;
use crate::types::{Message, MessageId};

/// PostgreSQL Queue backend using SELECT FOR UPDATE SKIP LOCKED.
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    table: String,
}

impl PostgresQueue {
    /// Connects and creates the queue table if it doesn't exist.
    pub async fn new(url: &str, table: String) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let queue = Self { pool, table };
        queue.ensure_table().await?;

        Ok(queue)
    }

    async fn ensure_table(&self) -> Result<(), QueueError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                queue_name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.table
        );

        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let create_index = format!(
            r#"
            CREATE INDEX IF NOT EXISTS idx_{}_lease
            ON {} (queue_name, visible_at, id)
            "#,
            self.table.replace('.', "_"),
            self.table
        );

        sqlx::query(&create_index)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(())
    }

    fn parse_id(message_id: &MessageId) -> Result<i64, QueueError> {
        message_id
            .as_str()
            .parse()
            .map_err(|_| QueueError::MessageNotFound(message_id.to_string()))
    }
}

fn row_to_message(row: &PgRow) -> Message {
    let id: i64 = row.get("id");
    let payload: Vec<u8> = row.get("payload");
    let attempt: i32 = row.get("attempt");
    let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");

    Message {
        id: MessageId::new(id.to_string()),
        payload,
        attempt: attempt.max(0) as u32,
        enqueued_at: SystemTime::from(created_at),
    }
}

#[async_trait]
impl QueueBackend for PostgresQueue {
    async fn publish(&self, queue: &str, message: &[u8]) -> Result<MessageId, QueueError> {
        let query = format!(
            r#"
            INSERT INTO {} (queue_name, payload)
            VALUES ($1, $2)
            RETURNING id
            "#,
            self.table
        );

        let row = sqlx::query(&query)
            .bind(queue)
            .bind(message)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let id: i64 = row.get("id");
        Ok(MessageId::new(id.to_string()))
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
        let timeout_seconds = visibility_timeout.as_secs() as i64;
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        // Claimed rows stay locked until the UPDATE commits, so concurrent
        // leasers skip them instead of double-delivering.
        let query = format!(
            r#"
            UPDATE {}
            SET
                visible_at = NOW() + make_interval(secs => $3),
                attempt = attempt + 1
            WHERE id IN (
                SELECT id FROM {}
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, attempt, created_at
            "#,
            self.table, self.table
        );

        let rows = sqlx::query(&query)
            .bind(queue)
            .bind(limit)
            .bind(timeout_seconds as f64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
        // RETURNING order is unspecified
        messages.sort_by_key(|m| m.id.as_str().parse::<i64>().unwrap_or(i64::MAX));
        Ok(messages)
    }

    async fn ack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let id = Self::parse_id(message_id)?;

        let query = format!(
            r#"
            DELETE FROM {}
            WHERE id = $1 AND queue_name = $2
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }

        Ok(())
    }

    async fn ack_batch(
        &self,
        queue: &str,
        message_ids: &[MessageId],
    ) -> Result<usize, QueueError> {
        let ids: Vec<i64> = message_ids
            .iter()
            .filter_map(|id| id.as_str().parse().ok())
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let query = format!(
            r#"
            DELETE FROM {}
            WHERE id = ANY($1) AND queue_name = $2
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(&ids)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        Ok(result.rows_affected() as usize)
    }

    async fn nack(&self, queue: &str, message_id: &MessageId) -> Result<(), QueueError> {
        let id = Self::parse_id(message_id)?;

        let query = format!(
            r#"
            UPDATE {}
            SET visible_at = NOW()
            WHERE id = $1 AND queue_name = $2
            "#,
            self.table
        );

        let result = sqlx::query(&query)
            .bind(id)
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for PostgresQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresQueue")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}
