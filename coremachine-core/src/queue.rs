//! # MessageQueue
//!
//! At-least-once queues backed by a PostgreSQL table. The job queue, task
//! queue and dead-letter queue are names over the same table.
//!
//! A lease is the (lock_id, visible_at) pair taken at receive time: while the
//! lease holds, the row is invisible to other consumers. If the lease expires
//! the row becomes deliverable again under a fresh lock, and any operation
//! with the stale lock affects zero rows.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::error::{ErrorKind, QueueError};
use crate::retry::RetryPolicy;

/// A message held under a lease. Consuming operations (complete, abandon,
/// dead_letter) take ownership so a delivery is settled exactly once.
#[derive(Debug)]
pub struct Delivery {
    pub id: i64,
    pub lock_id: Uuid,
    pub body: Value,
    /// 1-based delivery attempt, incremented by every receive.
    pub attempt: i32,
}

impl Delivery {
    /// Retries so far: zero on the first delivery.
    pub fn retry_count(&self) -> u32 {
        u32::try_from(self.attempt - 1).unwrap_or(0)
    }

    /// Decode the payload into its wire type.
    pub fn parse<M: DeserializeOwned>(&self) -> Result<M, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    body: Value,
    attempt: i32,
}

/// A dead-lettered message kept for post-mortem inspection.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub body: Value,
    pub error_kind: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MessageQueue {
    /// The queue name this consumer sends to and receives from.
    queue: String,
    /// Where poisoned and exhausted messages are parked.
    dead_letter_queue: String,
    pool: PgPool,
    lease_timeout: Duration,
    max_message_bytes: usize,
    retry_policy: RetryPolicy,
}

impl MessageQueue {
    pub fn new(
        pool: PgPool,
        queue: &str,
        dead_letter_queue: &str,
        lease_timeout_seconds: u64,
        max_message_bytes: usize,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            queue: queue.to_owned(),
            dead_letter_queue: dead_letter_queue.to_owned(),
            pool,
            lease_timeout: Duration::seconds(lease_timeout_seconds as i64),
            max_message_bytes,
            retry_policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.queue
    }

    fn encode<M: Serialize>(&self, message: &M) -> Result<Value, QueueError> {
        let body = serde_json::to_value(message)
            .map_err(|error| QueueError::SerializationError { error })?;
        let size = body.to_string().len();
        if size > self.max_message_bytes {
            return Err(QueueError::OversizeMessage {
                size,
                limit: self.max_message_bytes,
            });
        }
        Ok(body)
    }

    /// Enqueue a single message.
    pub async fn send<M: Serialize + Sync>(&self, message: &M) -> Result<(), QueueError> {
        self.send_in(&self.pool, message).await
    }

    /// Enqueue within a caller-owned transaction. This is what makes "create
    /// the row, then enqueue" an atomic pair for the submit and advancement
    /// paths.
    pub async fn send_in<'c, E, M>(&self, executor: E, message: &M) -> Result<(), QueueError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
        M: Serialize + Sync,
    {
        let body = self.encode(message)?;
        sqlx::query("INSERT INTO queue_message (queue, body) VALUES ($1, $2)")
            .bind(&self.queue)
            .bind(&body)
            .execute(executor)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    /// Enqueue a batch in one round-trip, using UNNEST to turn the bodies
    /// into rows.
    pub async fn send_batch<M: Serialize + Sync>(&self, messages: &[M]) -> Result<(), QueueError> {
        self.send_batch_in(&self.pool, messages).await
    }

    pub async fn send_batch_in<'c, E, M>(
        &self,
        executor: E,
        messages: &[M],
    ) -> Result<(), QueueError>
    where
        E: sqlx::Executor<'c, Database = sqlx::Postgres>,
        M: Serialize + Sync,
    {
        if messages.is_empty() {
            return Ok(());
        }

        let mut bodies = Vec::with_capacity(messages.len());
        for message in messages {
            bodies.push(self.encode(message)?);
        }

        sqlx::query(
            r#"
INSERT INTO queue_message (queue, body)
SELECT $1, unnested.body
FROM UNNEST($2::jsonb[]) AS unnested(body)
            "#,
        )
        .bind(&self.queue)
        .bind(&bodies)
        .execute(executor)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    /// Take the next deliverable message under a fresh lease, or None if the
    /// queue has nothing visible.
    ///
    /// The query uses a FOR UPDATE SKIP LOCKED clause so concurrent consumers
    /// never contend on the same row. Receiving bumps the attempt counter and
    /// pushes visible_at past the lease timeout.
    pub async fn receive(&self) -> Result<Option<Delivery>, QueueError> {
        let lock_id = Uuid::now_v7();
        let lease_expires_at = Utc::now() + self.lease_timeout;

        let row: Option<DeliveryRow> = sqlx::query_as(
            r#"
WITH available AS (
    SELECT id
    FROM queue_message
    WHERE queue = $1
      AND visible_at <= NOW()
    ORDER BY id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE queue_message
SET
    attempt = queue_message.attempt + 1,
    lock_id = $2,
    visible_at = $3
FROM available
WHERE queue_message.id = available.id
RETURNING queue_message.id, queue_message.body, queue_message.attempt
            "#,
        )
        .bind(&self.queue)
        .bind(lock_id)
        .bind(lease_expires_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        Ok(row.map(|row| Delivery {
            id: row.id,
            lock_id,
            body: row.body,
            attempt: row.attempt,
        }))
    }

    /// Settle a delivery as done: the message is removed.
    pub async fn complete(&self, delivery: Delivery) -> Result<(), QueueError> {
        let result = sqlx::query("DELETE FROM queue_message WHERE id = $1 AND lock_id = $2")
            .bind(delivery.id)
            .bind(delivery.lock_id)
            .execute(&self.pool)
            .await
            .map_err(|error| QueueError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        throw_if_no_rows(result, delivery.id)
    }

    /// Return a delivery to the queue for redelivery after the policy's
    /// backoff for this attempt.
    pub async fn abandon(&self, delivery: Delivery) -> Result<(), QueueError> {
        let backoff = self
            .retry_policy
            .time_until_next_retry(delivery.retry_count());
        let visible_at =
            Utc::now() + Duration::from_std(backoff).unwrap_or(Duration::seconds(1));

        let result = sqlx::query(
            r#"
UPDATE queue_message
SET visible_at = $3, lock_id = NULL
WHERE id = $1 AND lock_id = $2
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.lock_id)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        throw_if_no_rows(result, delivery.id)
    }

    /// Extend the lease of an in-flight delivery by another lease timeout.
    pub async fn renew(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let lease_expires_at = Utc::now() + self.lease_timeout;
        let result = sqlx::query(
            "UPDATE queue_message SET visible_at = $3 WHERE id = $1 AND lock_id = $2",
        )
        .bind(delivery.id)
        .bind(delivery.lock_id)
        .bind(lease_expires_at)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        throw_if_no_rows(result, delivery.id)
    }

    /// Park a delivery on the dead-letter queue, retaining the original body
    /// plus the error taxonomy for post-mortem.
    pub async fn dead_letter(
        &self,
        delivery: Delivery,
        kind: ErrorKind,
        last_error: &str,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
UPDATE queue_message
SET queue = $3, error_kind = $4, last_error = $5, lock_id = NULL, visible_at = NOW()
WHERE id = $1 AND lock_id = $2
            "#,
        )
        .bind(delivery.id)
        .bind(delivery.lock_id)
        .bind(&self.dead_letter_queue)
        .bind(kind.as_str())
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "UPDATE".to_owned(),
            error,
        })?;

        throw_if_no_rows(result, delivery.id)
    }

    /// Read-only view of the dead-letter queue. Re-queueing from here is an
    /// administrative action, never automatic.
    pub async fn peek_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>, QueueError> {
        sqlx::query_as(
            r#"
SELECT id, body, error_kind, last_error, created_at
FROM queue_message
WHERE queue = $1
ORDER BY id DESC
LIMIT $2
            "#,
        )
        .bind(&self.dead_letter_queue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    /// Number of currently deliverable messages, for gauges and depth checks.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_message WHERE queue = $1 AND visible_at <= NOW()",
        )
        .bind(&self.queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| QueueError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(count as u64)
    }
}

fn throw_if_no_rows(
    result: sqlx::postgres::PgQueryResult,
    id: i64,
) -> Result<(), QueueError> {
    if result.rows_affected() == 0 {
        Err(QueueError::LeaseLost { id })
    } else {
        Ok(())
    }
}
