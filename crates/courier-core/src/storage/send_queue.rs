//! Durable queue of inbound send requests.
//!
//! Messages are claimed with `FOR UPDATE SKIP LOCKED` and hidden for a
//! visibility timeout instead of being removed. A consumer that crashes
//! before acknowledging simply lets the timeout lapse and the message is
//! delivered again, giving at-least-once semantics.

use std::{sync::Arc, time::Duration};

use sqlx::PgPool;

use crate::error::{CoreError, Result};

/// One claimed queue message.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueuedMessage {
    /// Queue-assigned sequence number, used as the acknowledgement receipt.
    pub id: i64,
    /// Raw message body as published.
    pub payload: String,
    /// How many times this message has been handed to a consumer.
    pub receive_count: i32,
}

/// Repository for send queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends a message to `queue` and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn publish(&self, queue: &str, payload: &str) -> Result<i64> {
        let id = sqlx::query_scalar(
            r#"
            INSERT INTO send_queue (queue, payload)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(queue)
        .bind(payload)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Claims up to `max` visible messages from `queue`, oldest first.
    ///
    /// Claimed messages stay invisible to other consumers for `visibility`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim fails.
    pub async fn claim(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueuedMessage>> {
        let limit = i64::try_from(max)
            .map_err(|_| CoreError::InvalidInput(format!("claim size {max} out of range")))?;

        let messages = sqlx::query_as::<_, QueuedMessage>(
            r#"
            UPDATE send_queue
            SET visible_at = NOW() + make_interval(secs => $3),
                receive_count = receive_count + 1
            WHERE id IN (
                SELECT id FROM send_queue
                WHERE queue = $1 AND visible_at <= NOW()
                ORDER BY id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, receive_count
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(visibility.as_secs_f64())
        .fetch_all(&*self.pool)
        .await?;

        Ok(messages)
    }

    /// Removes a processed message.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn ack(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM send_queue WHERE id = $1").bind(id).execute(&*self.pool).await?;

        Ok(())
    }

    /// Makes a claimed message visible again immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn release(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE send_queue SET visible_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
