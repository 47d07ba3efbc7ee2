//! PostgreSQL repositories for the delivery log and the send queue.
//!
//! All SQL lives in this module. Callers outside the crate go through the
//! repositories so the schema can change without touching delivery logic.

use std::sync::Arc;

use sqlx::PgPool;

pub mod delivery_logs;
pub mod send_queue;

use crate::error::Result;

/// Idempotent DDL applied by [`Storage::bootstrap_schema`], in order.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS delivery_logs (
        id UUID PRIMARY KEY,
        recipient TEXT NOT NULL,
        subject TEXT NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL
            CHECK (status IN ('PENDING', 'SENT', 'FAILED', 'CANCELLED')),
        error_message TEXT,
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        last_attempt_time TIMESTAMPTZ(3),
        created_at TIMESTAMPTZ(3) NOT NULL DEFAULT NOW(),
        version BIGINT NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_logs_status
    ON delivery_logs(status, created_at, id)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_logs_recipient
    ON delivery_logs(recipient)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_delivery_logs_search
    ON delivery_logs USING GIN (to_tsvector('english', subject || ' ' || content))
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS send_queue (
        id BIGSERIAL PRIMARY KEY,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        visible_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        receive_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_send_queue_visible
    ON send_queue(queue, visible_at, id)
    "#,
];

/// Shared handle to every repository.
#[derive(Clone)]
pub struct Storage {
    /// Delivery record persistence.
    pub delivery_logs: Arc<delivery_logs::Repository>,

    /// Durable inbound queue of send requests.
    pub send_queue: Arc<send_queue::Repository>,
}

impl Storage {
    /// Creates the repositories over one shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            delivery_logs: Arc::new(delivery_logs::Repository::new(pool.clone())),
            send_queue: Arc::new(send_queue::Repository::new(pool)),
        }
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.delivery_logs.pool()).await?;

        Ok(())
    }

    /// Creates the tables and indexes this service needs if they are missing.
    ///
    /// # Errors
    ///
    /// Returns error if any statement fails.
    pub async fn bootstrap_schema(&self) -> Result<()> {
        let pool = self.delivery_logs.pool();
        let mut tx = pool.begin().await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://localhost/courier").unwrap();
        let _storage = Storage::new(pool);
    }

    #[test]
    fn schema_statements_are_idempotent() {
        for statement in SCHEMA {
            assert!(statement.contains("IF NOT EXISTS"), "not idempotent: {statement}");
        }
    }
}
