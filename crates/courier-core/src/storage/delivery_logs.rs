//! Repository for delivery log records.
//!
//! Saves are version-checked upserts: a write succeeds only when the stored
//! row still carries the version the caller read, so two writers racing on
//! the same record cannot silently overwrite each other.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryId, DeliveryRecord, DeliveryStatus},
};

const COLUMNS: &str = "id, recipient, subject, content, status, error_message, attempt_count, \
                       last_attempt_time, created_at, version";

/// Repository for delivery log database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Persists a record and returns the stored form.
    ///
    /// Records without an id are inserted under a fresh id. Records with an
    /// id overwrite the stored row only if its version still matches.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Conflict` if the stored version moved on, or a
    /// database error if the write fails.
    pub async fn save(&self, record: &DeliveryRecord) -> Result<DeliveryRecord> {
        let id = record.id.unwrap_or_default();
        let attempt_count = i32::try_from(record.attempt_count).map_err(|_| {
            CoreError::InvalidInput(format!("attempt_count {} out of range", record.attempt_count))
        })?;

        let sql = format!(
            r#"
            INSERT INTO delivery_logs (
                id, recipient, subject, content, status, error_message,
                attempt_count, last_attempt_time, created_at, version
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10 + 1)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                attempt_count = EXCLUDED.attempt_count,
                last_attempt_time = EXCLUDED.last_attempt_time,
                version = delivery_logs.version + 1
            WHERE delivery_logs.version = $10
            RETURNING {COLUMNS}
            "#
        );

        let saved = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(id)
            .bind(&record.recipient)
            .bind(&record.subject)
            .bind(&record.content)
            .bind(record.status.as_str())
            .bind(&record.error_message)
            .bind(attempt_count)
            .bind(record.last_attempt_time)
            .bind(record.created_at)
            .bind(record.version)
            .fetch_optional(&*self.pool)
            .await?;

        saved.ok_or_else(|| {
            CoreError::Conflict(format!(
                "delivery {id} was modified concurrently (expected version {})",
                record.version
            ))
        })
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM delivery_logs WHERE id = $1");

        let record =
            sqlx::query_as::<_, DeliveryRecord>(&sql).bind(id).fetch_optional(&*self.pool).await?;

        Ok(record)
    }

    /// Returns every record currently at `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_status(&self, status: DeliveryStatus) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_logs WHERE status = $1 ORDER BY created_at ASC, id ASC"
        );

        let records = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(status.as_str())
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }

    /// Returns every record addressed to exactly `recipient`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_recipient(&self, recipient: &str) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_logs WHERE recipient = $1 \
             ORDER BY created_at ASC, id ASC"
        );

        let records = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(recipient)
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }

    /// Full-text search over subject and content, best matches first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM delivery_logs
            WHERE to_tsvector('english', subject || ' ' || content)
                  @@ plainto_tsquery('english', $1)
            ORDER BY ts_rank(to_tsvector('english', subject || ' ' || content),
                             plainto_tsquery('english', $1)) DESC,
                     created_at ASC
            LIMIT $2
            "#
        );

        let records = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(text)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }
}
