//! Delivery log storage abstraction.
//!
//! The engine and the sweeper only ever talk to [`DeliveryLogStore`].
//! Production wires in [`PostgresDeliveryLogStore`]; tests and local runs
//! use [`memory::InMemoryDeliveryLogStore`], which honours the same version
//! checks and ordering guarantees.

use std::{future::Future, pin::Pin, sync::Arc};

use courier_core::{
    error::Result,
    models::{DeliveryId, DeliveryRecord, DeliveryStatus},
    storage::Storage,
};

/// Persistence operations required by the delivery pipeline.
pub trait DeliveryLogStore: Send + Sync + 'static {
    /// Persists a record and returns the stored form.
    ///
    /// Assigns an id when the record has none and bumps `version`. Fails
    /// with `CoreError::Conflict` when the stored version differs from the
    /// one carried by `record`.
    fn save(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryRecord>> + Send + '_>>;

    /// Finds a record by id.
    fn find_by_id(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>>;

    /// Snapshot of every record at `status`, ordered by creation time then id.
    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>>;

    /// Every record addressed to exactly `recipient`.
    fn find_by_recipient(
        &self,
        recipient: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>>;

    /// Records whose subject or content match all words of `text`.
    fn search(
        &self,
        text: String,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>>;
}

/// PostgreSQL-backed store using the `delivery_logs` repository.
pub struct PostgresDeliveryLogStore {
    storage: Arc<Storage>,
}

impl PostgresDeliveryLogStore {
    /// Creates a new PostgreSQL store adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryLogStore for PostgresDeliveryLogStore {
    fn save(
        &self,
        record: DeliveryRecord,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryRecord>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_logs.save(&record).await })
    }

    fn find_by_id(
        &self,
        id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_logs.find_by_id(id).await })
    }

    fn find_by_status(
        &self,
        status: DeliveryStatus,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_logs.find_by_status(status).await })
    }

    fn find_by_recipient(
        &self,
        recipient: String,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_logs.find_by_recipient(&recipient).await })
    }

    fn search(
        &self,
        text: String,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
        Box::pin(async move { self.storage.delivery_logs.search(&text, limit).await })
    }
}

pub mod memory {
    //! In-memory delivery log.
    //!
    //! Behaves like the PostgreSQL store (id assignment, version checks,
    //! creation ordering) and can be told to fail saves or queries so error
    //! paths can be exercised without a database.

    use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

    use courier_core::error::{CoreError, Result};
    use tokio::sync::RwLock;

    use super::{DeliveryId, DeliveryLogStore, DeliveryRecord, DeliveryStatus};

    #[derive(Debug, Default)]
    struct Faults {
        saves_before_failure: usize,
        failing_saves: usize,
        failing_queries: usize,
    }

    /// In-memory store for tests and database-free runs.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryDeliveryLogStore {
        records: Arc<RwLock<HashMap<DeliveryId, DeliveryRecord>>>,
        faults: Arc<RwLock<Faults>>,
        saves: Arc<RwLock<u64>>,
    }

    impl InMemoryDeliveryLogStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next `count` saves fail with a database error.
        pub async fn fail_next_saves(&self, count: usize) {
            self.fail_saves_after(0, count).await;
        }

        /// Lets `successes` saves through, then fails the following `count`.
        pub async fn fail_saves_after(&self, successes: usize, count: usize) {
            let mut faults = self.faults.write().await;
            faults.saves_before_failure = successes;
            faults.failing_saves = count;
        }

        /// Makes the next `count` status queries fail with a database error.
        pub async fn fail_next_queries(&self, count: usize) {
            self.faults.write().await.failing_queries = count;
        }

        /// Stores a record as-is, bypassing version checks.
        ///
        /// Assigns an id if missing and returns the stored form. Used to seed
        /// records in states the pipeline would take many steps to reach.
        pub async fn seed(&self, mut record: DeliveryRecord) -> DeliveryRecord {
            let id = *record.id.get_or_insert_with(DeliveryId::new);
            record.version = record.version.max(1);
            self.records.write().await.insert(id, record.clone());
            record
        }

        /// Returns the stored copy of a record.
        pub async fn get(&self, id: DeliveryId) -> Option<DeliveryRecord> {
            self.records.read().await.get(&id).cloned()
        }

        /// Every stored record, ordered by creation time then id.
        pub async fn all(&self) -> Vec<DeliveryRecord> {
            let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
            sort(&mut records);
            records
        }

        /// Number of stored records.
        pub async fn len(&self) -> usize {
            self.records.read().await.len()
        }

        /// Returns true when nothing has been stored.
        pub async fn is_empty(&self) -> bool {
            self.records.read().await.is_empty()
        }

        /// Number of successful saves since creation.
        pub async fn save_count(&self) -> u64 {
            *self.saves.read().await
        }

        async fn take_fault(&self, query: bool) -> bool {
            let mut faults = self.faults.write().await;
            if !query && faults.failing_saves > 0 && faults.saves_before_failure > 0 {
                faults.saves_before_failure -= 1;
                return false;
            }

            let remaining =
                if query { &mut faults.failing_queries } else { &mut faults.failing_saves };
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        }

        async fn filtered(
            &self,
            predicate: impl Fn(&DeliveryRecord) -> bool,
        ) -> Result<Vec<DeliveryRecord>> {
            if self.take_fault(true).await {
                return Err(CoreError::Database("injected query failure".to_string()));
            }

            let mut records: Vec<_> =
                self.records.read().await.values().filter(|&record| predicate(record)).cloned().collect();
            sort(&mut records);
            Ok(records)
        }
    }

    fn sort(records: &mut [DeliveryRecord]) {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    }

    impl DeliveryLogStore for InMemoryDeliveryLogStore {
        fn save(
            &self,
            mut record: DeliveryRecord,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryRecord>> + Send + '_>> {
            Box::pin(async move {
                if self.take_fault(false).await {
                    return Err(CoreError::Database("injected save failure".to_string()));
                }

                let mut records = self.records.write().await;
                let id = *record.id.get_or_insert_with(DeliveryId::new);

                if let Some(stored) = records.get(&id) {
                    if stored.version != record.version {
                        return Err(CoreError::Conflict(format!(
                            "delivery {id} was modified concurrently (expected version {}, \
                             found {})",
                            record.version, stored.version
                        )));
                    }
                }

                record.version += 1;
                records.insert(id, record.clone());
                drop(records);

                *self.saves.write().await += 1;
                Ok(record)
            })
        }

        fn find_by_id(
            &self,
            id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<DeliveryRecord>>> + Send + '_>> {
            Box::pin(async move { Ok(self.records.read().await.get(&id).cloned()) })
        }

        fn find_by_status(
            &self,
            status: DeliveryStatus,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
            Box::pin(async move { self.filtered(|r| r.status == status).await })
        }

        fn find_by_recipient(
            &self,
            recipient: String,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
            Box::pin(async move { self.filtered(|r| r.recipient == recipient).await })
        }

        fn search(
            &self,
            text: String,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryRecord>>> + Send + '_>> {
            Box::pin(async move {
                let terms: Vec<String> =
                    text.split_whitespace().map(str::to_lowercase).collect();
                if terms.is_empty() {
                    return Ok(Vec::new());
                }

                let mut matches = self
                    .filtered(|r| {
                        let haystack = format!("{} {}", r.subject, r.content).to_lowercase();
                        terms.iter().all(|term| haystack.contains(term.as_str()))
                    })
                    .await?;
                matches.truncate(limit);
                Ok(matches)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use chrono::{TimeDelta, Utc};
        use courier_core::SendRequest;

        use super::*;

        fn record(recipient: &str) -> DeliveryRecord {
            DeliveryRecord::pending(SendRequest::new(recipient, "Weekly digest", "Top picks"), Utc::now())
        }

        #[tokio::test]
        async fn first_save_assigns_id_and_version() {
            let store = InMemoryDeliveryLogStore::new();

            let saved = store.save(record("a@example.com")).await.unwrap();

            assert!(saved.id.is_some());
            assert_eq!(saved.version, 1);
            assert_eq!(store.len().await, 1);
        }

        #[tokio::test]
        async fn stale_save_is_rejected() {
            let store = InMemoryDeliveryLogStore::new();
            let saved = store.save(record("a@example.com")).await.unwrap();

            let mut first = saved.clone();
            first.mark_failed("MailUnavailable: down");
            store.save(first).await.unwrap();

            let mut second = saved;
            second.mark_sent();
            let err = store.save(second).await.unwrap_err();

            assert!(err.is_conflict());
            assert_eq!(store.all().await[0].status, DeliveryStatus::Failed);
        }

        #[tokio::test]
        async fn status_snapshot_is_ordered_by_creation() {
            let store = InMemoryDeliveryLogStore::new();
            let now = Utc::now();
            let mut later = record("later@example.com");
            later.created_at = now + TimeDelta::seconds(5);
            let mut earlier = record("earlier@example.com");
            earlier.created_at = now;

            store.save(later).await.unwrap();
            store.save(earlier).await.unwrap();

            let pending = store.find_by_status(DeliveryStatus::Pending).await.unwrap();
            let recipients: Vec<_> = pending.iter().map(|r| r.recipient.as_str()).collect();
            assert_eq!(recipients, ["earlier@example.com", "later@example.com"]);
        }

        #[tokio::test]
        async fn injected_failures_are_consumed() {
            let store = InMemoryDeliveryLogStore::new();
            store.fail_next_saves(1).await;

            assert!(store.save(record("a@example.com")).await.is_err());
            assert!(store.save(record("a@example.com")).await.is_ok());
            assert_eq!(store.save_count().await, 1);
        }

        #[tokio::test]
        async fn delayed_failures_skip_leading_saves() {
            let store = InMemoryDeliveryLogStore::new();
            store.fail_saves_after(1, 1).await;

            assert!(store.save(record("a@example.com")).await.is_ok());
            assert!(store.save(record("b@example.com")).await.is_err());
            assert!(store.save(record("c@example.com")).await.is_ok());
            assert_eq!(store.save_count().await, 2);
        }

        #[tokio::test]
        async fn search_requires_every_term() {
            let store = InMemoryDeliveryLogStore::new();
            store
                .save(DeliveryRecord::pending(
                    SendRequest::new("a@example.com", "Review approved", "Your Dune review is live"),
                    Utc::now(),
                ))
                .await
                .unwrap();
            store.save(record("b@example.com")).await.unwrap();

            assert_eq!(store.search("dune REVIEW".into(), 10).await.unwrap().len(), 1);
            assert!(store.search("dune sequel".into(), 10).await.unwrap().is_empty());
            assert!(store.search("   ".into(), 10).await.unwrap().is_empty());
        }
    }
}
