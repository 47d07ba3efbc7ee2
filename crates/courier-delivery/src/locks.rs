//! Per-record mutual exclusion for attempts.
//!
//! The ingestor and the sweeper may reach for the same record at the same
//! time. Each attempt holds the record's lock from the re-read until the
//! result is persisted. Entries are dropped once nobody holds or waits on
//! them, so the table only ever contains records with work in flight.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use courier_core::DeliveryId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Table = HashMap<DeliveryId, Arc<AsyncMutex<()>>>;

/// Table of per-record async locks.
#[derive(Debug, Clone, Default)]
pub struct AttemptLocks {
    table: Arc<Mutex<Table>>,
}

impl AttemptLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `id`.
    pub async fn acquire(&self, id: DeliveryId) -> AttemptGuard {
        let lock = {
            let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            table.entry(id).or_default().clone()
        };

        let guard = lock.lock_owned().await;
        AttemptGuard { id, guard: Some(guard), table: self.table.clone() }
    }

    /// Number of records with a holder or waiter.
    pub fn active(&self) -> usize {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}

/// Exclusive access to one record, released on drop.
#[derive(Debug)]
pub struct AttemptGuard {
    id: DeliveryId,
    guard: Option<OwnedMutexGuard<()>>,
    table: Arc<Mutex<Table>>,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(self.guard.take());

        // Only the table's own handle left: no holder, no waiter.
        if table.get(&self.id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.id);
        }
    }
}
