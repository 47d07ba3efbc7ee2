//! Shared fixtures for delivery integration tests.
//!
//! Everything runs against the in-memory store and a scripted transport, so
//! no database or SMTP server is needed.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, DeliveryRecord, DeliveryStatus, SendRequest, TestClock};
use courier_delivery::{
    storage::memory::InMemoryDeliveryLogStore,
    transport::mock::ScriptedTransport,
    DeliveryConfig, DeliveryEngine, RetrySweeper,
};

pub struct Fixture {
    pub store: InMemoryDeliveryLogStore,
    pub transport: ScriptedTransport,
    pub clock: TestClock,
    pub engine: Arc<DeliveryEngine>,
}

impl Fixture {
    pub fn new(transport: ScriptedTransport) -> Self {
        Self::with_config(transport, test_config())
    }

    pub fn with_config(transport: ScriptedTransport, config: DeliveryConfig) -> Self {
        let store = InMemoryDeliveryLogStore::new();
        let clock = TestClock::new();
        let engine = DeliveryEngine::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            config,
            Arc::new(clock.clone()) as Arc<dyn Clock>,
        )
        .expect("test config is valid");

        Self { store, transport, clock, engine: Arc::new(engine) }
    }

    pub fn sweeper(&self) -> RetrySweeper {
        RetrySweeper::new(self.engine.clone(), Arc::new(self.clock.clone()))
    }

    /// Seeds a FAILED record that already used `attempts` attempts.
    pub async fn seed_failed(&self, attempts: u32) -> DeliveryRecord {
        let mut record = DeliveryRecord::pending(request("reader@example.com"), self.clock.now_utc());
        record.status = DeliveryStatus::Failed;
        record.attempt_count = attempts;
        record.last_attempt_time = Some(self.clock.now_utc());
        record.error_message = Some("MailUnavailable: connection refused".to_string());
        self.store.seed(record).await
    }

    /// Seeds a PENDING record that was never attempted.
    pub async fn seed_pending(&self) -> DeliveryRecord {
        let record = DeliveryRecord::pending(request("reader@example.com"), self.clock.now_utc());
        self.store.seed(record).await
    }

    pub async fn stored(&self, record: &DeliveryRecord) -> DeliveryRecord {
        let id = record.id.expect("record was saved");
        self.store.get(id).await.expect("record is stored")
    }
}

/// Defaults with a short transport timeout so timeout tests stay fast.
pub fn test_config() -> DeliveryConfig {
    DeliveryConfig { transport_timeout: Duration::from_millis(200), ..DeliveryConfig::default() }
}

pub fn request(recipient: &str) -> SendRequest {
    SendRequest::new(recipient, "New comment on your review", "Someone replied to your review.")
}

/// Waits until the transport has been called `count` times.
pub async fn wait_for_calls(transport: &ScriptedTransport, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while transport.call_count().await < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("transport was not called in time");
}
