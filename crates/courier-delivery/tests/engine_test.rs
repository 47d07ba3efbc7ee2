//! Integration tests for the delivery engine.
//!
//! Covers the first attempt made on submit, failure classification,
//! bounded transport calls, shutdown interruption and the guarantees that
//! keep concurrent attempts on one record from double counting.

mod common;

use std::time::Duration;

use anyhow::Result;
use common::{request, test_config, wait_for_calls, Fixture};
use courier_core::{Clock, CoreError, DeliveryRecord, DeliveryStatus};
use courier_delivery::{
    transport::mock::{ScriptedTransport, Step},
    AttemptOutcome, DeliveryConfig, DeliveryError, TransportError,
};

#[tokio::test]
async fn submit_delivers_on_first_attempt() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());

    let record = fixture.engine.submit(request("reader@example.com")).await?;

    assert_eq!(record.status, DeliveryStatus::Sent);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(record.error_message, None);
    assert_eq!(record.last_attempt_time, Some(fixture.clock.now_utc()));
    assert_eq!(fixture.stored(&record).await, record);

    let calls = fixture.transport.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].recipient, "reader@example.com");
    assert_eq!(calls[0].subject, "New comment on your review");
    assert_eq!(calls[0].body, "Someone replied to your review.");

    let stats = fixture.engine.stats().await;
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn failed_send_is_recorded_not_returned() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::failing(TransportError::unavailable(
        "421 service not available, try again later",
    )));

    let record = fixture.engine.submit(request("reader@example.com")).await?;

    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(
        record.error_message.as_deref(),
        Some("MailUnavailable: 421 service not available, try again later")
    );
    assert_eq!(fixture.stored(&record).await.status, DeliveryStatus::Failed);
    assert_eq!(fixture.engine.stats().await.failed, 1);
    Ok(())
}

#[tokio::test]
async fn permanent_rejection_is_still_retryable_failure() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::failing(TransportError::rejected(
        "550 mailbox unavailable",
    )));

    let record = fixture.engine.submit(request("nobody@example.com")).await?;

    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("MailRejected: 550 mailbox unavailable"));
    Ok(())
}

#[tokio::test]
async fn hung_transport_times_out_as_failure() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::hanging());

    let record = fixture.engine.submit(request("reader@example.com")).await?;

    assert_eq!(record.status, DeliveryStatus::Failed);
    assert_eq!(record.attempt_count, 1);
    assert_eq!(
        record.error_message.as_deref(),
        Some("TransportTimeout: send timed out after 200ms")
    );
    assert_eq!(fixture.engine.stats().await.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn retry_after_failure_clears_error_and_increments_count() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    fixture
        .transport
        .push_steps([Step::Fail(TransportError::unavailable("connection refused"))])
        .await;

    let failed = fixture.engine.submit(request("reader@example.com")).await?;
    assert_eq!(failed.status, DeliveryStatus::Failed);

    fixture.clock.advance(Duration::from_secs(300));
    let sent = fixture.engine.attempt(failed.clone()).await?;

    assert_eq!(sent.status, DeliveryStatus::Sent);
    assert_eq!(sent.attempt_count, 2);
    assert_eq!(sent.error_message, None);
    assert!(sent.last_attempt_time > failed.last_attempt_time);
    assert_eq!(sent.created_at, failed.created_at);
    Ok(())
}

#[tokio::test]
async fn interrupted_attempt_persists_nothing() -> Result<()> {
    let config = DeliveryConfig { transport_timeout: Duration::from_secs(60), ..test_config() };
    let fixture = Fixture::with_config(ScriptedTransport::hanging(), config);

    let submit = tokio::spawn({
        let engine = fixture.engine.clone();
        async move { engine.submit(request("reader@example.com")).await }
    });

    wait_for_calls(&fixture.transport, 1).await;
    assert_eq!(fixture.engine.stats().await.in_flight, 1);
    fixture.engine.abort_in_flight();

    let record = submit.await??;

    assert_eq!(record.status, DeliveryStatus::Pending);
    assert_eq!(record.attempt_count, 0);
    assert_eq!(record.last_attempt_time, None);
    assert_eq!(fixture.stored(&record).await, record);
    assert_eq!(fixture.store.save_count().await, 1, "only the creation was saved");

    let stats = fixture.engine.stats().await;
    assert_eq!(stats.interrupted, 1);
    assert_eq!(stats.in_flight, 0);
    Ok(())
}

#[tokio::test]
async fn attempts_after_abort_are_interrupted_immediately() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    let failed = fixture.seed_failed(3).await;

    fixture.engine.abort_in_flight();
    assert!(fixture.engine.is_aborted());

    let report = fixture.engine.attempt_with_outcome(failed.clone()).await?;

    assert_eq!(report.outcome, AttemptOutcome::Interrupted);
    assert_eq!(report.record, failed);
    assert_eq!(fixture.stored(&failed).await.attempt_count, 3);
    Ok(())
}

#[tokio::test]
async fn stale_snapshot_is_superseded() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    let snapshot = fixture.seed_failed(1).await;

    let first = fixture.engine.attempt_with_outcome(snapshot.clone()).await?;
    assert_eq!(first.outcome, AttemptOutcome::Sent);

    let second = fixture.engine.attempt_with_outcome(snapshot).await?;

    assert_eq!(second.outcome, AttemptOutcome::Superseded);
    assert_eq!(second.record, first.record);
    assert_eq!(fixture.transport.call_count().await, 1);
    Ok(())
}

#[tokio::test]
async fn terminal_records_are_never_attempted() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());

    for status in [DeliveryStatus::Sent, DeliveryStatus::Cancelled] {
        let mut record =
            DeliveryRecord::pending(request("reader@example.com"), fixture.clock.now_utc());
        record.status = status;
        record.attempt_count = 2;
        let record = fixture.store.seed(record).await;

        let report = fixture.engine.attempt_with_outcome(record.clone()).await?;

        assert_eq!(report.outcome, AttemptOutcome::Superseded);
        assert_eq!(fixture.stored(&record).await, record);
    }

    assert_eq!(fixture.transport.call_count().await, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_attempts_on_one_record_count_once() -> Result<()> {
    let fixture =
        Fixture::new(ScriptedTransport::with_fallback(Step::Delay(Duration::from_millis(50))));
    let snapshot = fixture.seed_failed(4).await;

    let attempts: Vec<_> = (0..2)
        .map(|_| {
            let engine = fixture.engine.clone();
            let snapshot = snapshot.clone();
            tokio::spawn(async move { engine.attempt_with_outcome(snapshot).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for attempt in attempts {
        outcomes.push(attempt.await??.outcome);
    }
    outcomes.sort_by_key(|outcome| *outcome == AttemptOutcome::Superseded);

    assert_eq!(outcomes, vec![AttemptOutcome::Sent, AttemptOutcome::Superseded]);
    assert_eq!(fixture.transport.call_count().await, 1);

    let stored = fixture.stored(&snapshot).await;
    assert_eq!(stored.attempt_count, 5);
    assert_eq!(stored.status, DeliveryStatus::Sent);
    Ok(())
}

#[tokio::test]
async fn store_failure_on_create_propagates() {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    fixture.store.fail_next_saves(1).await;

    let result = fixture.engine.submit(request("reader@example.com")).await;

    assert!(matches!(result, Err(DeliveryError::Storage(CoreError::Database(_)))));
    assert!(fixture.store.is_empty().await);
    assert_eq!(fixture.transport.call_count().await, 0);
}

#[tokio::test]
async fn store_failure_on_outcome_propagates_and_leaves_record_unchanged() {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    let failed = fixture.seed_failed(2).await;
    fixture.store.fail_next_saves(1).await;

    let result = fixture.engine.attempt(failed.clone()).await;

    assert!(matches!(result, Err(DeliveryError::Storage(CoreError::Database(_)))));
    assert_eq!(fixture.stored(&failed).await, failed);
}

#[tokio::test]
async fn unsaved_record_cannot_be_attempted() {
    let fixture = Fixture::new(ScriptedTransport::succeeding());
    let record = DeliveryRecord::pending(request("reader@example.com"), fixture.clock.now_utc());

    let result = fixture.engine.attempt(record).await;

    assert!(matches!(result, Err(DeliveryError::UnsavedRecord)));
    assert_eq!(fixture.transport.call_count().await, 0);
}

#[tokio::test]
async fn cancel_requires_exhausted_attempts() -> Result<()> {
    let fixture = Fixture::new(ScriptedTransport::succeeding());

    let young = fixture.seed_failed(9).await;
    let result = fixture.engine.cancel_exhausted(young.clone()).await;
    assert!(matches!(
        result,
        Err(DeliveryError::AttemptsRemaining { attempt_count: 9, max_attempts: 10, .. })
    ));
    assert_eq!(fixture.stored(&young).await.status, DeliveryStatus::Failed);

    let exhausted = fixture.seed_failed(10).await;
    let report = fixture.engine.cancel_exhausted(exhausted).await?;
    assert_eq!(report.outcome, AttemptOutcome::Cancelled);
    assert_eq!(report.record.status, DeliveryStatus::Cancelled);
    assert_eq!(report.record.attempt_count, 10);
    assert_eq!(
        report.record.error_message.as_deref(),
        Some(courier_core::MAX_ATTEMPTS_REACHED)
    );
    assert_eq!(fixture.transport.call_count().await, 0);
    Ok(())
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let store = courier_delivery::storage::memory::InMemoryDeliveryLogStore::new();
    let config = DeliveryConfig { max_attempts: 0, ..DeliveryConfig::default() };

    let result = courier_delivery::DeliveryEngine::new(
        std::sync::Arc::new(store),
        std::sync::Arc::new(ScriptedTransport::succeeding()),
        config,
        std::sync::Arc::new(courier_core::TestClock::new()),
    );

    assert!(matches!(result, Err(DeliveryError::ConfigurationError { .. })));
}
