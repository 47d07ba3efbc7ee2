//! Tests for the delivery record's serialized shape and lifecycle rules.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use courier_core::{
    time::truncate_to_millis, DeliveryId, DeliveryRecord, DeliveryStatus, SendRequest,
};
use proptest::prelude::*;
use serde_json::json;

fn created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("valid timestamp")
}

fn request() -> SendRequest {
    SendRequest::new("reader@example.com", "New comment on your review", "Someone replied.")
}

#[test]
fn record_serializes_with_camel_case_fields() {
    let mut record = DeliveryRecord::pending(request(), created_at());
    record.id = Some(DeliveryId(uuid::Uuid::nil()));
    record.begin_attempt(created_at() + TimeDelta::milliseconds(1500));
    record.mark_failed("MailUnavailable: connection refused");
    record.version = 2;

    let value = serde_json::to_value(&record).expect("record serializes");

    assert_eq!(
        value,
        json!({
            "id": "00000000-0000-0000-0000-000000000000",
            "recipient": "reader@example.com",
            "subject": "New comment on your review",
            "content": "Someone replied.",
            "status": "FAILED",
            "errorMessage": "MailUnavailable: connection refused",
            "attemptCount": 1,
            "lastAttemptTime": "2024-03-01T12:00:01.500Z",
            "createdAt": "2024-03-01T12:00:00Z",
            "version": 2,
        })
    );
}

#[test]
fn send_request_decodes_queue_payload() {
    let payload = r#"{"recipient":"reader@example.com","subject":"Hi","body":"Hello"}"#;

    let request: SendRequest = serde_json::from_str(payload).expect("payload decodes");

    assert_eq!(request, SendRequest::new("reader@example.com", "Hi", "Hello"));
}

#[test]
fn send_request_requires_every_field() {
    let payload = r#"{"recipient":"reader@example.com","subject":"Hi"}"#;

    assert!(serde_json::from_str::<SendRequest>(payload).is_err());
}

#[test]
fn statuses_serialize_in_upper_case() {
    for status in DeliveryStatus::ALL {
        let encoded = serde_json::to_string(&status).expect("status serializes");
        assert_eq!(encoded, format!("\"{}\"", status.as_str()));
        assert_eq!(encoded, encoded.to_uppercase());
    }
}

#[derive(Debug, Clone)]
enum Transition {
    Attempt(i64),
    Fail,
    Send,
}

fn transition_strategy() -> impl Strategy<Value = Transition> {
    prop_oneof![
        (0i64..10_000_000).prop_map(Transition::Attempt),
        Just(Transition::Fail),
        Just(Transition::Send),
    ]
}

proptest! {
    /// Attempt counts track begun attempts exactly and timestamps keep
    /// millisecond precision.
    #[test]
    fn attempt_count_tracks_begun_attempts(
        transitions in prop::collection::vec(transition_strategy(), 0..40),
    ) {
        let mut record = DeliveryRecord::pending(request(), created_at());
        let mut begun = 0u32;

        for transition in transitions {
            let before = record.attempt_count;
            match transition {
                Transition::Attempt(micros) => {
                    record.begin_attempt(created_at() + TimeDelta::microseconds(micros));
                    begun += 1;
                },
                Transition::Fail => record.mark_failed("MailUnavailable: try later"),
                Transition::Send => record.mark_sent(),
            }

            prop_assert!(record.attempt_count >= before);
            prop_assert_eq!(record.attempt_count, begun);
            if let Some(at) = record.last_attempt_time {
                prop_assert_eq!(at, truncate_to_millis(at));
            }
        }
    }

    /// Reaching SENT always clears the previous failure.
    #[test]
    fn sent_never_carries_an_error(
        transitions in prop::collection::vec(transition_strategy(), 1..20),
    ) {
        let mut record = DeliveryRecord::pending(request(), created_at());

        for transition in transitions {
            match transition {
                Transition::Attempt(micros) => {
                    record.begin_attempt(created_at() + TimeDelta::microseconds(micros));
                },
                Transition::Fail => record.mark_failed("MailRejected: 550"),
                Transition::Send => record.mark_sent(),
            }

            if record.status == DeliveryStatus::Sent {
                prop_assert!(record.error_message.is_none());
            }
        }
    }
}
