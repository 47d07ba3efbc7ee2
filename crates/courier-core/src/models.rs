//! Delivery records, send requests and their identifiers.
//!
//! A [`DeliveryRecord`] is the single source of truth for one requested
//! email: what was asked for, how many attempts were made, and where in the
//! lifecycle it currently sits. State transitions live here so every caller
//! moves records through the same rules.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::CoreError, time::truncate_to_millis};

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type BoxDynError = sqlx::error::BoxDynError;

/// Identifier of a delivery record.
///
/// Assigned by the store the first time a record is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(
        &self,
        buf: &mut PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, BoxDynError> {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle state of a delivery record.
///
/// ```text
/// PENDING ──▶ SENT
///    │
///    └──────▶ FAILED ──▶ SENT
///               │  ▲
///               └──┘ (retry)
///               │
///               └──▶ CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Created, no attempt has completed yet.
    Pending,
    /// Accepted by the transport. Terminal.
    Sent,
    /// Last attempt failed; eligible for retry.
    Failed,
    /// Attempts exhausted. Terminal.
    Cancelled,
}

impl DeliveryStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Sent, Self::Failed, Self::Cancelled];

    /// Returns true for states no attempt may leave.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Cancelled)
    }

    /// Wire and column representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::InvalidInput(format!("invalid delivery status: {other}"))),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

/// Inbound request to send one email.
///
/// Decoded from queue messages shaped
/// `{"recipient": "...", "subject": "...", "body": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    /// Destination address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
}

impl SendRequest {
    /// Creates a send request.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self { recipient: recipient.into(), subject: subject.into(), body: body.into() }
    }
}

/// Persisted log entry tracking one email through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    /// Store-assigned identifier; `None` until the first save.
    pub id: Option<DeliveryId>,

    /// Destination address. Immutable after creation.
    pub recipient: String,

    /// Subject line. Immutable after creation.
    pub subject: String,

    /// Body text. Immutable after creation.
    pub content: String,

    /// Current lifecycle state.
    pub status: DeliveryStatus,

    /// Classified reason for the latest failure or cancellation.
    ///
    /// Cleared when the record reaches SENT.
    pub error_message: Option<String>,

    /// Number of completed attempts. Never decreases.
    pub attempt_count: u32,

    /// Start of the most recent attempt, millisecond precision.
    pub last_attempt_time: Option<DateTime<Utc>>,

    /// When the record was created, millisecond precision.
    pub created_at: DateTime<Utc>,

    /// Optimistic concurrency counter, bumped by every save.
    ///
    /// Zero for records that were never saved.
    pub version: i64,
}

impl DeliveryRecord {
    /// Builds a fresh PENDING record for a send request.
    pub fn pending(request: SendRequest, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            recipient: request.recipient,
            subject: request.subject,
            content: request.body,
            status: DeliveryStatus::Pending,
            error_message: None,
            attempt_count: 0,
            last_attempt_time: None,
            created_at: truncate_to_millis(created_at),
            version: 0,
        }
    }

    /// Returns true when no further attempt may change this record.
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Counts a new attempt starting at `at`.
    pub fn begin_attempt(&mut self, at: DateTime<Utc>) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_attempt_time = Some(truncate_to_millis(at));
    }

    /// Records a successful send.
    pub fn mark_sent(&mut self) {
        self.status = DeliveryStatus::Sent;
        self.error_message = None;
    }

    /// Records a failed send with its classified error message.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        self.status = DeliveryStatus::Failed;
        self.error_message = Some(error_message.into());
    }

    /// Permanently stops retrying this record.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) {
        self.status = DeliveryStatus::Cancelled;
        self.error_message = Some(reason.into());
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let attempt_count: i32 = row.try_get("attempt_count")?;

        Ok(Self {
            id: Some(row.try_get("id")?),
            recipient: row.try_get("recipient")?,
            subject: row.try_get("subject")?,
            content: row.try_get("content")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            attempt_count: attempt_count
                .try_into()
                .map_err(|_| sqlx::Error::Decode("attempt_count cannot be negative".into()))?,
            last_attempt_time: row.try_get("last_attempt_time")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}
