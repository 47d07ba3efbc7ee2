//! Error types for delivery operations.
//!
//! A [`TransportError`] is an expected outcome of an attempt: it is
//! classified, written onto the record, and never returned to callers. A
//! [`DeliveryError`] is an infrastructure failure the caller has to handle.

use std::time::Duration;

use courier_core::{CoreError, DeliveryId};
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Infrastructure failures surfaced by the delivery pipeline.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The delivery log store failed.
    #[error("storage error: {0}")]
    Storage(#[from] CoreError),

    /// The inbound queue failed.
    #[error("queue error: {message}")]
    QueueError {
        /// Queue error message
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// An attempt was requested for a record the store has never seen.
    #[error("delivery record has not been saved")]
    UnsavedRecord,

    /// Cancellation was requested for a record that still has attempts left.
    #[error("delivery {id} has used {attempt_count} of {max_attempts} attempts")]
    AttemptsRemaining {
        /// Record the caller tried to cancel
        id: DeliveryId,
        /// Attempts made so far
        attempt_count: u32,
        /// Configured attempt budget
        max_attempts: u32,
    },

    /// Background tasks did not stop within the shutdown grace period.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Grace period that was exceeded
        timeout: Duration,
    },

    /// A background task panicked.
    #[error("{task} task panicked: {error}")]
    TaskPanic {
        /// Name of the task
        task: &'static str,
        /// Panic description
        error: String,
    },
}

impl DeliveryError {
    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Returns true when a save lost an optimistic concurrency race.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Storage(err) if err.is_conflict())
    }
}

/// Failure reported by an outbound mail transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The send did not finish within the configured bound.
    #[error("send timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// The sender or recipient address could not be parsed.
    #[error("invalid address '{address}'")]
    InvalidAddress {
        /// Offending address
        address: String,
    },

    /// The message could not be assembled.
    #[error("{message}")]
    MessageBuild {
        /// Builder error message
        message: String,
    },

    /// The server permanently refused the message.
    #[error("{message}")]
    Rejected {
        /// Server response
        message: String,
    },

    /// The server could not be reached or answered with a transient error.
    #[error("{message}")]
    Unavailable {
        /// Connection or response error
        message: String,
    },
}

impl TransportError {
    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout }
    }

    /// Creates an invalid address error.
    pub fn invalid_address(address: impl Into<String>) -> Self {
        Self::InvalidAddress { address: address.into() }
    }

    /// Creates a permanent rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into() }
    }

    /// Creates a transient failure.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }

    /// Stable name of the failure class.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "TransportTimeout",
            Self::InvalidAddress { .. } => "InvalidAddress",
            Self::MessageBuild { .. } => "MessageBuildError",
            Self::Rejected { .. } => "MailRejected",
            Self::Unavailable { .. } => "MailUnavailable",
        }
    }

    /// Returns true when retrying the same message cannot succeed.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidAddress { .. } | Self::MessageBuild { .. } | Self::Rejected { .. })
    }

    /// Text persisted as the record's error message: `<kind>: <detail>`.
    pub fn failure_message(&self) -> String {
        format!("{}: {self}", self.kind())
    }
}
