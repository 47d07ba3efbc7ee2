//! Core domain models and persistence for email delivery.
//!
//! Provides the delivery record and its lifecycle transitions, strongly-typed
//! identifiers, the error taxonomy shared by every crate, a clock abstraction
//! for deterministic tests, and the PostgreSQL repositories backing the
//! delivery log and the inbound send queue.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{DeliveryId, DeliveryRecord, DeliveryStatus, SendRequest};
pub use time::{Clock, RealClock, TestClock};

/// Error text persisted on records cancelled after exhausting their attempts.
pub const MAX_ATTEMPTS_REACHED: &str = "Max retry attempts reached. Stopping.";
