//! Reliable email delivery on top of the courier delivery log.
//!
//! Send requests arrive on a durable queue, are persisted as delivery
//! records, and are handed to an outbound mail transport. Failures are
//! retried by a periodic sweep until the attempt budget runs out.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌────────────────┐   ┌───────────┐
//! │ send queue   │──▶│ MessageIngestor │──▶│ DeliveryEngine │──▶│ Transport │
//! └──────────────┘   └─────────────────┘   └────────────────┘   └───────────┘
//!                                            ▲        │
//!                    ┌──────────────┐        │        ▼
//!                    │ RetrySweeper │────────┘  ┌──────────────────┐
//!                    └──────────────┘ ◀─────────│ DeliveryLogStore │
//!                                               └──────────────────┘
//! ```
//!
//! Every attempt on a record runs under a per-record lock and is persisted
//! with a version check, so the ingestor and the sweeper never double-count
//! an attempt on the same record.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{storage::Storage, Clock, RealClock, SendRequest};
//! use courier_delivery::{
//!     storage::PostgresDeliveryLogStore,
//!     transport::{SmtpConfig, SmtpTransport},
//!     DeliveryConfig, DeliveryEngine, DeliveryError,
//! };
//!
//! # async fn example(storage: Arc<Storage>) -> Result<(), DeliveryError> {
//! let store = Arc::new(PostgresDeliveryLogStore::new(storage));
//! let transport = Arc::new(SmtpTransport::new(SmtpConfig::default())?);
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//!
//! let engine = DeliveryEngine::new(store, transport, DeliveryConfig::default(), clock)?;
//! let record = engine
//!     .submit(SendRequest::new("reader@example.com", "Welcome", "Hello there"))
//!     .await?;
//! println!("delivery {:?} is {}", record.id, record.status);
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod error;
pub mod ingestor;
pub mod locks;
pub mod runtime;
pub mod storage;
pub mod sweeper;
pub mod transport;

pub use engine::{AttemptOutcome, AttemptReport, DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result, TransportError};
pub use ingestor::{IngestConfig, MessageDisposition, MessageIngestor, MessageSource};
pub use runtime::DeliveryRuntime;
pub use sweeper::{RetrySweeper, SweepReport};

/// Default number of attempts before a failed delivery is cancelled.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default interval between retry sweeps in seconds.
pub const DEFAULT_SWEEP_PERIOD_SECONDS: u64 = 300;

/// Default bound on a single transport call in seconds.
pub const DEFAULT_TRANSPORT_TIMEOUT_SECONDS: u64 = 30;

/// Default queue carrying inbound send requests.
pub const DEFAULT_QUEUE_NAME: &str = "email_queue";
