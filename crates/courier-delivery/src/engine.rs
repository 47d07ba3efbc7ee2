//! Delivery engine: creates delivery records and runs attempts.
//!
//! An attempt is the only operation that increments `attempt_count`. It
//! runs under the record's lock, re-reads the stored record, calls the
//! transport with a bounded timeout and persists the outcome with a version
//! check. A transport failure is recorded on the record, not returned; only
//! store failures surface as errors.
//!
//! Attempts can be interrupted through the engine's abort token. An
//! interrupted attempt persists nothing, so the stored `attempt_count` is
//! unchanged and the record will be picked up again later.

use std::{sync::Arc, time::Duration};

use courier_core::{
    Clock, CoreError, DeliveryId, DeliveryRecord, DeliveryStatus, SendRequest,
    MAX_ATTEMPTS_REACHED,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result, TransportError},
    locks::AttemptLocks,
    storage::DeliveryLogStore,
    transport::{Envelope, Transport},
};

/// Configuration for attempts and retry sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Attempts allowed before a failed record is cancelled.
    pub max_attempts: u32,

    /// Interval between retry sweeps.
    pub sweep_period: Duration,

    /// Upper bound on a single transport call.
    pub transport_timeout: Duration,

    /// Whether sweeps also attempt PENDING records left behind by
    /// interrupted submits.
    pub recover_stale_pending: bool,

    /// Age after which a never-attempted PENDING record counts as stale.
    pub stale_pending_after: Duration,

    /// Grace period for in-flight work at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            sweep_period: Duration::from_secs(crate::DEFAULT_SWEEP_PERIOD_SECONDS),
            transport_timeout: Duration::from_secs(crate::DEFAULT_TRANSPORT_TIMEOUT_SECONDS),
            recover_stale_pending: true,
            stale_pending_after: Duration::from_secs(crate::DEFAULT_SWEEP_PERIOD_SECONDS),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks the values the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero attempts, periods or timeouts.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be greater than 0"));
        }
        if self.sweep_period.is_zero() {
            return Err(DeliveryError::configuration("sweep_period must be greater than 0"));
        }
        if self.transport_timeout.is_zero() {
            return Err(DeliveryError::configuration("transport_timeout must be greater than 0"));
        }
        Ok(())
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Send requests turned into delivery records.
    pub submitted: u64,
    /// Attempts that reached the transport.
    pub attempts: u64,
    /// Attempts persisted as SENT.
    pub sent: u64,
    /// Attempts persisted as FAILED.
    pub failed: u64,
    /// Records cancelled after exhausting their attempts.
    pub cancelled: u64,
    /// Attempts skipped because the record changed underneath them.
    pub superseded: u64,
    /// Attempts abandoned at shutdown without persisting.
    pub interrupted: u64,
    /// Transport calls currently running.
    pub in_flight: u64,
}

/// What an attempt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The transport accepted the message; persisted as SENT.
    Sent,
    /// The transport failed or timed out; persisted as FAILED.
    Failed,
    /// The record was cancelled after exhausting its attempts.
    Cancelled,
    /// The caller's snapshot was stale or already terminal; nothing done.
    Superseded,
    /// Aborted at shutdown; nothing persisted.
    Interrupted,
}

/// Result of an attempt together with the record as it now stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    /// What happened.
    pub outcome: AttemptOutcome,
    /// Stored record after the attempt.
    pub record: DeliveryRecord,
}

/// Creates delivery records and drives attempts against the transport.
pub struct DeliveryEngine {
    store: Arc<dyn DeliveryLogStore>,
    transport: Arc<dyn Transport>,
    config: DeliveryConfig,
    clock: Arc<dyn Clock>,
    locks: AttemptLocks,
    stats: Arc<RwLock<EngineStats>>,
    abort: CancellationToken,
}

impl DeliveryEngine {
    /// Creates an engine over the given store and transport.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid.
    pub fn new(
        store: Arc<dyn DeliveryLogStore>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            store,
            transport,
            config,
            clock,
            locks: AttemptLocks::new(),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            abort: CancellationToken::new(),
        })
    }

    /// Persists a new PENDING record for `request`, then attempts it once.
    ///
    /// Returns the record after that first attempt: SENT or FAILED, or still
    /// PENDING if the attempt was interrupted by shutdown.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails to save the record or its outcome.
    pub async fn submit(&self, request: SendRequest) -> Result<DeliveryRecord> {
        let record = self.create(request).await?;
        self.attempt(record).await
    }

    /// Persists a new PENDING record for `request` without attempting it.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails to save the record.
    pub async fn create(&self, request: SendRequest) -> Result<DeliveryRecord> {
        let record = DeliveryRecord::pending(request, self.clock.now_utc());
        let record = self.store.save(record).await?;

        self.stats.write().await.submitted += 1;
        info!(
            delivery_id = ?record.id,
            recipient = %record.recipient,
            "delivery record created"
        );

        Ok(record)
    }

    /// Attempts delivery of `record` once and returns the stored result.
    ///
    /// # Errors
    ///
    /// Returns error if the record was never saved or the store fails.
    pub async fn attempt(&self, record: DeliveryRecord) -> Result<DeliveryRecord> {
        self.attempt_with_outcome(record).await.map(|report| report.record)
    }

    /// Attempts delivery of `record` once and reports what happened.
    ///
    /// `record` is the caller's snapshot. If the stored record has moved on
    /// since, or is terminal, the call is superseded and nothing is sent.
    ///
    /// # Errors
    ///
    /// Returns error if the record was never saved or the store fails.
    pub async fn attempt_with_outcome(&self, record: DeliveryRecord) -> Result<AttemptReport> {
        let id = record.id.ok_or(DeliveryError::UnsavedRecord)?;
        let _guard = self.locks.acquire(id).await;

        let current = match self.current_if_unchanged(id, &record).await? {
            Ok(current) => current,
            Err(report) => return Ok(report),
        };

        let mut attempt = current.clone();
        attempt.begin_attempt(self.clock.now_utc());
        let attempt_number = attempt.attempt_count;

        let Some(result) = self.send(id, &attempt).await else {
            self.stats.write().await.interrupted += 1;
            warn!(
                delivery_id = %id,
                attempt = attempt_number,
                "delivery attempt interrupted by shutdown, nothing persisted"
            );
            return Ok(AttemptReport { outcome: AttemptOutcome::Interrupted, record: current });
        };

        let outcome = match result {
            Ok(()) => {
                attempt.mark_sent();
                AttemptOutcome::Sent
            },
            Err(error) => {
                warn!(
                    delivery_id = %id,
                    attempt = attempt_number,
                    error_kind = error.kind(),
                    permanent = error.is_permanent(),
                    error = %error,
                    "delivery attempt failed"
                );
                attempt.mark_failed(error.failure_message());
                AttemptOutcome::Failed
            },
        };

        let report = self.persist(id, attempt, outcome).await?;
        if report.outcome == AttemptOutcome::Sent {
            info!(delivery_id = %id, attempt = attempt_number, "email delivered");
        }
        Ok(report)
    }

    /// Moves a FAILED record that exhausted its attempts to CANCELLED.
    ///
    /// No transport call is made. Superseded like an attempt if the stored
    /// record changed since `record` was read.
    ///
    /// # Errors
    ///
    /// Returns `AttemptsRemaining` if the record has attempts left, or error
    /// if the record was never saved or the store fails.
    pub async fn cancel_exhausted(&self, record: DeliveryRecord) -> Result<AttemptReport> {
        let id = record.id.ok_or(DeliveryError::UnsavedRecord)?;
        let _guard = self.locks.acquire(id).await;

        let mut current = match self.current_if_unchanged(id, &record).await? {
            Ok(current) => current,
            Err(report) => return Ok(report),
        };

        if current.attempt_count < self.config.max_attempts {
            return Err(DeliveryError::AttemptsRemaining {
                id,
                attempt_count: current.attempt_count,
                max_attempts: self.config.max_attempts,
            });
        }

        current.mark_cancelled(MAX_ATTEMPTS_REACHED);
        let report = self.persist(id, current, AttemptOutcome::Cancelled).await?;

        if report.outcome == AttemptOutcome::Cancelled {
            warn!(
                delivery_id = %id,
                attempt_count = report.record.attempt_count,
                recipient = %report.record.recipient,
                "delivery cancelled after exhausting attempts"
            );
        }
        Ok(report)
    }

    /// Interrupts in-flight transport calls and every later attempt.
    ///
    /// Used when the shutdown grace period runs out.
    pub fn abort_in_flight(&self) {
        self.abort.cancel();
    }

    /// Returns true once [`DeliveryEngine::abort_in_flight`] was called.
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Engine configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Store the engine persists to.
    pub fn store(&self) -> Arc<dyn DeliveryLogStore> {
        self.store.clone()
    }

    /// Re-reads `id` and returns it if `snapshot` is still current and not
    /// terminal, or the superseded report otherwise.
    async fn current_if_unchanged(
        &self,
        id: DeliveryId,
        snapshot: &DeliveryRecord,
    ) -> Result<std::result::Result<DeliveryRecord, AttemptReport>> {
        let current = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;

        if current.version != snapshot.version || current.is_terminal() {
            self.stats.write().await.superseded += 1;
            debug!(
                delivery_id = %id,
                expected_version = snapshot.version,
                stored_version = current.version,
                status = %current.status,
                "record changed since it was read, skipping"
            );
            return Ok(Err(AttemptReport { outcome: AttemptOutcome::Superseded, record: current }));
        }

        Ok(Ok(current))
    }

    /// Runs the transport call bounded by the configured timeout.
    ///
    /// Returns `None` if the abort token fired first.
    async fn send(
        &self,
        id: DeliveryId,
        record: &DeliveryRecord,
    ) -> Option<std::result::Result<(), TransportError>> {
        let timeout = self.config.transport_timeout;
        let envelope = Envelope::from(record);
        let span = info_span!("transport_send", delivery_id = %id, attempt = record.attempt_count);

        {
            let mut stats = self.stats.write().await;
            stats.attempts += 1;
            stats.in_flight += 1;
        }

        let result = tokio::select! {
            biased;
            () = self.abort.cancelled() => None,
            result = tokio::time::timeout(timeout, self.transport.send(envelope)).instrument(span) => {
                Some(result.unwrap_or_else(|_elapsed| Err(TransportError::timeout(timeout))))
            },
        };

        self.stats.write().await.in_flight -= 1;
        result
    }

    /// Saves the outcome. A lost version race becomes `Superseded`.
    async fn persist(
        &self,
        id: DeliveryId,
        record: DeliveryRecord,
        outcome: AttemptOutcome,
    ) -> Result<AttemptReport> {
        match self.store.save(record).await {
            Ok(saved) => {
                {
                    let mut stats = self.stats.write().await;
                    match saved.status {
                        DeliveryStatus::Sent => stats.sent += 1,
                        DeliveryStatus::Failed => stats.failed += 1,
                        DeliveryStatus::Cancelled => stats.cancelled += 1,
                        DeliveryStatus::Pending => {},
                    }
                }
                Ok(AttemptReport { outcome, record: saved })
            },
            Err(err) if err.is_conflict() => {
                self.stats.write().await.superseded += 1;
                warn!(delivery_id = %id, error = %err, "outcome lost a concurrent write, discarded");
                let current = self
                    .store
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
                Ok(AttemptReport { outcome: AttemptOutcome::Superseded, record: current })
            },
            Err(err) => Err(err.into()),
        }
    }
}
