//! Periodic retry of failed deliveries.
//!
//! Every sweep takes a snapshot of FAILED records and walks it in order.
//! Records that used up their attempts are cancelled without contacting the
//! transport; the rest get one more attempt. Sweeps also pick up PENDING
//! records whose first attempt never ran, which happens when shutdown
//! interrupts a submit after the record was created.
//!
//! Sweeps run back to back on a fixed rate and never overlap: the next sweep
//! is scheduled only after the current one returned.

use std::{ops::AddAssign, sync::Arc};

use chrono::TimeDelta;
use courier_core::{Clock, DeliveryRecord, DeliveryStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    engine::{AttemptOutcome, DeliveryEngine},
    error::Result,
};

/// Tally of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// FAILED records in the snapshot.
    pub examined: usize,
    /// Attempts made (retries and stale PENDING recoveries).
    pub attempted: usize,
    /// Attempts that ended SENT.
    pub sent: usize,
    /// Attempts that ended FAILED.
    pub failed: usize,
    /// Records moved to CANCELLED.
    pub cancelled: usize,
    /// Records skipped because they changed underneath the sweep.
    pub superseded: usize,
    /// Attempts interrupted by shutdown.
    pub interrupted: usize,
    /// Stale PENDING records attempted.
    pub recovered: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Sent => self.sent += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Cancelled => self.cancelled += 1,
            AttemptOutcome::Superseded => self.superseded += 1,
            AttemptOutcome::Interrupted => self.interrupted += 1,
        }
    }
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.examined += other.examined;
        self.attempted += other.attempted;
        self.sent += other.sent;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.superseded += other.superseded;
        self.interrupted += other.interrupted;
        self.recovered += other.recovered;
    }
}

/// Retries FAILED deliveries until they succeed or run out of attempts.
pub struct RetrySweeper {
    engine: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
}

impl RetrySweeper {
    /// Creates a sweeper driving attempts through `engine`.
    pub fn new(engine: Arc<DeliveryEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, clock }
    }

    /// Sweeps immediately, then once per sweep period, until `stop` fires.
    ///
    /// A failed sweep is logged and the schedule continues.
    ///
    /// # Errors
    ///
    /// Currently never returns an error.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let period = self.engine.config().sweep_period;
        info!(period_seconds = period.as_secs(), "retry sweeper started");

        while !stop.is_cancelled() {
            let started = self.clock.now();

            match self.sweep(&stop).await {
                Ok(report) if report == SweepReport::default() => debug!("sweep found no work"),
                Ok(report) => info!(
                    examined = report.examined,
                    attempted = report.attempted,
                    sent = report.sent,
                    failed = report.failed,
                    cancelled = report.cancelled,
                    superseded = report.superseded,
                    recovered = report.recovered,
                    "retry sweep completed"
                ),
                Err(error) => error!(error = %error, "retry sweep aborted"),
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            tokio::select! {
                () = self.clock.sleep(period.saturating_sub(elapsed)) => {},
                () = stop.cancelled() => break,
            }
        }

        info!("retry sweeper stopped");
        Ok(())
    }

    /// Runs a single sweep to completion.
    ///
    /// # Errors
    ///
    /// Returns the first store failure; the rest of the sweep is skipped.
    pub async fn run_once(&self) -> Result<SweepReport> {
        self.sweep(&CancellationToken::new()).await
    }

    async fn sweep(&self, stop: &CancellationToken) -> Result<SweepReport> {
        let mut report = self.retry_failed(stop).await?;

        if self.engine.config().recover_stale_pending {
            report += self.recover_stale_pending(stop).await?;
        }

        Ok(report)
    }

    async fn retry_failed(&self, stop: &CancellationToken) -> Result<SweepReport> {
        let max_attempts = self.engine.config().max_attempts;
        let failed = self.engine.store().find_by_status(DeliveryStatus::Failed).await?;
        let mut report = SweepReport { examined: failed.len(), ..Default::default() };

        for record in failed {
            if stop.is_cancelled() {
                break;
            }

            let outcome = if record.attempt_count >= max_attempts {
                self.engine.cancel_exhausted(record).await?.outcome
            } else {
                report.attempted += 1;
                self.engine.attempt_with_outcome(record).await?.outcome
            };
            report.record(outcome);
        }

        Ok(report)
    }

    async fn recover_stale_pending(&self, stop: &CancellationToken) -> Result<SweepReport> {
        let stale_after = TimeDelta::from_std(self.engine.config().stale_pending_after)
            .unwrap_or(TimeDelta::MAX);
        let cutoff = self.clock.now_utc().checked_sub_signed(stale_after);
        let Some(cutoff) = cutoff else {
            return Ok(SweepReport::default());
        };

        let stale: Vec<DeliveryRecord> = self
            .engine
            .store()
            .find_by_status(DeliveryStatus::Pending)
            .await?
            .into_iter()
            .filter(|record| record.attempt_count == 0 && record.created_at <= cutoff)
            .collect();

        let mut report = SweepReport::default();
        for record in stale {
            if stop.is_cancelled() {
                break;
            }

            info!(delivery_id = ?record.id, created_at = %record.created_at, "recovering stale pending delivery");
            report.attempted += 1;
            report.recovered += 1;
            let outcome = self.engine.attempt_with_outcome(record).await?.outcome;
            report.record(outcome);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_add_up() {
        let mut total = SweepReport { examined: 2, sent: 1, ..Default::default() };
        total += SweepReport { attempted: 3, recovered: 3, failed: 3, ..Default::default() };

        assert_eq!(total.examined, 2);
        assert_eq!(total.attempted, 3);
        assert_eq!(total.sent, 1);
        assert_eq!(total.failed, 3);
        assert_eq!(total.recovered, 3);
    }

    #[test]
    fn outcomes_are_tallied_separately() {
        let mut report = SweepReport::default();
        report.record(AttemptOutcome::Cancelled);
        report.record(AttemptOutcome::Superseded);
        report.record(AttemptOutcome::Superseded);

        assert_eq!(report.cancelled, 1);
        assert_eq!(report.superseded, 2);
        assert_eq!(report.sent, 0);
    }
}
