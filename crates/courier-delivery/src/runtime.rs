//! Supervision of the ingestor and sweeper tasks.
//!
//! Shutdown runs in two phases. First the stop token is cancelled: both
//! loops stop taking new work and finish what they hold. If that does not
//! complete within the grace period, the engine aborts in-flight transport
//! calls; those attempts end without persisting anything.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    engine::DeliveryEngine,
    error::{DeliveryError, Result},
    ingestor::MessageIngestor,
    sweeper::RetrySweeper,
};

/// Time allowed for tasks to wind down after in-flight attempts are aborted.
const ABORT_GRACE: Duration = Duration::from_secs(5);

type TaskResult = (&'static str, Result<()>);

/// Running ingestor and sweeper loops.
pub struct DeliveryRuntime {
    engine: Arc<DeliveryEngine>,
    stop: CancellationToken,
    tasks: JoinSet<TaskResult>,
}

impl DeliveryRuntime {
    /// Spawns the ingestor and sweeper loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        engine: Arc<DeliveryEngine>,
        ingestor: MessageIngestor,
        sweeper: RetrySweeper,
    ) -> Self {
        let stop = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let token = stop.clone();
        tasks.spawn(async move { ("ingestor", ingestor.run(token).await) });

        let token = stop.clone();
        tasks.spawn(async move { ("sweeper", sweeper.run(token).await) });

        info!(tasks = tasks.len(), "delivery runtime started");
        Self { engine, stop, tasks }
    }

    /// Returns true while any supervised task is still running.
    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Stops both loops using the engine's configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// See [`DeliveryRuntime::shutdown_graceful`].
    pub async fn shutdown(self) -> Result<()> {
        let timeout = self.engine.config().shutdown_timeout;
        self.shutdown_graceful(timeout).await
    }

    /// Stops both loops, waiting up to `timeout` for in-flight work.
    ///
    /// # Errors
    ///
    /// Returns `TaskPanic` if a task panicked, or `ShutdownTimeout` if tasks
    /// were still running after in-flight attempts were aborted.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            tasks = self.tasks.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful delivery shutdown"
        );

        self.stop.cancel();

        let panic = match tokio::time::timeout(timeout, drain(&mut self.tasks)).await {
            Ok(panic) => panic,
            Err(_elapsed) => {
                warn!(
                    timeout_seconds = timeout.as_secs(),
                    "grace period expired, aborting in-flight delivery attempts"
                );
                self.engine.abort_in_flight();

                match tokio::time::timeout(ABORT_GRACE, drain(&mut self.tasks)).await {
                    Ok(panic) => panic,
                    Err(_elapsed) => {
                        error!(
                            remaining = self.tasks.len(),
                            "delivery tasks did not stop after abort, cancelling them"
                        );
                        self.tasks.abort_all();
                        return Err(DeliveryError::ShutdownTimeout { timeout });
                    },
                }
            },
        };

        if let Some(err) = panic {
            return Err(err);
        }

        info!("delivery runtime shutdown completed");
        Ok(())
    }
}

/// Joins every task, returning the first panic seen.
async fn drain(tasks: &mut JoinSet<TaskResult>) -> Option<DeliveryError> {
    let mut first_panic = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((task, Ok(()))) => info!(task, "delivery task stopped"),
            Ok((task, Err(error))) => {
                warn!(task, error = %error, "delivery task stopped with error");
            },
            Err(join_error) => {
                error!(error = %join_error, "delivery task panicked");
                first_panic.get_or_insert(DeliveryError::TaskPanic {
                    task: "delivery",
                    error: join_error.to_string(),
                });
            },
        }
    }

    first_panic
}

impl Drop for DeliveryRuntime {
    fn drop(&mut self) {
        if !self.tasks.is_empty() && !self.stop.is_cancelled() {
            error!(
                tasks = self.tasks.len(),
                "DeliveryRuntime dropped while running, cancelling tasks; call shutdown_graceful() \
                 before dropping"
            );
            self.stop.cancel();
            self.engine.abort_in_flight();
        }
    }
}
