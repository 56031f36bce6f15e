//! Reconciliation against the backends' own view of their state
//!
//! The registry is a cache. Containers restart and operators poke backends
//! directly, so the switcher periodically asks every enabled backend whether
//! it is asleep and overwrites its statuses with the answers.

use super::Switcher;
use crate::backoff::{RetryError, retry_with_backoff_if};
use crate::client::ClientError;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A backend that could not be queried during a resync
#[derive(Debug, Clone)]
pub struct ResyncFailure {
    pub backend: String,
    pub error: ClientError,
}

/// Outcome of one resync pass
#[derive(Debug, Clone, Default)]
pub struct ResyncReport {
    /// The backend now recorded as active
    pub active: Option<String>,
    pub sleeping: Vec<String>,
    /// Backends that also reported awake after `active` was chosen. They are
    /// marked active too; on a shared accelerator this should never happen.
    pub conflicts: Vec<String>,
    /// Backends whose query failed. They are marked `Error`.
    pub failed: Vec<ResyncFailure>,
}

impl ResyncReport {
    /// Every enabled backend answered
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    #[error("resync cancelled")]
    Cancelled,

    #[error("resync timed out after {0:?}")]
    TimedOut(Duration),

    #[error("could not query backends: {}", .0.join(", "))]
    Unreachable(Vec<String>),
}

impl Switcher {
    /// Run one reconciliation pass.
    ///
    /// A backend that cannot be queried is marked `Error` and the pass moves
    /// on; the failure is reported in [`ResyncReport::failed`], not as an
    /// error. The first backend found awake becomes the active one, and if
    /// none is awake the active id is cleared. Cancellation stops the pass
    /// before the active id is touched.
    ///
    /// Passes never overlap: a second caller waits for the first to finish.
    pub async fn resync(&self, cancel: &CancellationToken) -> Result<ResyncReport, ResyncError> {
        let _pass = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResyncError::Cancelled),
            guard = self.inner.resync_lock.lock() => guard,
        };
        self.resync_pass(cancel).await
    }

    #[instrument(skip_all)]
    async fn resync_pass(&self, cancel: &CancellationToken) -> Result<ResyncReport, ResyncError> {
        let mut report = ResyncReport::default();

        for backend in self.inner.registry.backends() {
            if backend.is_disabled() {
                continue;
            }
            let id = backend.id().to_string();

            match self.inner.client.is_sleeping(backend.endpoint(), cancel).await {
                Ok(true) => {
                    backend.mark_sleeping();
                    report.sleeping.push(id);
                }
                Ok(false) => {
                    backend.mark_active();
                    if report.active.is_none() {
                        report.active = Some(id);
                    } else {
                        report.conflicts.push(id);
                    }
                }
                Err(e) if e.is_cancelled() => {
                    debug!(backend = %id, "Resync cancelled");
                    return Err(ResyncError::Cancelled);
                }
                Err(e) => {
                    backend.mark_error();
                    warn!(backend = %id, endpoint = %backend.endpoint(), error = %e, "Resync failed to query backend");
                    report.failed.push(ResyncFailure {
                        backend: id,
                        error: e,
                    });
                }
            }
        }

        if !report.conflicts.is_empty() {
            warn!(
                active = ?report.active,
                conflicts = ?report.conflicts,
                "More than one backend reports awake, keeping the first as active"
            );
        }

        self.inner.registry.set_active_id(report.active.clone());
        debug!(
            active = ?report.active,
            sleeping = report.sleeping.len(),
            failed = report.failed.len(),
            "Resync pass complete"
        );
        Ok(report)
    }

    /// One resync bounded by `timeout`. Partial failures count as errors here
    /// so the startup retry tries again.
    async fn resync_within(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResyncReport, ResyncError> {
        let report = tokio::time::timeout(timeout, self.resync(cancel))
            .await
            .map_err(|_| ResyncError::TimedOut(timeout))??;

        if report.is_complete() {
            Ok(report)
        } else {
            Err(ResyncError::Unreachable(
                report.failed.into_iter().map(|f| f.backend).collect(),
            ))
        }
    }

    /// Startup reconciliation. Marks the switcher initialized when done,
    /// whatever the outcome.
    pub(super) async fn startup_resync(self) {
        let shutdown = self.inner.shutdown.clone();
        let policy = self.inner.config.startup_resync;
        let timeout = self.inner.config.startup_resync_timeout;

        let result = retry_with_backoff_if(
            &policy,
            &shutdown,
            |e: &ResyncError| !matches!(e, ResyncError::Cancelled),
            || self.resync_within(timeout, &shutdown),
        )
        .await;

        match result {
            Ok(report) => info!(active = ?report.active, "Initial resync completed"),
            Err(RetryError::Cancelled) | Err(RetryError::Aborted(ResyncError::Cancelled)) => {
                debug!("Initial resync cancelled");
            }
            Err(e) => warn!(error = %e, "Initial resync failed"),
        }

        self.inner.initialized.send_replace(true);
    }

    /// Reconciliation on a fixed period until shutdown. A tick is skipped
    /// while a switch or another resync is running. The switch lock is held
    /// for the whole pass, so a switch requested meanwhile waits for it.
    pub(super) async fn periodic_resync(self) {
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.resync_interval;
        let timeout = self.inner.config.resync_timeout;

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Ok(_switching) = self.inner.switch_lock.try_lock() else {
                debug!("Switch in progress, skipping periodic resync");
                continue;
            };
            let Ok(_pass) = self.inner.resync_lock.try_lock() else {
                debug!("Resync already running, skipping periodic resync");
                continue;
            };

            match tokio::time::timeout(timeout, self.resync_pass(&shutdown)).await {
                Ok(Ok(report)) if report.is_complete() => {
                    debug!(active = ?report.active, "Periodic resync complete");
                }
                Ok(Ok(report)) => {
                    let failed: Vec<_> = report.failed.iter().map(|f| f.backend.as_str()).collect();
                    warn!(?failed, "Periodic resync could not reach every backend");
                }
                Ok(Err(_)) => break,
                Err(_) => warn!(timeout = ?timeout, "Periodic resync timed out"),
            }
        }
        debug!("Periodic resync stopped");
    }
}
