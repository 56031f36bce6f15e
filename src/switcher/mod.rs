//! Switching controller
//!
//! The [`Switcher`] is the only writer of backend status. It serializes
//! switches behind one lock, drives the sleep-then-wake sequence, and keeps
//! the registry honest by periodically asking every backend whether it is
//! asleep (see [`Switcher::resync`]).
//!
//! A switch from A to B is strictly sequential: A is put to sleep (and the
//! sleep confirmed, or at least attempted) before B is asked to wake, because
//! the accelerator cannot hold both.

use crate::backend::{Backend, Registry, StateSnapshot};
use crate::backoff::{PollError, RetryConfig, poll_until};
use crate::client::BackendClient;
use crate::ram::RamOracle;
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

mod policy;
mod resync;
#[cfg(test)]
pub(crate) mod testing;

pub use policy::determine_sleep_level;
pub use resync::{ResyncError, ResyncFailure, ResyncReport};

/// Timing knobs for switching and reconciliation
#[derive(Debug, Clone, Builder)]
pub struct SwitcherConfig {
    /// Pause between health checks while waiting for a woken backend
    #[builder(default = Duration::from_secs(2))]
    pub health_check_interval: Duration,

    /// Health checks before a woken backend is declared failed
    #[builder(default = 450)]
    pub max_health_checks: u32,

    /// Polling policy for confirming that a backend went to sleep
    #[builder(default = RetryConfig::exponential(10, Duration::from_millis(100), Duration::from_millis(3200)))]
    pub sleep_confirmation: RetryConfig,

    #[builder(default = Duration::from_secs(30))]
    pub resync_interval: Duration,

    /// Upper bound on one periodic resync pass
    #[builder(default = Duration::from_secs(10))]
    pub resync_timeout: Duration,

    /// Retry policy for the resync run at startup
    #[builder(default = RetryConfig::exponential(5, Duration::from_millis(100), Duration::from_millis(1600)))]
    pub startup_resync: RetryConfig,

    /// Upper bound on each startup resync attempt
    #[builder(default = Duration::from_secs(5))]
    pub startup_resync_timeout: Duration,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Errors from the switcher
#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("backend not found: {0}")]
    NotFound(String),

    #[error("backend {0} is disabled and cannot be activated")]
    Disabled(String),

    #[error("failed to sleep current backend {backend}: {source}")]
    SleepCurrent {
        backend: String,
        source: crate::client::ClientError,
    },

    #[error("failed to activate target backend {backend}: {source}")]
    ActivateTarget {
        backend: String,
        source: crate::client::ClientError,
    },

    #[error("backend {backend} failed to become healthy after {attempts} health checks")]
    Unhealthy { backend: String, attempts: u32 },

    #[error("switch cancelled")]
    Cancelled,
}

struct SwitcherInner {
    registry: Arc<Registry>,
    client: Arc<dyn BackendClient>,
    ram: Arc<dyn RamOracle>,
    config: SwitcherConfig,
    switch_lock: Mutex<()>,
    resync_lock: Mutex<()>,
    shutdown: CancellationToken,
    initialized: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinates sleep/wake transitions between backends
pub struct Switcher {
    inner: Arc<SwitcherInner>,
}

impl Clone for Switcher {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Switcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switcher")
            .field("registry", &self.inner.registry)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Switcher {
    /// Create a switcher over `registry`. Background reconciliation does not
    /// run until [`Switcher::start`] is called.
    pub fn new(
        registry: Arc<Registry>,
        client: Arc<dyn BackendClient>,
        ram: Arc<dyn RamOracle>,
        config: SwitcherConfig,
    ) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            inner: Arc::new(SwitcherInner {
                registry,
                client,
                ram,
                config,
                switch_lock: Mutex::new(()),
                resync_lock: Mutex::new(()),
                shutdown: CancellationToken::new(),
                initialized,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &SwitcherConfig {
        &self.inner.config
    }

    /// Every backend and the believed-active id. Never waits on a switch.
    pub fn list_state(&self) -> StateSnapshot {
        self.inner.registry.state()
    }

    /// Make `target_id` the active backend.
    ///
    /// At most one switch runs at a time; callers queue on the switch lock.
    /// Switching to the backend that is already active does nothing.
    ///
    /// On failure the registry reflects the last step that completed:
    /// - sleep command failed: the current backend is `Error`, the target was
    ///   never touched
    /// - wake command failed: the target is `Error` and the previous backend is
    ///   woken again on a best-effort basis; the active id is unchanged
    /// - target never became healthy: the target is `Error`, no rollback
    #[instrument(skip(self, cancel))]
    pub async fn switch(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SwitchError> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SwitchError::Cancelled),
            guard = self.inner.switch_lock.lock() => guard,
        };

        let registry = &self.inner.registry;
        let target = registry
            .backend(target_id)
            .ok_or_else(|| SwitchError::NotFound(target_id.to_string()))?;
        if target.is_disabled() {
            return Err(SwitchError::Disabled(target_id.to_string()));
        }

        let current_id = registry.active_id();
        if current_id.as_deref() == Some(target_id) {
            debug!(backend = %target_id, "Backend already active");
            return Ok(());
        }
        let current = current_id.as_deref().and_then(|id| registry.backend(id));

        info!(from = ?current_id, to = %target_id, "Starting backend switch");

        if let Some(current) = current {
            self.sleep_backend(current, cancel).await?;
        }

        target.mark_switching();
        info!(backend = %target_id, "Waking backend");
        if let Err(e) = self.inner.client.wake_up(target.endpoint(), cancel).await {
            target.mark_error();
            error!(backend = %target_id, error = %e, "Failed to wake backend");
            if let Some(previous) = current {
                self.rollback(previous).await;
            }
            if e.is_cancelled() {
                return Err(SwitchError::Cancelled);
            }
            return Err(SwitchError::ActivateTarget {
                backend: target_id.to_string(),
                source: e,
            });
        }

        self.await_healthy(target, cancel).await?;

        target.mark_active();
        registry.set_active_id(Some(target_id.to_string()));
        info!(from = ?current_id, to = %target_id, "Switch complete");
        Ok(())
    }

    async fn sleep_backend(
        &self,
        backend: &Backend,
        cancel: &CancellationToken,
    ) -> Result<(), SwitchError> {
        let client = &self.inner.client;
        let endpoint = backend.endpoint();
        backend.mark_switching();

        let available_gb = self.inner.ram.available_ram_gb();
        let level = determine_sleep_level(available_gb, backend.memory_gb());
        info!(
            backend = %backend.id(),
            level = %level,
            available_gb,
            memory_gb = backend.memory_gb(),
            "Putting backend to sleep"
        );

        if let Err(e) = client.sleep(endpoint, level, cancel).await {
            backend.mark_error();
            if e.is_cancelled() {
                warn!(backend = %backend.id(), "Switch cancelled during sleep command");
                return Err(SwitchError::Cancelled);
            }
            error!(backend = %backend.id(), error = %e, "Failed to sleep backend");
            return Err(SwitchError::SleepCurrent {
                backend: backend.id().to_string(),
                source: e,
            });
        }

        let confirmed = poll_until(&self.inner.config.sleep_confirmation, cancel, || {
            client.is_sleeping(endpoint, cancel)
        })
        .await;

        // The sleep command was accepted, so the backend counts as asleep
        // whether or not the confirmation came through.
        backend.mark_sleeping();
        match confirmed {
            Ok(()) => debug!(backend = %backend.id(), "Sleep confirmed"),
            Err(PollError::Cancelled) => return Err(SwitchError::Cancelled),
            Err(PollError::Predicate(e)) if e.is_cancelled() => {
                return Err(SwitchError::Cancelled);
            }
            Err(e) => {
                warn!(backend = %backend.id(), error = %e, "Could not confirm sleep state, assuming success");
            }
        }
        info!(backend = %backend.id(), "Backend is sleeping");
        Ok(())
    }

    async fn await_healthy(
        &self,
        backend: &Backend,
        cancel: &CancellationToken,
    ) -> Result<(), SwitchError> {
        let config = &self.inner.config;
        let policy = RetryConfig::fixed(config.max_health_checks, config.health_check_interval);
        let client = &self.inner.client;
        let endpoint = backend.endpoint();
        let id = backend.id();
        let max = policy.max_attempts;

        let mut attempt = 0u32;
        let result = poll_until(&policy, cancel, || {
            attempt += 1;
            let attempt = attempt;
            async move {
                debug!(backend = %id, attempt, max, "Health check");
                match client.health(endpoint, cancel).await {
                    Ok(healthy) => Ok(healthy),
                    Err(e) if e.is_cancelled() => Err(e),
                    Err(e) => {
                        debug!(backend = %id, error = %e, "Health check failed");
                        Ok(false)
                    }
                }
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!(backend = %id, "Backend is active and healthy");
                Ok(())
            }
            Err(PollError::NotMet { attempts }) => {
                backend.mark_error();
                error!(backend = %id, attempts, "Backend failed to become healthy");
                Err(SwitchError::Unhealthy {
                    backend: id.to_string(),
                    attempts,
                })
            }
            Err(PollError::Cancelled) | Err(PollError::Predicate(_)) => {
                backend.mark_error();
                warn!(backend = %id, "Switch cancelled while waiting for health");
                Err(SwitchError::Cancelled)
            }
        }
    }

    /// Best-effort wake of the backend that was active before a failed switch.
    /// Runs on the switcher's own token so a cancelled request still gets it.
    /// Its failure is logged and never returned.
    async fn rollback(&self, previous: &Backend) {
        warn!(backend = %previous.id(), "Attempting to reactivate previous backend");
        previous.mark_switching();
        match self
            .inner
            .client
            .wake_up(previous.endpoint(), &self.inner.shutdown)
            .await
        {
            Ok(()) => {
                previous.mark_active();
                info!(backend = %previous.id(), "Previous backend reactivated");
            }
            Err(e) => {
                previous.mark_error();
                error!(backend = %previous.id(), error = %e, "Failed to reactivate previous backend");
            }
        }
    }

    /// Spawn the startup resync and the periodic resync. Calling it twice
    /// does nothing.
    pub fn start(&self) {
        let mut tasks = self.inner.tasks.lock();
        if !tasks.is_empty() {
            warn!("Switcher background tasks already running");
            return;
        }
        tasks.push(tokio::spawn(self.clone().startup_resync()));
        tasks.push(tokio::spawn(self.clone().periodic_resync()));
    }

    /// Resolves once the startup resync has finished, successfully or not.
    /// Never resolves if [`Switcher::start`] was not called.
    pub async fn wait_for_init(&self) {
        let mut initialized = self.inner.initialized.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = initialized.wait_for(|done| *done).await;
    }

    /// Stop the background tasks and wait for them to exit
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Switcher background task failed");
            }
        }
        debug!("Switcher shut down");
    }
}
