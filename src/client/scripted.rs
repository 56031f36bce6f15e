//! In-memory stand-in for a fleet of backends
//!
//! Each endpoint behaves like a well-mannered server: `sleep` puts it to
//! sleep, `wake_up` wakes it, and unknown endpoints start awake. Per-operation
//! overrides replace that behaviour when a test needs failures, and every call
//! lands in one ordered log so tests can assert on sequencing.

use super::{BackendClient, ClientError, Operation, SleepLevel};
use crate::backend::Endpoint;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One recorded client call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Health(Endpoint),
    IsSleeping(Endpoint),
    Sleep(Endpoint, SleepLevel),
    WakeUp(Endpoint),
}

impl Call {
    pub fn endpoint(&self) -> &Endpoint {
        match self {
            Call::Health(ep) | Call::IsSleeping(ep) | Call::WakeUp(ep) => ep,
            Call::Sleep(ep, _) => ep,
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Call::Health(_) => Operation::Health,
            Call::IsSleeping(_) => Operation::IsSleeping,
            Call::Sleep(..) => Operation::Sleep,
            Call::WakeUp(_) => Operation::WakeUp,
        }
    }
}

type Override<T> = Arc<dyn Fn(&Endpoint) -> Result<T, ClientError> + Send + Sync>;

#[derive(Default)]
struct Script {
    sleeping: HashMap<Endpoint, bool>,
    calls: Vec<Call>,
    health: Option<Override<bool>>,
    is_sleeping: Option<Override<bool>>,
    sleep: Option<Override<()>>,
    wake_up: Option<Override<()>>,
    latency: Duration,
}

/// Scripted [`BackendClient`] that records every call
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<Script>,
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let script = self.script.lock();
        f.debug_struct("ScriptedClient")
            .field("sleeping", &script.sleeping)
            .field("calls", &script.calls.len())
            .field("latency", &script.latency)
            .finish_non_exhaustive()
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set what `is_sleeping` reports for `endpoint`
    pub fn set_sleeping(&self, endpoint: &Endpoint, sleeping: bool) {
        self.script.lock().sleeping.insert(endpoint.clone(), sleeping);
    }

    pub fn is_marked_sleeping(&self, endpoint: &Endpoint) -> bool {
        self.script
            .lock()
            .sleeping
            .get(endpoint)
            .copied()
            .unwrap_or(false)
    }

    /// Delay applied to every call before it answers. Cancellation cuts it short.
    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().latency = latency;
    }

    pub fn on_health<F>(&self, f: F)
    where
        F: Fn(&Endpoint) -> Result<bool, ClientError> + Send + Sync + 'static,
    {
        self.script.lock().health = Some(Arc::new(f));
    }

    pub fn on_is_sleeping<F>(&self, f: F)
    where
        F: Fn(&Endpoint) -> Result<bool, ClientError> + Send + Sync + 'static,
    {
        self.script.lock().is_sleeping = Some(Arc::new(f));
    }

    /// Override `sleep`. The endpoint only goes to sleep when `f` returns `Ok`.
    pub fn on_sleep<F>(&self, f: F)
    where
        F: Fn(&Endpoint) -> Result<(), ClientError> + Send + Sync + 'static,
    {
        self.script.lock().sleep = Some(Arc::new(f));
    }

    /// Override `wake_up`. The endpoint only wakes when `f` returns `Ok`.
    pub fn on_wake_up<F>(&self, f: F)
    where
        F: Fn(&Endpoint) -> Result<(), ClientError> + Send + Sync + 'static,
    {
        self.script.lock().wake_up = Some(Arc::new(f));
    }

    /// Every call so far, in the order they were made
    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().calls.clone()
    }

    pub fn sleep_calls(&self) -> Vec<(Endpoint, SleepLevel)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Sleep(ep, level) => Some((ep, level)),
                _ => None,
            })
            .collect()
    }

    pub fn wake_calls(&self) -> Vec<Endpoint> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::WakeUp(ep) => Some(ep),
                _ => None,
            })
            .collect()
    }

    /// Only the state-changing calls (`sleep` and `wake_up`)
    pub fn commands(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Sleep(..) | Call::WakeUp(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.script.lock().calls.clear();
    }

    // Records the call, then waits out the latency.
    async fn begin(&self, call: Call, cancel: &CancellationToken) -> Result<(), ClientError> {
        let op = call.operation();
        let endpoint = call.endpoint().clone();
        let latency = {
            let mut script = self.script.lock();
            script.calls.push(call);
            script.latency
        };

        if cancel.is_cancelled() {
            return Err(ClientError::cancelled(op, &endpoint));
        }
        if !latency.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ClientError::cancelled(op, &endpoint)),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for ScriptedClient {
    async fn health(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        self.begin(Call::Health(endpoint.clone()), cancel).await?;
        let f = self.script.lock().health.clone();
        match f {
            Some(f) => f(endpoint),
            None => Ok(true),
        }
    }

    async fn is_sleeping(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<bool, ClientError> {
        self.begin(Call::IsSleeping(endpoint.clone()), cancel).await?;
        let f = self.script.lock().is_sleeping.clone();
        match f {
            Some(f) => f(endpoint),
            None => Ok(self.is_marked_sleeping(endpoint)),
        }
    }

    async fn sleep(
        &self,
        endpoint: &Endpoint,
        level: SleepLevel,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.begin(Call::Sleep(endpoint.clone(), level), cancel).await?;
        let f = self.script.lock().sleep.clone();
        if let Some(f) = f {
            f(endpoint)?;
        }
        self.set_sleeping(endpoint, true);
        Ok(())
    }

    async fn wake_up(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        self.begin(Call::WakeUp(endpoint.clone()), cancel).await?;
        let f = self.script.lock().wake_up.clone();
        if let Some(f) = f {
            f(endpoint)?;
        }
        self.set_sleeping(endpoint, false);
        Ok(())
    }
}
