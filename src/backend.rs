//! Backends and the registry that holds them
//!
//! A [`Backend`] is one inference server: immutable identity and resource
//! profile from config, plus a mutable lifecycle status that only the switcher
//! changes. The [`Registry`] is built once at startup and never gains or loses
//! backends; callers outside the crate only ever see value snapshots.

use bon::Builder;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Network address of a backend's HTTP API
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Plain-HTTP URL for `path_and_query` on this endpoint
    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path_and_query)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// How a backend is brought up when the switcher starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupPolicy {
    /// Never started, never queried, never switched to
    Disabled,
    /// Loaded and put to sleep
    Sleep,
    /// Loaded and awake. Exactly one backend starts this way.
    Active,
}

/// Lifecycle status of a backend as the switcher believes it to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Disabled,
    Sleeping,
    Active,
    Switching,
    Error,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Disabled => "disabled",
            BackendStatus::Sleeping => "sleeping",
            BackendStatus::Active => "active",
            BackendStatus::Switching => "switching",
            BackendStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl From<StartupPolicy> for BackendStatus {
    fn from(policy: StartupPolicy) -> Self {
        match policy {
            StartupPolicy::Disabled => BackendStatus::Disabled,
            StartupPolicy::Sleep => BackendStatus::Sleeping,
            StartupPolicy::Active => BackendStatus::Active,
        }
    }
}

/// Static description of a backend, as read from config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct BackendSpec {
    #[builder(into)]
    pub id: String,
    /// Human readable name
    #[serde(default)]
    #[builder(into, default)]
    pub name: String,
    #[serde(flatten)]
    pub endpoint: Endpoint,
    /// Estimated resident footprint of the model in GB
    pub memory_gb: f64,
    pub startup: StartupPolicy,
}

#[derive(Debug)]
struct BackendState {
    status: BackendStatus,
    last_active: Option<DateTime<Utc>>,
}

/// One inference backend and its current lifecycle status
#[derive(Debug)]
pub struct Backend {
    spec: BackendSpec,
    // Status and timestamp change together under this lock.
    state: Mutex<BackendState>,
}

impl Backend {
    pub fn new(spec: BackendSpec) -> Self {
        let status = BackendStatus::from(spec.startup);
        let last_active = (status == BackendStatus::Active).then(Utc::now);
        Self {
            spec,
            state: Mutex::new(BackendState {
                status,
                last_active,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.spec.endpoint
    }

    pub fn memory_gb(&self) -> f64 {
        self.spec.memory_gb
    }

    pub fn startup(&self) -> StartupPolicy {
        self.spec.startup
    }

    pub fn is_disabled(&self) -> bool {
        self.spec.startup == StartupPolicy::Disabled
    }

    pub fn status(&self) -> BackendStatus {
        self.state.lock().status
    }

    pub fn last_active(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_active
    }

    pub(crate) fn mark_active(&self) {
        self.transition(BackendStatus::Active);
    }

    pub(crate) fn mark_sleeping(&self) {
        self.transition(BackendStatus::Sleeping);
    }

    pub(crate) fn mark_switching(&self) {
        self.transition(BackendStatus::Switching);
    }

    pub(crate) fn mark_error(&self) {
        self.transition(BackendStatus::Error);
    }

    fn transition(&self, status: BackendStatus) {
        let mut state = self.state.lock();
        if state.status == BackendStatus::Disabled {
            warn!(backend = %self.spec.id, to = %status, "Ignoring transition of disabled backend");
            return;
        }
        if state.status == status {
            return;
        }
        state.status = status;
        state.last_active = (status == BackendStatus::Active).then(Utc::now);
    }

    /// Copy of the backend's identity and current status
    pub fn snapshot(&self) -> BackendSnapshot {
        let state = self.state.lock();
        BackendSnapshot {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            endpoint: self.spec.endpoint.clone(),
            memory_gb: self.spec.memory_gb,
            startup: self.spec.startup,
            status: state.status,
            last_active: state.last_active,
        }
    }
}

/// Point-in-time copy of a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSnapshot {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub endpoint: Endpoint,
    pub memory_gb: f64,
    pub startup: StartupPolicy,
    pub status: BackendStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

/// Every backend plus the id of the one believed to be active
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub backends: Vec<BackendSnapshot>,
    pub active: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate backend id: {0}")]
    DuplicateId(String),
}

/// The fixed set of backends, in configuration order
#[derive(Debug)]
pub struct Registry {
    backends: Vec<Arc<Backend>>,
    index: HashMap<String, usize>,
    active: RwLock<Option<String>>,
}

impl Registry {
    /// Build the registry. The backend whose startup policy is `Active` is
    /// taken as the initially active one.
    pub fn new(specs: impl IntoIterator<Item = BackendSpec>) -> Result<Self, RegistryError> {
        let mut backends = Vec::new();
        let mut index = HashMap::new();

        for spec in specs {
            if index.contains_key(&spec.id) {
                return Err(RegistryError::DuplicateId(spec.id));
            }
            index.insert(spec.id.clone(), backends.len());
            backends.push(Arc::new(Backend::new(spec)));
        }

        let active = backends
            .iter()
            .find(|b| b.startup() == StartupPolicy::Active)
            .map(|b| b.id().to_string());

        Ok(Self {
            backends,
            index,
            active: RwLock::new(active),
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<BackendSnapshot> {
        self.backend(id).map(|b| b.snapshot())
    }

    pub fn list(&self) -> Vec<BackendSnapshot> {
        self.backends.iter().map(|b| b.snapshot()).collect()
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn state(&self) -> StateSnapshot {
        StateSnapshot {
            backends: self.list(),
            active: self.active_id(),
        }
    }

    pub(crate) fn set_active_id(&self, id: Option<String>) {
        *self.active.write() = id;
    }

    pub(crate) fn backend(&self, id: &str) -> Option<&Arc<Backend>> {
        self.index.get(id).map(|&i| &self.backends[i])
    }

    pub(crate) fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.iter()
    }
}
