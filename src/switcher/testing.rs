//! Shared fixtures for switcher tests

use super::{Switcher, SwitcherConfig};
use crate::backend::{BackendSpec, BackendStatus, Endpoint, Registry, StartupPolicy};
use crate::backoff::RetryConfig;
use crate::client::ScriptedClient;
use crate::ram::FixedRam;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint of fixture backend `id`
pub(crate) fn ep(id: &str) -> Endpoint {
    let port = match id {
        "a" => 8001,
        "b" => 8002,
        "c" => 8003,
        "d" => 8004,
        _ => 9999,
    };
    Endpoint::new(format!("vllm-{id}"), port)
}

pub(crate) fn quick_retry() -> RetryConfig {
    RetryConfig::exponential(3, Duration::from_millis(1), Duration::from_millis(4))
}

pub(crate) fn fast_config() -> SwitcherConfig {
    SwitcherConfig::builder()
        .health_check_interval(Duration::from_millis(1))
        .max_health_checks(5)
        .sleep_confirmation(quick_retry())
        .startup_resync(quick_retry())
        .startup_resync_timeout(Duration::from_secs(1))
        .build()
}

/// a: active, 16GB. b: sleeping, 24GB. c: disabled. d: sleeping, 40GB.
pub(crate) fn specs() -> Vec<BackendSpec> {
    let spec = |id: &str, memory_gb: f64, startup: StartupPolicy| {
        BackendSpec::builder()
            .id(id)
            .name(format!("Model {}", id.to_uppercase()))
            .endpoint(ep(id))
            .memory_gb(memory_gb)
            .startup(startup)
            .build()
    };
    vec![
        spec("a", 16.0, StartupPolicy::Active),
        spec("b", 24.0, StartupPolicy::Sleep),
        spec("c", 8.0, StartupPolicy::Disabled),
        spec("d", 40.0, StartupPolicy::Sleep),
    ]
}

pub(crate) fn fixture(available_ram_gb: f64) -> (Switcher, Arc<ScriptedClient>) {
    fixture_with(available_ram_gb, fast_config())
}

/// Switcher over [`specs`], with the scripted backends in the states their
/// startup policies describe
pub(crate) fn fixture_with(
    available_ram_gb: f64,
    config: SwitcherConfig,
) -> (Switcher, Arc<ScriptedClient>) {
    let registry = Arc::new(Registry::new(specs()).unwrap());
    let client = Arc::new(ScriptedClient::new());
    for id in ["b", "c", "d"] {
        client.set_sleeping(&ep(id), true);
    }
    let switcher = Switcher::new(
        registry,
        client.clone(),
        Arc::new(FixedRam(available_ram_gb)),
        config,
    );
    (switcher, client)
}

pub(crate) fn status(switcher: &Switcher, id: &str) -> BackendStatus {
    switcher.registry().get(id).unwrap().status
}
