//! # Model Switcher
//!
//! Keeps exactly one of several vLLM-style inference backends awake on a
//! shared accelerator, putting the others to sleep.
//!
//! This crate provides:
//! - **Switcher**: serializes switches and drives the sleep-then-wake sequence,
//!   with rollback when the target fails to wake
//! - **Resync**: reconciles the in-memory view with what backends report, at
//!   startup and on a fixed period
//! - **Backend client**: the four calls made to a backend's sleep mode API
//! - **Router**: a small HTTP API (`/health`, `/models`, `/switch`)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     model-switcher                       │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Router: GET /models, POST /switch                  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                           │                              │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ Switcher                                           │  │
//! │  │ - Registry: Disabled | Sleeping | Active |         │  │
//! │  │             Switching | Error                      │  │
//! │  │ - switch lock, startup + periodic resync           │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                           │ BackendClient                │
//! │       ┌───────────────────┼───────────────────┐          │
//! │       ▼                   ▼                   ▼          │
//! │  [vLLM:8001]         [vLLM:8002]         [vLLM:8003]     │
//! │   (active)           (sleeping)          (sleeping)      │
//! └──────────────────────────────────────────────────────────┘
//! ```

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use tracing::{info, instrument};

pub mod backend;
pub mod backoff;
pub mod client;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod ram;
pub mod switcher;

pub use backend::{
    BackendSnapshot, BackendSpec, BackendStatus, Endpoint, Registry, StartupPolicy, StateSnapshot,
};
pub use client::{BackendClient, ClientError, HttpBackendClient, ScriptedClient, SleepLevel};
pub use ram::{FixedRam, RamOracle, SystemRam};
pub use switcher::{SwitchError, Switcher, SwitcherConfig};

/// Build the router for the switcher API
/// This creates routes for:
/// - `/health` - Liveness of the switcher itself
/// - `/models` - Every backend and which one is active
/// - `/switch` - Make another backend active
#[instrument(skip(switcher))]
pub fn build_router(switcher: Switcher) -> Router {
    info!("Building router");
    Router::new()
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::models))
        .route("/switch", post(handlers::switch))
        .with_state(switcher)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` must be `'static` because the layer outlives any caller.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
