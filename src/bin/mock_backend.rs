//! Mock vLLM backend for testing model-switcher
//!
//! `mock-backend --port 0 --model test-model`
//!
//! Simulates the vLLM sleep mode API endpoints for integration testing and
//! prints `READY <port>` once it is listening.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-backend")]
#[command(about = "Mock vLLM backend for testing")]
struct Args {
    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value = "8001")]
    port: u16,

    /// Model name reported by /stats
    #[arg(short, long, default_value = "test-model")]
    model: String,

    /// Start asleep
    #[arg(long)]
    sleeping: bool,

    /// Artificial latency for every response (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,

    /// How long /health reports 503 after a wake up (ms)
    #[arg(long, default_value = "0")]
    wake_delay_ms: u64,

    /// Answer /sleep with a 500
    #[arg(long)]
    fail_sleep: bool,

    /// Answer /wake_up with a 500
    #[arg(long)]
    fail_wake: bool,

    /// Never report healthy
    #[arg(long)]
    unhealthy: bool,
}

#[derive(Debug, Default)]
struct Counters {
    sleeping: bool,
    sleep_level: u8,
    sleep_count: u64,
    wake_count: u64,
    health_checks: u64,
    woken_at: Option<Instant>,
}

/// Server state
#[derive(Debug)]
struct MockState {
    model: String,
    counters: RwLock<Counters>,
    latency: Duration,
    wake_delay: Duration,
    fail_sleep: bool,
    fail_wake: bool,
    unhealthy: bool,
}

impl MockState {
    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_backend=debug")
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let state = Arc::new(MockState {
        model: args.model.clone(),
        counters: RwLock::new(Counters {
            sleeping: args.sleeping,
            ..Counters::default()
        }),
        latency: Duration::from_millis(args.latency_ms),
        wake_delay: Duration::from_millis(args.wake_delay_ms),
        fail_sleep: args.fail_sleep,
        fail_wake: args.fail_wake,
        unhealthy: args.unhealthy,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/is_sleeping", get(is_sleeping))
        .route("/sleep", post(sleep))
        .route("/wake_up", post(wake_up))
        .route("/stats", get(stats))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", args.port);
    let listener = TcpListener::bind(&addr).await?;

    // Get the actual port (important when port=0 for dynamic allocation)
    let actual_port = listener.local_addr()?.port();

    info!(model = %args.model, port = actual_port, "Mock backend listening");

    // Signal readiness to stdout for test harness
    // Format: "READY <port>" on its own line
    println!("READY {}", actual_port);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check endpoint. vLLM stays healthy while asleep.
async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.simulate_latency().await;
    let mut counters = state.counters.write().await;
    counters.health_checks += 1;

    if state.unhealthy {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match counters.woken_at {
        Some(woken_at) if woken_at.elapsed() < state.wake_delay => {
            info!("Health check: still warming up");
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::OK,
    }
}

#[derive(Serialize)]
struct IsSleepingResponse {
    is_sleeping: bool,
}

async fn is_sleeping(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.simulate_latency().await;
    Json(IsSleepingResponse {
        is_sleeping: state.counters.read().await.sleeping,
    })
}

#[derive(Deserialize)]
struct SleepQuery {
    level: Option<u8>,
}

/// Sleep endpoint - put model to sleep
async fn sleep(
    State(state): State<Arc<MockState>>,
    Query(query): Query<SleepQuery>,
) -> impl IntoResponse {
    state.simulate_latency().await;
    let level = query.level.unwrap_or(1);
    let mut counters = state.counters.write().await;
    counters.sleep_count += 1;

    if state.fail_sleep {
        warn!(level, "Refusing to sleep");
        return (StatusCode::INTERNAL_SERVER_ERROR, "sleep failed: mock fault");
    }

    info!(level, "Putting model to sleep");
    counters.sleeping = true;
    counters.sleep_level = level;
    (StatusCode::OK, "")
}

/// Wake up endpoint
async fn wake_up(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.simulate_latency().await;
    let mut counters = state.counters.write().await;
    counters.wake_count += 1;

    if state.fail_wake {
        warn!("Refusing to wake up");
        return (StatusCode::INTERNAL_SERVER_ERROR, "wake_up failed: mock fault");
    }

    info!("Waking up model");
    counters.sleeping = false;
    counters.woken_at = Some(Instant::now());
    (StatusCode::OK, "")
}

#[derive(Serialize)]
struct StatsResponse {
    model: String,
    sleeping: bool,
    sleep_level: u8,
    sleep_count: u64,
    wake_count: u64,
    health_checks: u64,
}

/// Stats endpoint for testing inspection
async fn stats(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let counters = state.counters.read().await;
    Json(StatsResponse {
        model: state.model.clone(),
        sleeping: counters.sleeping,
        sleep_level: counters.sleep_level,
        sleep_count: counters.sleep_count,
        wake_count: counters.wake_count,
        health_checks: counters.health_checks,
    })
}
