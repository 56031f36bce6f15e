//! Integration tests for model-switcher using mock backend processes
//!
//! These tests spawn real mock-backend servers and drive them through the
//! HTTP client, so every sleep and wake crosses a socket.

use model_switcher::backoff::RetryConfig;
use model_switcher::{
    BackendSpec, BackendStatus, Endpoint, FixedRam, HttpBackendClient, Registry, StartupPolicy,
    SwitchError, Switcher, SwitcherConfig, build_router,
};
use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// A running mock-backend server.
///
/// Waits for the server to signal readiness before returning.
/// Automatically kills the server when dropped.
struct MockServer {
    child: Child,
    port: u16,
}

impl MockServer {
    /// Spawn a mock-backend server and wait for it to be ready.
    async fn spawn(model: &str) -> Self {
        Self::spawn_with_args(model, &[]).await
    }

    async fn spawn_with_args(model: &str, extra_args: &[&str]) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_mock-backend"));
        cmd.args(["--port", "0", "--model", model, "--latency-ms", "5"])
            .args(extra_args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().expect("Failed to spawn mock-backend");

        let stdout = child.stdout.take().expect("Failed to capture stdout");
        let mut reader = BufReader::new(stdout).lines();

        let port = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = reader.next_line().await.expect("Failed to read stdout") {
                if let Some(port_str) = line.strip_prefix("READY ") {
                    return port_str.parse::<u16>().expect("Failed to parse port");
                }
            }
            panic!("Server never signaled READY");
        })
        .await
        .expect("Timeout waiting for server to be ready");

        Self { child, port }
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port)
    }

    async fn stats(&self) -> Value {
        reqwest::get(format!("http://127.0.0.1:{}/stats", self.port))
            .await
            .expect("Request failed")
            .json()
            .await
            .expect("Failed to parse response")
    }

    /// Put the server to sleep behind the switcher's back.
    async fn sleep(&self, level: u8) {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/sleep?level={}", self.port, level))
            .send()
            .await
            .expect("Sleep request failed");
    }

    /// Wake the server behind the switcher's back.
    async fn wake(&self) {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/wake_up", self.port))
            .send()
            .await
            .expect("Wake request failed");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

fn spec(id: &str, server: &MockServer, memory_gb: f64, startup: StartupPolicy) -> BackendSpec {
    BackendSpec::builder()
        .id(id)
        .name(format!("Model {id}"))
        .endpoint(server.endpoint())
        .memory_gb(memory_gb)
        .startup(startup)
        .build()
}

fn test_config() -> SwitcherConfig {
    SwitcherConfig::builder()
        .health_check_interval(Duration::from_millis(20))
        .max_health_checks(100)
        .sleep_confirmation(RetryConfig::exponential(
            5,
            Duration::from_millis(10),
            Duration::from_millis(80),
        ))
        .startup_resync(RetryConfig::exponential(
            3,
            Duration::from_millis(10),
            Duration::from_millis(40),
        ))
        .startup_resync_timeout(Duration::from_secs(2))
        .build()
}

fn switcher(specs: Vec<BackendSpec>, available_ram_gb: f64) -> Switcher {
    let registry = Arc::new(Registry::new(specs).unwrap());
    Switcher::new(
        registry,
        Arc::new(HttpBackendClient::new(Duration::from_secs(2))),
        Arc::new(FixedRam(available_ram_gb)),
        test_config(),
    )
}

fn status(switcher: &Switcher, id: &str) -> BackendStatus {
    switcher.registry().get(id).unwrap().status
}

#[tokio::test]
async fn test_switch_sleeps_current_and_wakes_target() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    switcher.switch("b", &CancellationToken::new()).await.unwrap();

    let a_stats = a.stats().await;
    assert_eq!(a_stats["sleeping"], true);
    assert_eq!(a_stats["sleep_level"], 1);
    assert_eq!(a_stats["sleep_count"], 1);
    assert_eq!(a_stats["wake_count"], 0);

    let b_stats = b.stats().await;
    assert_eq!(b_stats["sleeping"], false);
    assert_eq!(b_stats["wake_count"], 1);

    let state = switcher.list_state();
    assert_eq!(state.active.as_deref(), Some("b"));
    assert_eq!(status(&switcher, "a"), BackendStatus::Sleeping);
    assert_eq!(status(&switcher, "b"), BackendStatus::Active);
}

#[tokio::test]
async fn test_low_ram_sleeps_at_level_two() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 40.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        8.0,
    );

    switcher.switch("b", &CancellationToken::new()).await.unwrap();

    assert_eq!(a.stats().await["sleep_level"], 2);
}

#[tokio::test]
async fn test_switch_waits_for_warmup() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping", "--wake-delay-ms", "200"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    switcher.switch("b", &CancellationToken::new()).await.unwrap();

    let checks = b.stats().await["health_checks"].as_u64().unwrap();
    assert!(checks > 1, "expected repeated health checks, got {checks}");
    assert_eq!(status(&switcher, "b"), BackendStatus::Active);
}

#[tokio::test]
async fn test_failed_wake_rolls_back_to_previous() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping", "--fail-wake"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    let err = switcher
        .switch("b", &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        SwitchError::ActivateTarget { backend, source } => {
            assert_eq!(backend, "b");
            assert!(source.to_string().contains("500"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let a_stats = a.stats().await;
    assert_eq!(a_stats["sleep_count"], 1);
    assert_eq!(a_stats["wake_count"], 1);
    assert_eq!(a_stats["sleeping"], false);

    assert_eq!(switcher.list_state().active.as_deref(), Some("a"));
    assert_eq!(status(&switcher, "a"), BackendStatus::Active);
    assert_eq!(status(&switcher, "b"), BackendStatus::Error);
}

#[tokio::test]
async fn test_failed_sleep_leaves_target_untouched() {
    let a = MockServer::spawn_with_args("model-a", &["--fail-sleep"]).await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    let err = switcher
        .switch("b", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SwitchError::SleepCurrent { .. }));
    assert_eq!(b.stats().await["wake_count"], 0);
    assert_eq!(status(&switcher, "a"), BackendStatus::Error);
    assert_eq!(status(&switcher, "b"), BackendStatus::Sleeping);
}

#[tokio::test]
async fn test_startup_resync_adopts_reported_state() {
    // Config claims a is active, but b is the one actually awake
    let a = MockServer::spawn_with_args("model-a", &["--sleeping"]).await;
    let b = MockServer::spawn("model-b").await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );
    assert_eq!(switcher.list_state().active.as_deref(), Some("a"));

    switcher.start();
    tokio::time::timeout(Duration::from_secs(5), switcher.wait_for_init())
        .await
        .expect("startup resync never finished");

    assert_eq!(switcher.list_state().active.as_deref(), Some("b"));
    assert_eq!(status(&switcher, "a"), BackendStatus::Sleeping);
    assert_eq!(status(&switcher, "b"), BackendStatus::Active);

    switcher.shutdown().await;
}

#[tokio::test]
async fn test_resync_picks_up_out_of_band_changes() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    a.sleep(1).await;
    b.wake().await;

    let report = switcher.resync(&CancellationToken::new()).await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.active.as_deref(), Some("b"));
    assert_eq!(report.sleeping, vec!["a".to_string()]);
    assert_eq!(switcher.list_state().active.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_resync_marks_unreachable_backend_error() {
    let a = MockServer::spawn("model-a").await;

    // Grab a free port and release it so nothing is listening there
    let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let vacant_port = vacant.local_addr().unwrap().port();
    drop(vacant);

    let gone = BackendSpec::builder()
        .id("gone")
        .endpoint(Endpoint::new("127.0.0.1", vacant_port))
        .memory_gb(8.0)
        .startup(StartupPolicy::Sleep)
        .build();
    let switcher = switcher(vec![spec("a", &a, 16.0, StartupPolicy::Active), gone], 64.0);

    let report = switcher.resync(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.active.as_deref(), Some("a"));
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].backend, "gone");
    assert_eq!(status(&switcher, "gone"), BackendStatus::Error);
    assert_eq!(status(&switcher, "a"), BackendStatus::Active);
}

#[tokio::test]
async fn test_switch_over_http_api() {
    let a = MockServer::spawn("model-a").await;
    let b = MockServer::spawn_with_args("model-b", &["--sleeping"]).await;
    let switcher = switcher(
        vec![
            spec("a", &a, 16.0, StartupPolicy::Active),
            spec("b", &b, 24.0, StartupPolicy::Sleep),
        ],
        64.0,
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = build_router(switcher.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/switch"))
        .json(&json!({"id": "b"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.json::<Value>().await.unwrap(),
        json!({"status": "success", "active": "b"})
    );

    let models: Value = client
        .get(format!("http://{addr}/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["active"], "b");
    assert_eq!(models["backends"][0]["status"], "sleeping");
    assert_eq!(models["backends"][1]["status"], "active");

    let response = client
        .post(format!("http://{addr}/switch"))
        .json(&json!({"id": "missing"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
